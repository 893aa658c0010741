use std::fmt;
use std::str::FromStr;

pub const BINANCE_SPOT_KLINES_URL: &str = "https://api.binance.com/api/v3/klines";
pub const BINANCE_FUTURES_KLINES_URL: &str = "https://fapi.binance.com/fapi/v1/klines";
pub const BYBIT_KLINES_URL: &str = "https://api.bybit.com/v2/public/kline/list";
pub const MEXC_KLINES_URL: &str = "https://api.mexc.com/api/v3/klines";
pub const KUCOIN_CANDLES_URL: &str = "https://api.kucoin.com/api/v1/market/candles";

// Seconds of history per candle for exchanges that take a time window.
const SECONDS_PER_CANDLE: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OhlcvProvider {
    BinanceSpot,
    BinanceFutures,
    Bybit,
    Mexc,
    KuCoin,
}

impl OhlcvProvider {
    pub const ALL: [OhlcvProvider; 5] = [
        OhlcvProvider::BinanceSpot,
        OhlcvProvider::BinanceFutures,
        OhlcvProvider::Bybit,
        OhlcvProvider::Mexc,
        OhlcvProvider::KuCoin,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            OhlcvProvider::BinanceSpot => "binance_spot",
            OhlcvProvider::BinanceFutures => "binance_futures",
            OhlcvProvider::Bybit => "bybit",
            OhlcvProvider::Mexc => "mexc",
            OhlcvProvider::KuCoin => "kucoin",
        }
    }

    pub fn default_url(&self) -> &'static str {
        match self {
            OhlcvProvider::BinanceSpot => BINANCE_SPOT_KLINES_URL,
            OhlcvProvider::BinanceFutures => BINANCE_FUTURES_KLINES_URL,
            OhlcvProvider::Bybit => BYBIT_KLINES_URL,
            OhlcvProvider::Mexc => MEXC_KLINES_URL,
            OhlcvProvider::KuCoin => KUCOIN_CANDLES_URL,
        }
    }

    // `now_secs` is the current Unix time.
    pub fn query_params(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
        now_secs: i64,
    ) -> Vec<(&'static str, String)> {
        let window_start = now_secs - i64::from(limit) * SECONDS_PER_CANDLE;
        match self {
            OhlcvProvider::BinanceSpot | OhlcvProvider::BinanceFutures | OhlcvProvider::Mexc => vec![
                ("symbol", symbol.to_string()),
                ("interval", interval.to_string()),
                ("limit", limit.to_string()),
            ],
            OhlcvProvider::Bybit => vec![
                ("symbol", symbol.to_string()),
                ("interval", interval.to_string()),
                ("limit", limit.to_string()),
                ("from", window_start.to_string()),
            ],
            OhlcvProvider::KuCoin => vec![
                ("symbol", symbol.to_string()),
                ("type", interval.to_string()),
                ("startAt", window_start.to_string()),
                ("endAt", now_secs.to_string()),
            ],
        }
    }
}

impl fmt::Display for OhlcvProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OhlcvProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OhlcvProvider::ALL
            .iter()
            .copied()
            .find(|provider| provider.name() == s)
            .ok_or_else(|| format!("Unsupported exchange: {}", s))
    }
}

pub fn parse_limit(raw: Option<&str>) -> Option<u32> {
    raw?.trim().parse::<u32>().ok().filter(|limit| *limit > 0)
}
