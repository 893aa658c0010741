use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::json;

pub const KUCOIN_WS_URL: &str = "wss://ws-api.kucoin.com/endpoint";
pub const MEXC_WS_URL: &str = "wss://wbs.mexc.com/ws";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    KuCoin,
    Mexc,
}

// Envelope of a KuCoin push message: {"type":"message","topic":"/market/ticker:BTC-USDT","data":{...}}
#[derive(Deserialize)]
struct KuCoinEnvelope<'a> {
    #[serde(borrow, default)]
    topic: Option<Cow<'a, str>>,
    #[serde(default)]
    data: Option<Box<RawValue>>,
}

// Envelope of a MEXC push message: {"c":"spot@ticker.BTCUSDT","d":{...},"s":"BTCUSDT","t":...}
#[derive(Deserialize)]
struct MexcEnvelope<'a> {
    #[serde(borrow, default)]
    s: Option<Cow<'a, str>>,
    #[serde(default)]
    d: Option<Box<RawValue>>,
}

impl Exchange {
    pub const ALL: [Exchange; 2] = [Exchange::KuCoin, Exchange::Mexc];

    pub fn name(&self) -> &'static str {
        match self {
            Exchange::KuCoin => "kucoin",
            Exchange::Mexc => "mexc",
        }
    }

    pub fn default_ws_url(&self) -> &'static str {
        match self {
            Exchange::KuCoin => KUCOIN_WS_URL,
            Exchange::Mexc => MEXC_WS_URL,
        }
    }

    pub fn subscribe_message(&self, symbol: &str) -> String {
        match self {
            Exchange::KuCoin => json!({
                "id": uuid::Uuid::new_v4().to_string(),
                "type": "subscribe",
                "topic": kucoin_ticker_topic(symbol),
                "privateChannel": false,
                "response": true,
            })
            .to_string(),
            Exchange::Mexc => json!({
                "method": "SUBSCRIPTION",
                "params": [format!("spot@ticker.{}", symbol)],
                "id": 1,
            })
            .to_string(),
        }
    }

    // Both exchanges drop idle sockets without an app-level ping.
    pub fn ping_message(&self) -> String {
        match self {
            Exchange::KuCoin => json!({
                "id": chrono::Utc::now().timestamp_millis().to_string(),
                "type": "ping",
            })
            .to_string(),
            Exchange::Mexc => json!({ "method": "PING" }).to_string(),
        }
    }

    /// Ticker payload for `symbol`, as the exact JSON text the exchange sent.
    /// `None` for control frames, malformed JSON and other topics.
    pub fn extract_payload(&self, symbol: &str, text: &str) -> Option<String> {
        match self {
            Exchange::KuCoin => {
                let envelope: KuCoinEnvelope = serde_json::from_str(text).ok()?;
                let topic = envelope.topic?;
                let data = envelope.data?;
                if !topic.eq_ignore_ascii_case(&kucoin_ticker_topic(symbol)) {
                    return None;
                }
                Some(data.get().to_string())
            }
            Exchange::Mexc => {
                let envelope: MexcEnvelope = serde_json::from_str(text).ok()?;
                let data = envelope.d?;
                if let Some(s) = envelope.s {
                    if !s.eq_ignore_ascii_case(symbol) {
                        return None;
                    }
                }
                Some(data.get().to_string())
            }
        }
    }
}

fn kucoin_ticker_topic(symbol: &str) -> String {
    format!("/market/ticker:{}", symbol)
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Exchange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "kucoin" => Ok(Exchange::KuCoin),
            "mexc" => Ok(Exchange::Mexc),
            other => Err(format!("Unsupported exchange: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Endpoints {
    pub kucoin: String,
    pub mexc: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            kucoin: Exchange::KuCoin.default_ws_url().to_string(),
            mexc: Exchange::Mexc.default_ws_url().to_string(),
        }
    }
}

impl Endpoints {
    pub fn url(&self, exchange: Exchange) -> &str {
        match exchange {
            Exchange::KuCoin => &self.kucoin,
            Exchange::Mexc => &self.mexc,
        }
    }
}
