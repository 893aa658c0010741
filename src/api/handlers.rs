use std::sync::Arc;
use axum::{
    extract::{Path, State, Query},
    http::{header, HeaderValue, Method, StatusCode},
    response::Json,
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use log::{info, error};

use crate::api::ohlcv::{parse_limit, OhlcvProvider};
use crate::data::TopicRegistry;
use crate::error::{RelayError, Result};

pub const MEXC_EXCHANGE_INFO_URL: &str = "https://api.mexc.com/api/v3/exchangeInfo";
pub const BYBIT_SYMBOLS_URL: &str = "https://api.bybit.com/v2/public/symbols";
pub const KUCOIN_TICKERS_URL: &str = "https://api.kucoin.com/api/v1/market/allTickers";

pub const INVALID_OHLCV_PARAMS: &str = "Invalid parameters. Ensure 'limit' is a positive number.";
pub const UNSUPPORTED_EXCHANGE: &str = "Unsupported exchange";
pub const OHLCV_FETCH_FAILED: &str = "Failed to fetch data";

type ApiResult = std::result::Result<Json<Value>, (StatusCode, Json<Value>)>;

#[derive(Debug, Clone)]
pub struct RestUrls {
    pub binance_spot_klines: String,
    pub binance_futures_klines: String,
    pub bybit_klines: String,
    pub mexc_klines: String,
    pub kucoin_candles: String,
    pub mexc_exchange_info: String,
    pub bybit_symbols: String,
    pub kucoin_tickers: String,
}

impl Default for RestUrls {
    fn default() -> Self {
        Self {
            binance_spot_klines: OhlcvProvider::BinanceSpot.default_url().to_string(),
            binance_futures_klines: OhlcvProvider::BinanceFutures.default_url().to_string(),
            bybit_klines: OhlcvProvider::Bybit.default_url().to_string(),
            mexc_klines: OhlcvProvider::Mexc.default_url().to_string(),
            kucoin_candles: OhlcvProvider::KuCoin.default_url().to_string(),
            mexc_exchange_info: MEXC_EXCHANGE_INFO_URL.to_string(),
            bybit_symbols: BYBIT_SYMBOLS_URL.to_string(),
            kucoin_tickers: KUCOIN_TICKERS_URL.to_string(),
        }
    }
}

impl RestUrls {
    pub fn ohlcv(&self, provider: OhlcvProvider) -> &str {
        match provider {
            OhlcvProvider::BinanceSpot => &self.binance_spot_klines,
            OhlcvProvider::BinanceFutures => &self.binance_futures_klines,
            OhlcvProvider::Bybit => &self.bybit_klines,
            OhlcvProvider::Mexc => &self.mexc_klines,
            OhlcvProvider::KuCoin => &self.kucoin_candles,
        }
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub client: reqwest::Client,
    pub registry: Arc<TopicRegistry>,
    pub urls: Arc<RestUrls>,
}

impl ApiState {
    pub fn new(registry: Arc<TopicRegistry>, urls: RestUrls) -> Self {
        Self {
            client: reqwest::Client::new(),
            registry,
            urls: Arc::new(urls),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct OhlcvQuery {
    pub symbol: Option<String>,
    pub interval: Option<String>,
    pub limit: Option<String>,
}

fn error_response(status: StatusCode, message: &str) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "error": message })))
}

async fn fetch_json(client: &reqwest::Client, url: &str, params: &[(&str, String)]) -> Result<Value> {
    let value = client
        .get(url)
        .query(params)
        .send()
        .await?
        .error_for_status()?
        .json::<Value>()
        .await?;
    Ok(value)
}

// GET /api/health - Health check endpoint
pub async fn health_check(State(state): State<ApiState>) -> Json<Value> {
    let registry = &state.registry;
    let (topics, subscriptions) = registry.get_stats();
    let streams: Vec<Value> = registry
        .topics()
        .into_iter()
        .map(|topic| {
            json!({
                "topic": topic.to_string(),
                "state": registry.connector_state(&topic),
                "subscribers": registry.subscriber_count(&topic),
            })
        })
        .collect();

    Json(json!({
        "status": "healthy",
        "service": "ticker_relay",
        "topics": topics,
        "subscriptions": subscriptions,
        "streams": streams,
        "timestamp": chrono::Utc::now()
    }))
}

// GET /api/ohlcv/:exchange - Historical candles from one exchange
pub async fn get_ohlcv(
    State(state): State<ApiState>,
    Path(exchange): Path<String>,
    Query(query): Query<OhlcvQuery>,
) -> ApiResult {
    let symbol = query.symbol.filter(|s| !s.is_empty());
    let interval = query.interval.filter(|s| !s.is_empty());
    let limit = parse_limit(query.limit.as_deref());

    let (Some(symbol), Some(interval), Some(limit)) = (symbol, interval, limit) else {
        return Err(error_response(StatusCode::BAD_REQUEST, INVALID_OHLCV_PARAMS));
    };

    let provider = exchange
        .parse::<OhlcvProvider>()
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, UNSUPPORTED_EXCHANGE))?;

    let params = provider.query_params(&symbol, &interval, limit, chrono::Utc::now().timestamp());
    match fetch_json(&state.client, state.urls.ohlcv(provider), &params).await {
        Ok(data) => {
            info!("Fetched {} candles for {} from {}", limit, symbol, provider);
            Ok(Json(data))
        }
        Err(e) => {
            error!("Error fetching OHLCV from {}: {}", provider, e);
            Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, OHLCV_FETCH_FAILED))
        }
    }
}

async fn proxy(state: &ApiState, url: &str, exchange_label: &str) -> ApiResult {
    match fetch_json(&state.client, url, &[]).await {
        Ok(data) => Ok(Json(data)),
        Err(e) => {
            error!("Error fetching from {}: {}", exchange_label, e);
            Err(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("Error fetching data from {}", exchange_label),
            ))
        }
    }
}

// GET /api/proxy/mexc/exchangeInfo
pub async fn mexc_exchange_info(State(state): State<ApiState>) -> ApiResult {
    proxy(&state, &state.urls.mexc_exchange_info, "MEXC").await
}

// GET /api/proxy/bybit/symbols
pub async fn bybit_symbols(State(state): State<ApiState>) -> ApiResult {
    proxy(&state, &state.urls.bybit_symbols, "Bybit").await
}

// GET /api/proxy/kucoin/tickers
pub async fn kucoin_tickers(State(state): State<ApiState>) -> ApiResult {
    proxy(&state, &state.urls.kucoin_tickers, "KuCoin").await
}

pub fn cors_layer(origin: &str) -> Result<CorsLayer> {
    let origin = origin
        .parse::<HeaderValue>()
        .map_err(|e| RelayError::Config(format!("Invalid CORS origin '{}': {}", origin, e)))?;

    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true))
}

// Create the API router
pub fn create_api_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/ohlcv/:exchange", get(get_ohlcv))
        .route("/proxy/mexc/exchangeInfo", get(mexc_exchange_info))
        .route("/proxy/bybit/symbols", get(bybit_symbols))
        .route("/proxy/kucoin/tickers", get(kucoin_tickers))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
}
