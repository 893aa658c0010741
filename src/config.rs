use std::env;
use std::str::FromStr;
use std::time::Duration;
use log::{info, warn};

use crate::data::IdleTopicPolicy;
use crate::error::{RelayError, Result};
use crate::exchange::{Endpoints, Exchange, KUCOIN_WS_URL, MEXC_WS_URL};
use crate::upstream::UpstreamSettings;
use crate::upstream::connector::{
    DEFAULT_BACKOFF_RESET_SECS, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_PING_INTERVAL_SECS,
    DEFAULT_RECONNECT_BASE_MS, DEFAULT_RECONNECT_MAX_MS,
};

// Server Configuration
pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";
pub const DEFAULT_API_PORT: u16 = 5000;
pub const DEFAULT_KUCOIN_WS_PORT: u16 = 8083;
pub const DEFAULT_MEXC_WS_PORT: u16 = 8084;
pub const STATS_INTERVAL_SECS: u64 = 60;

// HTTP Configuration
pub const DEFAULT_CORS_ORIGIN: &str = "http://localhost:3000";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_host: String,
    pub api_port: u16,
    pub kucoin_ws_port: u16,
    pub mexc_ws_port: u16,
    pub kucoin_ws_url: String,
    pub mexc_ws_url: String,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub connect_timeout_secs: u64,
    pub backoff_reset_secs: u64,
    pub ping_interval_secs: u64,
    pub idle_topic_policy: IdleTopicPolicy,
    pub cors_origin: String,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            bind_host: lookup("BIND_HOST").unwrap_or_else(|| DEFAULT_BIND_HOST.to_string()),
            api_port: parse_or(&lookup, "PORT", DEFAULT_API_PORT),
            kucoin_ws_port: parse_or(&lookup, "KUCOIN_WS_PORT", DEFAULT_KUCOIN_WS_PORT),
            mexc_ws_port: parse_or(&lookup, "MEXC_WS_PORT", DEFAULT_MEXC_WS_PORT),
            kucoin_ws_url: lookup("KUCOIN_WS_URL").unwrap_or_else(|| KUCOIN_WS_URL.to_string()),
            mexc_ws_url: lookup("MEXC_WS_URL").unwrap_or_else(|| MEXC_WS_URL.to_string()),
            reconnect_base_ms: parse_or(&lookup, "RECONNECT_BASE_MS", DEFAULT_RECONNECT_BASE_MS),
            reconnect_max_ms: parse_or(&lookup, "RECONNECT_MAX_MS", DEFAULT_RECONNECT_MAX_MS),
            connect_timeout_secs: parse_or(&lookup, "CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS),
            backoff_reset_secs: parse_or(&lookup, "BACKOFF_RESET_SECS", DEFAULT_BACKOFF_RESET_SECS),
            ping_interval_secs: parse_or(&lookup, "UPSTREAM_PING_INTERVAL_SECS", DEFAULT_PING_INTERVAL_SECS),
            idle_topic_policy: parse_or(&lookup, "IDLE_TOPIC_POLICY", IdleTopicPolicy::TearDown),
            cors_origin: lookup("CORS_ORIGIN").unwrap_or_else(|| DEFAULT_CORS_ORIGIN.to_string()),
            log_level: lookup("RUST_LOG").unwrap_or_else(|| "info".to_string()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.reconnect_base_ms == 0 {
            return Err(RelayError::Config("RECONNECT_BASE_MS must be greater than zero".to_string()));
        }

        if self.reconnect_base_ms > self.reconnect_max_ms {
            return Err(RelayError::Config(format!(
                "RECONNECT_BASE_MS ({}) exceeds RECONNECT_MAX_MS ({})",
                self.reconnect_base_ms, self.reconnect_max_ms
            )));
        }

        if self.connect_timeout_secs == 0 || self.ping_interval_secs == 0 {
            return Err(RelayError::Config("Timeouts and ping interval must be greater than zero".to_string()));
        }

        let ports = [self.api_port, self.kucoin_ws_port, self.mexc_ws_port];
        if ports[0] == ports[1] || ports[0] == ports[2] || ports[1] == ports[2] {
            return Err(RelayError::Config(format!("Listener ports must be distinct: {:?}", ports)));
        }

        for url in [&self.kucoin_ws_url, &self.mexc_ws_url] {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(RelayError::Config(format!("Upstream URL must use ws:// or wss://: {}", url)));
            }
        }

        Ok(())
    }

    pub fn api_bind_address(&self) -> String {
        format!("{}:{}", self.bind_host, self.api_port)
    }

    pub fn ws_bind_address(&self, exchange: Exchange) -> String {
        let port = match exchange {
            Exchange::KuCoin => self.kucoin_ws_port,
            Exchange::Mexc => self.mexc_ws_port,
        };
        format!("{}:{}", self.bind_host, port)
    }

    pub fn endpoints(&self) -> Endpoints {
        Endpoints {
            kucoin: self.kucoin_ws_url.clone(),
            mexc: self.mexc_ws_url.clone(),
        }
    }

    pub fn upstream_settings(&self) -> UpstreamSettings {
        UpstreamSettings {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            reconnect_base: Duration::from_millis(self.reconnect_base_ms),
            reconnect_max: Duration::from_millis(self.reconnect_max_ms),
            stable_after: Duration::from_secs(self.backoff_reset_secs),
            ping_interval: Duration::from_secs(self.ping_interval_secs),
        }
    }

    pub fn log_config(&self) {
        info!("Server Configuration:");
        info!("  REST API: {}", self.api_bind_address());
        for exchange in Exchange::ALL {
            info!("  {} relay: {}", exchange.name().to_uppercase(), self.ws_bind_address(exchange));
        }
        info!("  KuCoin upstream: {}", self.kucoin_ws_url);
        info!("  MEXC upstream: {}", self.mexc_ws_url);
        info!(
            "  Reconnect backoff: {}ms doubling to {}ms (reset after {}s up)",
            self.reconnect_base_ms, self.reconnect_max_ms, self.backoff_reset_secs
        );
        info!("  Idle topic policy: {:?}", self.idle_topic_policy);
        info!("  CORS origin: {}", self.cors_origin);
        info!("  Log Level: {}", self.log_level);
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{} has invalid value '{}', using default", key, raw);
            default
        }),
        None => default,
    }
}
