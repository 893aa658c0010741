use std::time::Duration;
use thiserror::Error;

use crate::data::Topic;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Connecting to {url} timed out after {timeout:?}")]
    ConnectTimeout { url: String, timeout: Duration },

    #[error("Upstream connection closed")]
    ConnectionClosed,

    #[error("Session {session_id} already subscribed to {topic}")]
    AlreadySubscribed { session_id: String, topic: Topic },

    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;
