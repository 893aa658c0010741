use std::sync::Arc;
use futures::{SinkExt, StreamExt};
use futures::stream::{SplitSink, SplitStream};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use log::{info, warn, error, debug};

use crate::data::{Topic, TopicRegistry};
use crate::exchange::Exchange;
use crate::upstream::wait_for_stop;

pub const MISSING_SYMBOL_ERROR: &str = "Missing 'symbol' parameter in WebSocket connection.";

#[derive(Debug, Serialize)]
pub struct ErrorPayload {
    pub error: String,
}

impl ErrorPayload {
    pub fn new(message: impl Into<String>) -> Self {
        Self { error: message.into() }
    }
}

pub struct ClientSession {
    session_id: String,
    exchange: Exchange,
    registry: Arc<TopicRegistry>,
    peer_addr: String,
}

impl ClientSession {
    pub fn new(exchange: Exchange, registry: Arc<TopicRegistry>, peer_addr: String) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            exchange,
            registry,
            peer_addr,
        }
    }

    // `symbol` is the raw query parameter captured during the handshake
    pub async fn run(
        self,
        mut ws_stream: WebSocketStream<TcpStream>,
        symbol: Option<String>,
        shutdown: watch::Receiver<bool>,
    ) {
        let symbol = match symbol.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(symbol) => symbol.to_uppercase(),
            None => {
                warn!("Rejecting {} connection from {}: missing symbol", self.exchange, self.peer_addr);
                self.reject(&mut ws_stream, MISSING_SYMBOL_ERROR).await;
                return;
            }
        };

        let topic = Topic::new(self.exchange, &symbol);
        let subscription = match self.registry.acquire(topic.clone(), &self.session_id) {
            Ok(subscription) => subscription,
            Err(e) => {
                error!("Failed to register session {} on {}: {}", self.session_id, topic, e);
                self.reject(&mut ws_stream, &e.to_string()).await;
                return;
            }
        };

        info!(
            "Client {} connected to {} WebSocket for {} (session {})",
            self.peer_addr,
            self.exchange.name().to_uppercase(),
            symbol,
            self.session_id
        );

        let (write, read) = ws_stream.split();
        let (close_tx, close_rx) = mpsc::channel::<()>(1);

        // Forward task - pushes topic updates to the client
        let mut forward_task = self.spawn_forward_task(write, subscription.receiver, close_rx, shutdown);

        // Read task - only watches for the client going away
        let mut read_task = self.spawn_read_task(read, close_tx);

        tokio::select! {
            _ = &mut forward_task => {
                debug!("Forward task completed for session {}", self.session_id);
            }
            _ = &mut read_task => {
                debug!("Read task completed for session {}", self.session_id);
            }
        }
        forward_task.abort();
        read_task.abort();

        if let Err(e) = self.registry.release(&topic, &self.session_id) {
            error!("Failed to release session {} from {}: {}", self.session_id, topic, e);
        }

        info!(
            "Client {} disconnected from {} WebSocket for {}",
            self.peer_addr,
            self.exchange.name().to_uppercase(),
            symbol
        );
    }

    async fn reject(&self, ws_stream: &mut WebSocketStream<TcpStream>, message: &str) {
        match serde_json::to_string(&ErrorPayload::new(message)) {
            Ok(payload) => {
                if let Err(e) = ws_stream.send(Message::Text(payload)).await {
                    warn!("Error sending error payload to {}: {}", self.peer_addr, e);
                }
            }
            Err(e) => error!("Failed to serialize error payload: {}", e),
        }
        if let Err(e) = ws_stream.close(None).await {
            debug!("Error closing rejected connection from {}: {}", self.peer_addr, e);
        }
    }

    fn spawn_forward_task(
        &self,
        mut write: SplitSink<WebSocketStream<TcpStream>, Message>,
        mut rx: broadcast::Receiver<String>,
        mut close_rx: mpsc::Receiver<()>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let session_id = self.session_id.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message_result = rx.recv() => {
                        match message_result {
                            Ok(payload) => {
                                if let Err(e) = write.send(Message::Text(payload)).await {
                                    warn!("Error sending update to session {}: {:?}", session_id, e);
                                    break;
                                }
                            }
                            Err(RecvError::Lagged(skipped)) => {
                                warn!("Session {} lagging, skipped {} updates", session_id, skipped);
                            }
                            Err(RecvError::Closed) => {
                                info!("Topic closed for session {}", session_id);
                                break;
                            }
                        }
                    }
                    _ = close_rx.recv() => {
                        debug!("Received close signal for session {}", session_id);
                        break;
                    }
                    _ = wait_for_stop(&mut shutdown) => {
                        let frame = CloseFrame {
                            code: CloseCode::Away,
                            reason: "Server shutting down".into(),
                        };
                        if let Err(e) = write.send(Message::Close(Some(frame))).await {
                            debug!("Error sending close frame to session {}: {:?}", session_id, e);
                        }
                        break;
                    }
                }
            }
        })
    }

    fn spawn_read_task(
        &self,
        mut read: SplitStream<WebSocketStream<TcpStream>>,
        close_tx: mpsc::Sender<()>,
    ) -> tokio::task::JoinHandle<()> {
        let session_id = self.session_id.clone();

        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Close(frame)) => {
                        info!("Session {} sent close frame: {:?}", session_id, frame);
                        break;
                    }
                    Ok(_) => {
                        // client frames carry nothing for a ticker relay
                    }
                    Err(e) => {
                        warn!("Error reading from session {}: {:?}", session_id, e);
                        break;
                    }
                }
            }
            let _ = close_tx.send(()).await;
        })
    }
}
