use std::time::Duration;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use log::{debug, info, warn};

use crate::data::{Fanout, Topic};
use crate::error::{RelayError, Result};
use crate::upstream::Backoff;

pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_RECONNECT_BASE_MS: u64 = 3000;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 60000;
pub const DEFAULT_BACKOFF_RESET_SECS: u64 = 10;
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 18;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub connect_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    /// How long a subscription must stay up before the backoff starts over.
    pub stable_after: Duration,
    pub ping_interval: Duration,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            reconnect_base: Duration::from_millis(DEFAULT_RECONNECT_BASE_MS),
            reconnect_max: Duration::from_millis(DEFAULT_RECONNECT_MAX_MS),
            stable_after: Duration::from_secs(DEFAULT_BACKOFF_RESET_SECS),
            ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Connecting,
    Subscribed,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectorStatus {
    pub state: ConnectionState,
    /// Delay scheduled before the pending reconnect (or before the last one).
    pub reconnect_delay: Duration,
    pub consecutive_failures: u32,
}

// Dropping the handle stops the connector too.
pub struct UpstreamHandle {
    topic: Topic,
    stop_tx: watch::Sender<bool>,
    status_rx: watch::Receiver<ConnectorStatus>,
    task: JoinHandle<()>,
}

impl UpstreamHandle {
    pub fn status(&self) -> ConnectorStatus {
        *self.status_rx.borrow()
    }

    pub fn state(&self) -> ConnectionState {
        self.status().state
    }

    #[cfg(test)]
    pub fn watch_status(&self) -> watch::Receiver<ConnectorStatus> {
        self.status_rx.clone()
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn shutdown(self, grace: Duration) {
        self.stop();
        let topic = self.topic.clone();
        let mut task = self.task;
        if timeout(grace, &mut task).await.is_err() {
            warn!("Upstream connector for {} did not stop within {:?}, aborting", topic, grace);
            task.abort();
        }
    }
}

pub struct UpstreamConnector {
    topic: Topic,
    url: String,
    settings: UpstreamSettings,
    fanout: Fanout,
    backoff: Backoff,
    failures: u32,
    subscribed_since: Option<Instant>,
    status_tx: watch::Sender<ConnectorStatus>,
    stop_rx: watch::Receiver<bool>,
}

impl UpstreamConnector {
    pub fn spawn(topic: Topic, url: String, settings: UpstreamSettings, fanout: Fanout) -> UpstreamHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(ConnectorStatus {
            state: ConnectionState::Connecting,
            reconnect_delay: Duration::ZERO,
            consecutive_failures: 0,
        });

        let connector = Self {
            topic: topic.clone(),
            url,
            backoff: Backoff::new(settings.reconnect_base, settings.reconnect_max),
            settings,
            fanout,
            failures: 0,
            subscribed_since: None,
            status_tx,
            stop_rx,
        };
        let task = tokio::spawn(connector.run());

        UpstreamHandle {
            topic,
            stop_tx,
            status_rx,
            task,
        }
    }

    async fn run(mut self) {
        info!("Starting upstream connector for {} via {}", self.topic, self.url);
        let mut delay = Duration::ZERO;

        loop {
            self.publish(ConnectionState::Connecting, delay);

            match self.connect_and_stream().await {
                Ok(()) => break,
                Err(e) => warn!("Upstream {} disconnected: {}", self.topic, e),
            }

            if let Some(since) = self.subscribed_since.take() {
                if since.elapsed() >= self.settings.stable_after {
                    self.backoff.reset();
                    self.failures = 0;
                }
            }
            self.failures += 1;
            delay = self.backoff.next_delay();
            self.publish(ConnectionState::Disconnected, delay);
            warn!(
                "Reconnecting to {} for {} in {:?} (failure #{})",
                self.topic.exchange, self.topic.symbol, delay, self.failures
            );

            tokio::select! {
                _ = sleep(delay) => {}
                _ = wait_for_stop(&mut self.stop_rx) => break,
            }
        }

        self.publish(ConnectionState::Disconnected, delay);
        info!("Upstream connector for {} stopped", self.topic);
    }

    /// Ok(()) only when a stop was requested; every other exit is a failure.
    async fn connect_and_stream(&mut self) -> Result<()> {
        let exchange = self.topic.exchange;
        let url = self.url.clone();
        let connect_timeout = self.settings.connect_timeout;

        let connect = timeout(connect_timeout, connect_async(url.as_str()));
        let (ws_stream, _) = tokio::select! {
            result = connect => result
                .map_err(|_| RelayError::ConnectTimeout { url: url.clone(), timeout: connect_timeout })??,
            _ = wait_for_stop(&mut self.stop_rx) => return Ok(()),
        };
        info!("Connected to {} WebSocket for {}", exchange, self.topic.symbol);

        let (mut write, mut read) = ws_stream.split();
        write
            .send(Message::Text(exchange.subscribe_message(&self.topic.symbol)))
            .await?;

        self.subscribed_since = Some(Instant::now());
        self.publish(ConnectionState::Subscribed, Duration::ZERO);
        info!("Subscribed to {} ticker for {}", exchange, self.topic.symbol);

        let mut ping_timer = interval(self.settings.ping_interval);
        ping_timer.reset();

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match exchange.extract_payload(&self.topic.symbol, &text) {
                                Some(payload) => {
                                    self.fanout.broadcast(payload);
                                }
                                None => debug!("Skipping frame from {}: {}", self.topic, text),
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!("{} closed the upstream for {}: {:?}", exchange, self.topic.symbol, frame);
                            return Err(RelayError::ConnectionClosed);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(RelayError::ConnectionClosed),
                    }
                }
                _ = ping_timer.tick() => {
                    write.send(Message::Text(exchange.ping_message())).await?;
                }
                _ = wait_for_stop(&mut self.stop_rx) => {
                    let close = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "Topic closed".into(),
                    };
                    match timeout(CLOSE_TIMEOUT, write.send(Message::Close(Some(close)))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => debug!("Error closing upstream for {}: {}", self.topic, e),
                        Err(_) => debug!("Upstream for {} did not take the close frame in {:?}", self.topic, CLOSE_TIMEOUT),
                    }
                    return Ok(());
                }
            }
        }
    }

    fn publish(&self, state: ConnectionState, reconnect_delay: Duration) {
        self.status_tx.send_replace(ConnectorStatus {
            state,
            reconnect_delay,
            consecutive_failures: self.failures,
        });
    }
}

// Resolves once the flag turns true or its sender is gone.
pub async fn wait_for_stop(stop_rx: &mut watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow_and_update() {
            return;
        }
        if stop_rx.changed().await.is_err() {
            return;
        }
    }
}
