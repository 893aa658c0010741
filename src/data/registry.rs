use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;
use serde::Serialize;
use tokio::sync::broadcast;
use log::{info, warn};

use crate::data::Fanout;
use crate::error::{RelayError, Result};
use crate::exchange::{Endpoints, Exchange};
use crate::upstream::{ConnectionState, UpstreamConnector, UpstreamHandle, UpstreamSettings};

pub const DEFAULT_FANOUT_CAPACITY: usize = 256;
const CONNECTOR_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// Symbols are stored trimmed and uppercased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Topic {
    pub exchange: Exchange,
    pub symbol: String,
}

impl Topic {
    pub fn new(exchange: Exchange, symbol: &str) -> Self {
        Self {
            exchange,
            symbol: symbol.trim().to_uppercase(),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange, self.symbol)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleTopicPolicy {
    TearDown,
    KeepAlive,
}

impl FromStr for IdleTopicPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "tear-down" | "teardown" => Ok(IdleTopicPolicy::TearDown),
            "keep-alive" | "keepalive" => Ok(IdleTopicPolicy::KeepAlive),
            other => Err(format!("Unknown idle topic policy: {}", other)),
        }
    }
}

// Dropping this without calling release leaves the session id registered.
pub struct Subscription {
    pub receiver: broadcast::Receiver<String>,
}

struct TopicEntry {
    fanout: Fanout,
    upstream: UpstreamHandle,
    subscribers: HashSet<String>,
}

/// One upstream connector per topic plus the sessions bound to it. All
/// mutation happens under the single `topics` lock.
pub struct TopicRegistry {
    topics: Mutex<HashMap<Topic, TopicEntry>>,
    endpoints: Endpoints,
    settings: UpstreamSettings,
    policy: IdleTopicPolicy,
}

impl TopicRegistry {
    pub fn new(endpoints: Endpoints, settings: UpstreamSettings, policy: IdleTopicPolicy) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            endpoints,
            settings,
            policy,
        }
    }

    fn spawn_connector(&self, topic: &Topic, fanout: &Fanout) -> UpstreamHandle {
        let url = self.endpoints.url(topic.exchange).to_string();
        UpstreamConnector::spawn(topic.clone(), url, self.settings.clone(), fanout.clone())
    }

    // Must be called inside a tokio runtime.
    pub fn acquire(&self, topic: Topic, session_id: &str) -> Result<Subscription> {
        let mut topics = self.topics.lock().map_err(|_| RelayError::LockPoisoned)?;

        let entry = topics.entry(topic.clone()).or_insert_with(|| {
            let fanout = Fanout::new(topic.clone(), DEFAULT_FANOUT_CAPACITY);
            let upstream = self.spawn_connector(&topic, &fanout);
            info!("Created upstream connector for {}", topic);
            TopicEntry {
                fanout,
                upstream,
                subscribers: HashSet::new(),
            }
        });

        // a connector task only ends when stopped or if it panicked
        if entry.upstream.is_finished() {
            warn!("Upstream connector for {} is gone, replacing it", topic);
            entry.upstream = self.spawn_connector(&topic, &entry.fanout);
        }

        if !entry.subscribers.insert(session_id.to_string()) {
            return Err(RelayError::AlreadySubscribed {
                session_id: session_id.to_string(),
                topic,
            });
        }

        info!(
            "Session {} subscribed to {} ({} sessions)",
            session_id,
            topic,
            entry.subscribers.len()
        );
        Ok(Subscription {
            receiver: entry.fanout.subscribe(),
        })
    }

    pub fn release(&self, topic: &Topic, session_id: &str) -> Result<bool> {
        let mut topics = self.topics.lock().map_err(|_| RelayError::LockPoisoned)?;

        let Some(entry) = topics.get_mut(topic) else {
            warn!("Release for unknown topic {} from session {}", topic, session_id);
            return Ok(false);
        };
        if !entry.subscribers.remove(session_id) {
            warn!("Session {} was not subscribed to {}", session_id, topic);
            return Ok(false);
        }
        info!(
            "Session {} unsubscribed from {} ({} sessions left)",
            session_id,
            topic,
            entry.subscribers.len()
        );

        if entry.subscribers.is_empty() {
            match self.policy {
                IdleTopicPolicy::TearDown => {
                    if let Some(entry) = topics.remove(topic) {
                        info!("Tearing down idle upstream connector for {}", topic);
                        tokio::spawn(entry.upstream.shutdown(CONNECTOR_SHUTDOWN_GRACE));
                    }
                }
                IdleTopicPolicy::KeepAlive => {
                    info!("Keeping idle upstream connector for {} running", topic);
                }
            }
        }
        Ok(true)
    }

    pub fn connector_state(&self, topic: &Topic) -> Option<ConnectionState> {
        self.topics
            .lock()
            .ok()?
            .get(topic)
            .map(|entry| entry.upstream.state())
    }

    #[cfg(test)]
    pub fn watch_connector(&self, topic: &Topic) -> Option<tokio::sync::watch::Receiver<crate::upstream::connector::ConnectorStatus>> {
        self.topics
            .lock()
            .ok()?
            .get(topic)
            .map(|entry| entry.upstream.watch_status())
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics
            .lock()
            .ok()
            .and_then(|topics| topics.get(topic).map(|entry| entry.subscribers.len()))
            .unwrap_or(0)
    }

    pub fn topics(&self) -> Vec<Topic> {
        self.topics
            .lock()
            .map(|topics| topics.keys().cloned().collect())
            .unwrap_or_default()
    }

    // (topics, sessions across all topics)
    pub fn get_stats(&self) -> (usize, usize) {
        self.topics
            .lock()
            .map(|topics| {
                let subscriptions = topics.values().map(|entry| entry.subscribers.len()).sum();
                (topics.len(), subscriptions)
            })
            .unwrap_or((0, 0))
    }

    pub async fn shutdown(&self) {
        let entries: Vec<TopicEntry> = match self.topics.lock() {
            Ok(mut topics) => topics.drain().map(|(_, entry)| entry).collect(),
            Err(_) => return,
        };
        info!("Stopping {} upstream connectors", entries.len());

        let stops = entries
            .into_iter()
            .map(|entry| entry.upstream.shutdown(CONNECTOR_SHUTDOWN_GRACE));
        futures::future::join_all(stops).await;
    }
}
