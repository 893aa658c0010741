use tokio::sync::broadcast;
use log::debug;

use crate::data::Topic;

#[derive(Clone)]
pub struct Fanout {
    topic: Topic,
    tx: broadcast::Sender<String>,
}

impl Fanout {
    pub fn new(topic: Topic, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { topic, tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    // Never waits; a receiver that falls behind loses its oldest messages.
    pub fn broadcast(&self, payload: String) -> usize {
        match self.tx.send(payload) {
            Ok(delivered) => {
                debug!("Broadcasted {} update to {} sessions", self.topic, delivered);
                delivered
            }
            Err(_) => {
                debug!("No open sessions for {}, update dropped", self.topic);
                0
            }
        }
    }
}
