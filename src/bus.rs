//! Named-event bus.
//!
//! Topic-addressed broadcast channels: `emit(name, payload)` fans out to
//! every listener registered for that name. Payloads are JSON values so a
//! single bus can carry penalty lists, hash refreshes, and peer deltas.
//! Listeners that fall behind lose the oldest events rather than blocking
//! the publisher.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Events buffered per topic before the oldest are dropped.
const CHANNEL_CAPACITY: usize = 64;

#[derive(Default)]
pub struct EventBus {
    topics: Mutex<HashMap<String, broadcast::Sender<Value>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn topic(&self, name: &str) -> broadcast::Sender<Value> {
        let mut topics = self.topics.lock().expect("bus lock");
        topics
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Register a listener for a named event.
    pub fn add_listener(&self, name: &str) -> broadcast::Receiver<Value> {
        self.topic(name).subscribe()
    }

    /// Publish a payload to every listener of the named event.
    /// Events with no listeners are dropped.
    pub fn emit(&self, name: &str, payload: Value) {
        let _ = self.topic(name).send(payload);
    }
}

/// Topic for penalty list recomputations (MessageLoop → CoreLoop).
pub const PENALTY_LIST_UPDATE: &str = "penalty-list-update";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_emit_reaches_listener() {
        let bus = EventBus::new();
        let mut rx = bus.add_listener("test-topic");

        bus.emit("test-topic", json!({"value": 1}));
        let received = rx.recv().await.unwrap();
        assert_eq!(received["value"], 1);
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bus = EventBus::new();
        let mut rx = bus.add_listener("a");

        bus.emit("b", json!(1));
        bus.emit("a", json!(2));
        assert_eq!(rx.recv().await.unwrap(), json!(2));
    }
}
