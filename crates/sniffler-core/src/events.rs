//! Event Bus (C10): in-process pub/sub to a UI transport that may not yet
//! be attached.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};

/// Default per-channel queue cap before a UI transport attaches (§4.10).
pub const DEFAULT_QUEUE_CAP: usize = 256;

/// A single fan-out event. `payload` must be a serializable projection of a
/// §3 entity — never a reference to a live socket or server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub channel: String,
    pub payload: Value,
    /// Application-level idempotency key (record id, mock id, ...) used for
    /// at-least-once delivery de-duplication on the outbound side.
    pub idempotency_key: Option<String>,
}

impl Event {
    pub fn new(channel: impl Into<String>, payload: Value) -> Self {
        Self {
            channel: channel.into(),
            payload,
            idempotency_key: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

#[derive(Default)]
struct BusState {
    attached: bool,
    queue: VecDeque<Event>,
    delivered_keys: HashSet<String>,
    dropped_counters: std::collections::HashMap<String, u64>,
}

/// The process-wide Event Bus. Producers never block: [`EventBus::emit`]
/// either queues (no UI attached) or broadcasts (UI attached), and queue
/// overflow evicts the oldest entry rather than applying backpressure.
pub struct EventBus {
    state: Mutex<BusState>,
    sender: broadcast::Sender<Event>,
    queue_cap: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_queue_cap(DEFAULT_QUEUE_CAP)
    }

    pub fn with_queue_cap(queue_cap: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(1024);
        Self {
            state: Mutex::new(BusState::default()),
            sender,
            queue_cap,
        }
    }

    /// Emit an event. While no UI is attached the event is buffered (§4.10
    /// early-delivery buffering); once attached it is broadcast directly.
    pub async fn emit(&self, event: Event) {
        let mut state = self.state.lock().await;

        if let Some(key) = &event.idempotency_key {
            if !state.delivered_keys.insert(key.clone()) {
                return;
            }
        }

        if state.attached {
            // A send error here only means there are currently no
            // receivers subscribed; the event is not lost for future
            // subscribers because broadcast is fan-out, not a queue.
            let _ = self.sender.send(event);
            return;
        }

        if state.queue.len() >= self.queue_cap {
            state.queue.pop_front();
            *state.dropped_counters.entry(event.channel.clone()).or_insert(0) += 1;
        }
        state.queue.push_back(event);
    }

    /// Mark the bus as attached and drain the queue once, in order. Events
    /// emitted after this call go straight to the returned subscription.
    pub async fn attach(&self) -> (Vec<Event>, broadcast::Receiver<Event>) {
        let mut state = self.state.lock().await;
        state.attached = true;
        let drained: Vec<Event> = state.queue.drain(..).collect();
        (drained, self.sender.subscribe())
    }

    pub async fn events_dropped(&self, channel: &str) -> u64 {
        self.state
            .lock()
            .await
            .dropped_counters
            .get(channel)
            .copied()
            .unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedEventBus = Arc<EventBus>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn queues_before_attach_and_drains_in_order() {
        let bus = EventBus::new();
        bus.emit(Event::new("proxy-started", json!({"port": 1}))).await;
        bus.emit(Event::new("proxy-started", json!({"port": 2}))).await;

        let (drained, _rx) = bus.attach().await;
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].payload, json!({"port": 1}));
        assert_eq!(drained[1].payload, json!({"port": 2}));
    }

    #[tokio::test]
    async fn overflow_evicts_oldest_and_counts() {
        let bus = EventBus::with_queue_cap(2);
        for i in 0..3 {
            bus.emit(Event::new("mock-served", json!({"i": i}))).await;
        }
        let (drained, _rx) = bus.attach().await;
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].payload, json!({"i": 1}));
        assert_eq!(bus.events_dropped("mock-served").await, 1);
    }

    #[tokio::test]
    async fn idempotency_key_deduplicates() {
        let bus = EventBus::new();
        bus.emit(Event::new("request", json!({})).with_key("req-1")).await;
        bus.emit(Event::new("request", json!({})).with_key("req-1")).await;
        let (drained, _rx) = bus.attach().await;
        assert_eq!(drained.len(), 1);
    }

    #[tokio::test]
    async fn broadcasts_directly_once_attached() {
        let bus = EventBus::new();
        let (_drained, mut rx) = bus.attach().await;
        bus.emit(Event::new("proxy-started", json!({"port": 1}))).await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.channel, "proxy-started");
    }
}
