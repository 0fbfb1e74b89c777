//! Broadcast notification stream for inter-component signals.
//!
//! Adapters publish `ZoneSetChanged` when their zone set changes (discovery,
//! removal, rename, capability change; not track flux). The bus listens and
//! refreshes its cache for that prefix. External surfaces may subscribe for
//! push-style updates instead of polling `zones_sha`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum BridgeEvent {
    /// A backend's zone set changed; the bus should re-pull its zones.
    ZoneSetChanged { prefix: String },
    /// A backend established its upstream connection.
    BackendConnected { prefix: String },
    /// A backend lost its upstream connection.
    BackendDisconnected { prefix: String, reason: Option<String> },
    /// Process shutdown in progress.
    ShuttingDown,
}

/// Publish/subscribe handle over a broadcast channel.
#[derive(Clone)]
pub struct EventStream {
    sender: broadcast::Sender<BridgeEvent>,
}

impl EventStream {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Send errors mean "no subscribers" and are ignored.
    pub fn publish(&self, event: BridgeEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

pub type SharedEvents = Arc<EventStream>;

pub fn create_events() -> SharedEvents {
    Arc::new(EventStream::new(256))
}
