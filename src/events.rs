//! Typed lifecycle event bus built on `tokio::sync::broadcast`, the same
//! primitive this corpus uses for shutdown signaling (`fc-router`'s
//! `LifecycleManager`). Listeners may be many; ordering among listeners for
//! the same event is not specified.

use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected,
    Disconnected { error: Option<String> },
    Reconnecting { attempt: u32, delay_ms: u64 },
    Reconnected,
    Error { message: String },
}

/// Thin wrapper around a broadcast sender; cloning a `Consumer`/`Producer`
/// handle shares the same bus as the `ConnectionCore` it was built from.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ConnectionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.tx.subscribe()
    }

    /// Broadcasting is best-effort: an event with no subscribers is simply
    /// dropped, which is the expected steady state when nobody is listening.
    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
