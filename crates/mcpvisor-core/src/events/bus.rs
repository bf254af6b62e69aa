//! Broadcast-backed event emitter.
//!
//! Constructed once at the composition root and cloned into each component.
//! Subscribers get every event emitted after they subscribed; slow
//! subscribers may observe `RecvError::Lagged`.

use tokio::sync::broadcast;
use tracing::debug;

use super::McpEvent;
use crate::ports::EventEmitter;

/// Broadcast channel capacity for events
const CHANNEL_CAPACITY: usize = 256;

/// Broadcaster for supervisor and configuration events
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<McpEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<McpEvent> {
        self.sender.subscribe()
    }

    /// Get number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEmitter for EventBus {
    fn emit(&self, event: McpEvent) {
        // Only log if there are receivers
        if self.sender.receiver_count() > 0 {
            debug!(event = event.event_name(), server_name = ?event.server_name(), "Broadcasting event");
            let _ = self.sender.send(event);
        }
    }
}
