//! Event emitter trait for cross-crate event broadcasting.
//!
//! This module defines the abstraction for emitting supervisor and
//! configuration events. Implementations handle transport details
//! (broadcast channels, logging, SSE bridges, etc.).

use crate::events::McpEvent;

/// Trait for emitting events.
///
/// This abstraction keeps event plumbing consistent across crates and prevents
/// channel types from becoming part of the public API surface.
///
/// # Implementations
///
/// - `NoopEmitter` - For tests and one-shot CLI contexts that don't need events
/// - `EventBus` - Broadcast channel with `subscribe()`
pub trait EventEmitter: Send + Sync {
    /// Emit an event.
    ///
    /// This method must not block.
    fn emit(&self, event: McpEvent);
}

/// A no-op event emitter for tests and CLI contexts.
#[derive(Debug, Clone, Default)]
pub struct NoopEmitter;

impl NoopEmitter {
    /// Create a new no-op emitter.
    pub const fn new() -> Self {
        Self
    }
}

impl EventEmitter for NoopEmitter {
    fn emit(&self, _event: McpEvent) {}
}
