//! Core domain types and port definitions for mcpvisor.
//!
//! This crate has no knowledge of files, processes or pipes. It defines the
//! configuration and worker types, the event vocabulary, and the
//! `EventEmitter` port that the config store and supervisor report through.
#![deny(unsafe_code)]
#![deny(unused_crate_dependencies)]

pub mod domain;
pub mod events;
pub mod ports;

// Re-export commonly used types for convenience
pub use domain::{
    ConfigSnapshot, ExitInfo, McpTool, ServerConfig, ServerConfigUpdate, ServerStatusEntry,
    StatusSummary, WorkerSnapshot, WorkerStatus,
};
pub use events::{EventBus, McpEvent};
pub use ports::{EventEmitter, McpErrorCategory, McpErrorInfo, NoopEmitter, ToolCallError};
