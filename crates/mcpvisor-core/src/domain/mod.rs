//! Tool server domain types.
//!
//! These types represent configured servers and running workers, independent
//! of any infrastructure concerns (files, processes, pipes).
//!
//! # Design
//!
//! - `ServerConfig` - One entry of the configuration document
//! - `ServerConfigUpdate` - Partial update merged into an entry
//! - `ConfigSnapshot` - Immutable view of all entries
//! - `WorkerStatus` - Runtime status (starting, running, stopped, error)
//! - `WorkerSnapshot` / `ServerStatusEntry` / `StatusSummary` - Copies handed to callers
//! - `McpTool` - Tool exposed by a worker

mod server;
mod worker;

pub use server::{ConfigSnapshot, ServerConfig, ServerConfigUpdate};
pub use worker::{
    ExitInfo, McpTool, ServerStatusEntry, StatusSummary, WorkerSnapshot, WorkerStatus,
};
