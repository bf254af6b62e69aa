//! Worker supervision and MCP capability negotiation.
//!
//! This crate spawns and supervises the configured tool server processes,
//! speaks the request/response subset of MCP over their stdio, and keeps the
//! running set reconciled with the `ConfigStore`.
#![deny(unsafe_code)]
#![deny(unused_crate_dependencies)]

// Only the unix test modules spawn real workers
#[cfg(all(test, not(unix)))]
use tempfile as _;

mod client;
mod process;
mod reconcile;
mod supervisor;
mod transport;

pub use client::{
    CLIENT_NAME, CapabilityClient, CapabilityError, InitializeResult, PROTOCOL_VERSION,
    ServerCapabilities, ServerInfo,
};
pub use process::shutdown_child;
pub use reconcile::{ReconcileAction, plan};
pub use supervisor::{Supervisor, SupervisorError, SupervisorOptions};
pub use transport::{ChannelError, StdioChannel};
