//! Canonical event union for supervisor and configuration events.
//!
//! # Vocabulary
//!
//! - `server_started` - worker passed its startup grace period
//! - `server_stopped` - worker exited or was stopped
//! - `server_error` - spawn failure, startup crash, or failed auto-restart
//! - `config_changed` - a new configuration snapshot replaced the old one
//! - `reload_error` - the configuration file changed but could not be loaded
//!
//! Events for a single server are emitted in the order the transitions
//! happened. No ordering is guaranteed across servers.
//!
//! # Wire Format
//!
//! Events are serialized with a `type` tag:
//!
//! ```json
//! { "type": "server_started", "serverName": "filesystem", "pid": 4242, "tools": ["read_file"] }
//! ```

mod bus;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::domain::{ConfigSnapshot, ExitInfo};
use crate::ports::McpErrorInfo;

pub use bus::EventBus;

/// Canonical event type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum McpEvent {
    /// A worker is running.
    ServerStarted {
        #[serde(rename = "serverName")]
        server_name: String,
        pid: u32,
        /// Tool names discovered during capability negotiation (may be empty).
        tools: Vec<String>,
    },

    /// A worker stopped, either on request or by exiting.
    ServerStopped {
        #[serde(rename = "serverName")]
        server_name: String,
        /// Exit information, when the process was reaped.
        #[serde(skip_serializing_if = "Option::is_none")]
        exit: Option<ExitInfo>,
    },

    /// A worker failed.
    ServerError {
        /// User-safe error information.
        error: McpErrorInfo,
    },

    /// The configuration snapshot was replaced.
    ConfigChanged {
        old: Arc<ConfigSnapshot>,
        new: Arc<ConfigSnapshot>,
    },

    /// A reload failed; the previous snapshot remains authoritative.
    ReloadError { message: String },
}

impl McpEvent {
    pub fn server_started(server_name: impl Into<String>, pid: u32, tools: Vec<String>) -> Self {
        Self::ServerStarted {
            server_name: server_name.into(),
            pid,
            tools,
        }
    }

    pub fn server_stopped(server_name: impl Into<String>, exit: Option<ExitInfo>) -> Self {
        Self::ServerStopped {
            server_name: server_name.into(),
            exit,
        }
    }

    pub const fn server_error(error: McpErrorInfo) -> Self {
        Self::ServerError { error }
    }

    pub const fn config_changed(old: Arc<ConfigSnapshot>, new: Arc<ConfigSnapshot>) -> Self {
        Self::ConfigChanged { old, new }
    }

    pub fn reload_error(message: impl Into<String>) -> Self {
        Self::ReloadError {
            message: message.into(),
        }
    }

    /// Get the event name for wire protocols.
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::ServerStarted { .. } => "server:started",
            Self::ServerStopped { .. } => "server:stopped",
            Self::ServerError { .. } => "server:error",
            Self::ConfigChanged { .. } => "config:changed",
            Self::ReloadError { .. } => "config:reload_error",
        }
    }

    /// Server the event is about, if any.
    pub fn server_name(&self) -> Option<&str> {
        match self {
            Self::ServerStarted { server_name, .. } | Self::ServerStopped { server_name, .. } => {
                Some(server_name)
            }
            Self::ServerError { error } => Some(&error.server_name),
            Self::ConfigChanged { .. } | Self::ReloadError { .. } => None,
        }
    }
}
