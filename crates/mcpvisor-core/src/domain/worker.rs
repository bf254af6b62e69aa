//! Runtime worker types exposed to callers.
//!
//! Callers never get references into the supervisor's registry; they receive
//! `WorkerSnapshot` / `ServerStatusEntry` copies.

use std::fmt;
use std::process::ExitStatus;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::server::ServerConfig;

/// Runtime status of a worker instance.
///
/// Legal transitions: `starting -> {running, error}`, `running -> stopped`,
/// `stopped -> starting`, and anything `-> stopped` during shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Process spawned, startup grace period not yet elapsed
    Starting,
    /// Process alive after the grace period
    Running,
    /// Process exited or was stopped
    Stopped,
    /// Spawn failed or the process died during startup
    Error,
}

impl WorkerStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a worker process exited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    /// Exit code, absent when killed by a signal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    /// Terminating signal (Unix only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub const fn with_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub const fn with_signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    /// A clean exit is exit code zero.
    pub const fn is_clean(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Tool definition discovered from a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpTool {
    /// Tool name (function name).
    pub name: String,

    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// JSON Schema for input parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
}

impl McpTool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema: None,
        }
    }
}

/// Point-in-time copy of a worker instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    pub name: String,
    /// Configuration the worker was started from.
    pub config: ServerConfig,
    pub status: WorkerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Empty until capability negotiation succeeds.
    pub tools: Vec<McpTool>,
    /// Whether a capability client is attached.
    pub capabilities: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_exit: Option<ExitInfo>,
}

impl WorkerSnapshot {
    /// Milliseconds since start while running, zero otherwise.
    pub fn uptime_ms(&self, now: DateTime<Utc>) -> u64 {
        match (self.status, self.started_at) {
            (WorkerStatus::Running, Some(started)) => {
                u64::try_from((now - started).num_milliseconds()).unwrap_or(0)
            }
            _ => 0,
        }
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name.clone()).collect()
    }

    /// Status entry for external consumers.
    pub fn status_entry(&self, now: DateTime<Utc>) -> ServerStatusEntry {
        ServerStatusEntry {
            name: self.name.clone(),
            status: self.status,
            pid: self.pid,
            uptime_ms: self.uptime_ms(now),
            tools: self.tool_names(),
            error: self.last_error.clone(),
        }
    }
}

/// Per-worker status for UI/HTTP collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatusEntry {
    pub name: String,
    pub status: WorkerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub uptime_ms: u64,
    pub tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate status view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSummary {
    pub total_configured: usize,
    pub enabled: usize,
    pub running: usize,
    pub errored: usize,
    pub servers: Vec<ServerStatusEntry>,
}
