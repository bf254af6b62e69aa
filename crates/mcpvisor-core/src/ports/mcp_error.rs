//! Tool call errors and user-safe error payloads.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned to callers of `call_tool`.
///
/// These never crash the supervisor or affect other workers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolCallError {
    /// No worker instance is registered under this name.
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// The worker exists but is not in `running` status.
    #[error("Server not running: {0}")]
    ServerNotRunning(String),

    /// The worker is running but capability negotiation did not succeed.
    #[error("Server '{0}' has no capability client attached")]
    CapabilityUnavailable(String),

    /// The tool was not in the worker's enumerated tool set.
    #[error("Tool '{tool}' not found on server '{server}'")]
    ToolNotFound { server: String, tool: String },

    /// The worker answered with an error, or the channel failed.
    #[error("Upstream error from '{server}': {message}")]
    UpstreamError { server: String, message: String },

    /// No response within the tool call timeout.
    #[error("Tool call to '{server}' timed out")]
    Timeout { server: String },
}

impl ToolCallError {
    /// Name of the server the error relates to.
    pub fn server(&self) -> &str {
        match self {
            Self::ServerNotFound(s) | Self::ServerNotRunning(s) | Self::CapabilityUnavailable(s) => {
                s
            }
            Self::ToolNotFound { server, .. }
            | Self::UpstreamError { server, .. }
            | Self::Timeout { server } => server,
        }
    }
}

/// User-safe error information for `server_error` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpErrorInfo {
    /// Name of the server.
    pub server_name: String,

    /// User-friendly error message.
    pub message: String,

    /// Error category for UI handling.
    pub category: McpErrorCategory,
}

/// Categories of worker errors for UI handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpErrorCategory {
    /// The command could not be spawned at all.
    Spawn,
    /// The process exited within the startup grace period.
    StartupCrash,
}

impl McpErrorInfo {
    pub fn new(
        server_name: impl Into<String>,
        message: impl Into<String>,
        category: McpErrorCategory,
    ) -> Self {
        Self {
            server_name: server_name.into(),
            message: message.into(),
            category,
        }
    }

    /// Create error info for a spawn failure.
    pub fn spawn(server_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(server_name, message, McpErrorCategory::Spawn)
    }

    /// Create error info for an exit during startup.
    pub fn startup_crash(server_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(server_name, message, McpErrorCategory::StartupCrash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_call_error_server() {
        assert_eq!(ToolCallError::ServerNotFound("a".into()).server(), "a");
        let err = ToolCallError::ToolNotFound {
            server: "b".into(),
            tool: "t".into(),
        };
        assert_eq!(err.server(), "b");
        assert_eq!(err.to_string(), "Tool 't' not found on server 'b'");
    }

    #[test]
    fn test_error_info_serialization() {
        let info = McpErrorInfo::startup_crash("fs", "exited during startup");
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"serverName\":\"fs\""));
        assert!(json.contains("\"category\":\"startup_crash\""));
        assert_eq!(
            McpErrorInfo::spawn("fs", "not found").category,
            McpErrorCategory::Spawn
        );
    }
}
