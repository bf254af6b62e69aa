//! CLI-specific error types and mappings.
//!
//! Maps library errors to exit codes and user-facing messages.

use mcpvisor_config::ConfigError;
use mcpvisor_core::ToolCallError;
use mcpvisor_mcp::SupervisorError;
use thiserror::Error;

/// CLI-specific error type.
#[derive(Debug, Error)]
pub enum CliError {
    /// Argument parsing error.
    #[error("Invalid arguments: {0}")]
    Arguments(String),

    /// Configuration could not be loaded or saved.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A worker could not be started.
    #[error("Process error: {0}")]
    Process(String),

    /// A tool call failed.
    #[error("Tool call failed: {0}")]
    ToolCall(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(String),
}

impl CliError {
    /// Map error to appropriate exit code.
    ///
    /// Exit codes follow Unix conventions (see sysexits.h).
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Arguments(_) => 64, // EX_USAGE
            Self::Config(_) => 78,    // EX_CONFIG
            Self::Process(_) => 71,   // EX_OSERR
            Self::ToolCall(_) => 69,  // EX_UNAVAILABLE
            Self::Io(_) => 74,        // EX_IOERR
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Io { .. } => Self::Io(err.to_string()),
            other => Self::Config(other.to_string()),
        }
    }
}

impl From<SupervisorError> for CliError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::NotConfigured(_) => Self::Config(err.to_string()),
            other => Self::Process(other.to_string()),
        }
    }
}

impl From<ToolCallError> for CliError {
    fn from(err: ToolCallError) -> Self {
        Self::ToolCall(err.to_string())
    }
}
