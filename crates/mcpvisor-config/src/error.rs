//! Configuration error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading, validating or persisting the configuration.
///
/// During `ConfigStore::initialize` every variant is fatal. During a reload
/// the same errors are reported as `reload_error` events instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The configuration file does not exist.
    #[error("Configuration file not found: {}", path.display())]
    NotFound { path: PathBuf },

    /// The document is not well-formed or has the wrong shape.
    #[error("Invalid configuration format: {0}")]
    InvalidFormat(String),

    /// A required field is absent.
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Reading or writing the file failed.
    #[error("Configuration I/O error for {}: {reason}", path.display())]
    Io { path: PathBuf, reason: String },

    /// The file watcher could not be installed.
    #[error("Failed to watch configuration: {0}")]
    Watch(String),
}

impl ConfigError {
    pub(crate) fn io(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            reason: err.to_string(),
        }
    }
}
