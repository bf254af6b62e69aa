//! Configuration store for mcpvisor.
//!
//! Loads the `mcpServers` JSON document, resolves `${VAR}` placeholders
//! against a dotenv overlay, persists partial updates atomically, and
//! watches the file for external edits. Changes are reported through the
//! `EventEmitter` port as `config_changed` / `reload_error` events.
#![deny(unsafe_code)]
#![deny(unused_crate_dependencies)]

mod document;
mod env;
mod error;
mod store;
mod watcher;

pub use document::SERVERS_KEY;
pub use env::{EnvOverlay, EnvSubstitutionWarning, substitute_placeholders, substitute_str};
pub use error::ConfigError;
pub use store::{ConfigStore, ConfigStoreOptions, DEFAULT_DEBOUNCE, DEFAULT_ENV_FILE};
pub use watcher::ConfigWatcher;
