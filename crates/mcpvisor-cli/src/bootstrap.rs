//! CLI bootstrap - the composition root.
//!
//! This module is the ONLY place where the event bus, configuration store
//! and supervisor are constructed and wired together. Handlers receive the
//! composed `CliContext`.

use std::path::PathBuf;
use std::sync::Arc;

use mcpvisor_config::{ConfigStore, ConfigStoreOptions};
use mcpvisor_core::EventBus;
use mcpvisor_mcp::{Supervisor, SupervisorOptions};
use tracing::debug;

use crate::error::CliError;

/// Bootstrap configuration for the CLI.
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// Path to the configuration document.
    pub config_path: PathBuf,
    /// Overlay file override.
    pub env_file: Option<PathBuf>,
    /// Supervisor timing and restart policy.
    pub supervisor: SupervisorOptions,
}

impl CliConfig {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            env_file: None,
            supervisor: SupervisorOptions::default(),
        }
    }

    fn store_options(&self) -> ConfigStoreOptions {
        let options = ConfigStoreOptions::new(&self.config_path);
        match &self.env_file {
            Some(path) => options.with_env_file(path),
            None => options,
        }
    }
}

/// Fully composed application context for CLI commands.
pub struct CliContext {
    /// Broadcast bus every component reports through.
    pub bus: EventBus,
    /// Loaded configuration store.
    pub store: Arc<ConfigStore>,
    /// Supervisor over the store's entries. Nothing is started yet.
    pub supervisor: Supervisor,
}

/// Build the context. Fails if the configuration cannot be loaded.
pub fn bootstrap(config: &CliConfig) -> Result<CliContext, CliError> {
    let bus = EventBus::new();

    let store = Arc::new(ConfigStore::new(
        config.store_options(),
        Arc::new(bus.clone()),
    ));
    store.initialize()?;

    let supervisor = Supervisor::new(
        Arc::clone(&store),
        config.supervisor.clone(),
        Arc::new(bus.clone()),
    );

    debug!(path = %config.config_path.display(), "CLI context ready");
    Ok(CliContext {
        bus,
        store,
        supervisor,
    })
}
