//! The configuration store: single source of truth for server definitions.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use mcpvisor_core::{ConfigSnapshot, EventEmitter, McpEvent, ServerConfig, ServerConfigUpdate};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::document;
use crate::env::EnvOverlay;
use crate::error::ConfigError;
use crate::watcher::ConfigWatcher;

/// Default quiet interval before a burst of file events triggers a reload.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(1000);

/// Default overlay file name, looked up next to the configuration file.
pub const DEFAULT_ENV_FILE: &str = ".env";

/// Where the store reads from and how it watches.
#[derive(Debug, Clone)]
pub struct ConfigStoreOptions {
    /// Path to the JSON configuration document.
    pub config_path: PathBuf,
    /// Overlay file; defaults to `.env` beside the configuration file.
    pub env_path: Option<PathBuf>,
    /// Debounce window for file change events.
    pub debounce: Duration,
}

impl ConfigStoreOptions {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            env_path: None,
            debounce: DEFAULT_DEBOUNCE,
        }
    }

    #[must_use]
    pub fn with_env_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.env_path = Some(path.into());
        self
    }

    #[must_use]
    pub const fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Resolved overlay file path.
    pub fn env_file(&self) -> PathBuf {
        self.env_path.clone().unwrap_or_else(|| {
            self.config_path
                .parent()
                .unwrap_or_else(|| Path::new(""))
                .join(DEFAULT_ENV_FILE)
        })
    }
}

struct StoreState {
    /// Document as written on disk, placeholders unresolved.
    raw: Value,
    overlay: Arc<EnvOverlay>,
    snapshot: Arc<ConfigSnapshot>,
}

/// Loads, validates, persists and watches the configuration document.
///
/// The current snapshot is read-shared as `Arc<ConfigSnapshot>` and replaced
/// atomically; readers never see a partially-updated snapshot. A failed
/// reload never replaces a good snapshot.
pub struct ConfigStore {
    options: ConfigStoreOptions,
    emitter: Arc<dyn EventEmitter>,
    state: RwLock<StoreState>,
    /// Serializes writers (update_entry, reload).
    write_lock: Mutex<()>,
}

impl ConfigStore {
    /// Create a store. Nothing is read until `initialize` is called.
    pub fn new(options: ConfigStoreOptions, emitter: Arc<dyn EventEmitter>) -> Self {
        Self {
            options,
            emitter,
            state: RwLock::new(StoreState {
                raw: Value::Null,
                overlay: Arc::new(EnvOverlay::process_only()),
                snapshot: Arc::new(ConfigSnapshot::default()),
            }),
            write_lock: Mutex::new(()),
        }
    }

    /// Load the overlay and the document, validate, and install the first snapshot.
    ///
    /// Errors here are fatal for the caller; no partial state is kept.
    pub fn initialize(&self) -> Result<Arc<ConfigSnapshot>, ConfigError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let overlay = Arc::new(EnvOverlay::load(&self.options.env_file()));
        let raw = document::read(&self.options.config_path)?;
        let snapshot = Arc::new(document::resolve(&raw, &overlay)?);

        info!(
            path = %self.options.config_path.display(),
            servers = snapshot.len(),
            enabled = snapshot.enabled_count(),
            "Loaded MCP server configuration"
        );

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        *state = StoreState {
            raw,
            overlay,
            snapshot: Arc::clone(&snapshot),
        };
        Ok(snapshot)
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        Arc::clone(&self.read_state().snapshot)
    }

    /// Entries with `disabled` false.
    pub fn enabled_entries(&self) -> Vec<ServerConfig> {
        self.snapshot().enabled().cloned().collect()
    }

    /// A single entry, disabled or not.
    pub fn entry(&self, name: &str) -> Option<ServerConfig> {
        self.snapshot().get(name).cloned()
    }

    /// The environment overlay loaded alongside the document.
    pub fn overlay(&self) -> Arc<EnvOverlay> {
        Arc::clone(&self.read_state().overlay)
    }

    pub fn path(&self) -> &Path {
        &self.options.config_path
    }

    pub const fn options(&self) -> &ConfigStoreOptions {
        &self.options
    }

    /// Merge a partial update into `name` (creating it if absent) and persist.
    ///
    /// The whole document is validated before anything is written. The file
    /// is replaced via write-then-rename so a watcher never observes a
    /// partially-written file.
    pub fn update_entry(
        &self,
        name: &str,
        update: &ServerConfigUpdate,
    ) -> Result<Arc<ConfigSnapshot>, ConfigError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let (mut raw, overlay, old) = {
            let state = self.read_state();
            let raw = if state.raw.is_null() {
                Value::Object(serde_json::Map::new())
            } else {
                state.raw.clone()
            };
            (raw, Arc::clone(&state.overlay), Arc::clone(&state.snapshot))
        };

        document::merge_update(&mut raw, name, update)?;
        document::stamp(&mut raw, Utc::now());
        let snapshot = Arc::new(document::resolve(&raw, &overlay)?);

        let text = serde_json::to_string_pretty(&raw)
            .map_err(|e| ConfigError::InvalidFormat(e.to_string()))?;
        write_atomically(&self.options.config_path, text.as_bytes())?;

        self.install(raw, overlay, Arc::clone(&snapshot));
        info!(server_name = %name, "Updated MCP server configuration");

        if old.servers != snapshot.servers {
            self.emitter
                .emit(McpEvent::config_changed(old, Arc::clone(&snapshot)));
        }
        Ok(snapshot)
    }

    /// Re-read the overlay and the document.
    ///
    /// Returns the `(old, new)` pair when the snapshot changed, `None` when
    /// the reload produced an identical snapshot. On error the previous
    /// snapshot stays authoritative.
    pub fn reload(&self) -> Result<Option<(Arc<ConfigSnapshot>, Arc<ConfigSnapshot>)>, ConfigError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let overlay = Arc::new(EnvOverlay::load(&self.options.env_file()));
        let raw = document::read(&self.options.config_path)?;
        let snapshot = Arc::new(document::resolve(&raw, &overlay)?);

        let old = self.snapshot();
        self.install(raw, overlay, Arc::clone(&snapshot));

        if *old == *snapshot {
            debug!(path = %self.options.config_path.display(), "Configuration reloaded, no changes");
            return Ok(None);
        }

        info!(
            servers = snapshot.len(),
            enabled = snapshot.enabled_count(),
            "Configuration reloaded"
        );
        Ok(Some((old, snapshot)))
    }

    /// Reload and report the outcome as an event. Used by the watcher.
    pub fn reload_and_notify(&self) {
        match self.reload() {
            Ok(Some((old, new))) => self.emitter.emit(McpEvent::config_changed(old, new)),
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Configuration reload failed, keeping previous configuration");
                self.emitter.emit(McpEvent::reload_error(e.to_string()));
            }
        }
    }

    /// Start watching the backing file. Must be called inside a tokio runtime.
    ///
    /// Watching stops when the returned handle is dropped.
    pub fn watch(self: &Arc<Self>) -> Result<ConfigWatcher, ConfigError> {
        ConfigWatcher::spawn(Arc::clone(self))
    }

    fn install(&self, raw: Value, overlay: Arc<EnvOverlay>, snapshot: Arc<ConfigSnapshot>) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        *state = StoreState {
            raw,
            overlay,
            snapshot,
        };
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("path", &self.options.config_path)
            .finish_non_exhaustive()
    }
}

/// Write to a temporary file in the same directory, then rename over `path`.
fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), ConfigError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| ConfigError::io(dir, &e))?;
    tmp.write_all(contents)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| ConfigError::io(tmp.path(), &e))?;
    tmp.persist(path)
        .map_err(|e| ConfigError::io(path, &e.error))?;
    Ok(())
}
