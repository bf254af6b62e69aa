//! Tool server configuration types.
//!
//! A `ConfigSnapshot` is the resolved (placeholders substituted) view of the
//! configuration document. Snapshots are immutable: a reload produces a new
//! snapshot that replaces the previous one wholesale.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Definition of a single tool server, as found under `mcpServers.<name>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique key of the entry. Filled from the mapping key, never stored in the entry body.
    #[serde(skip)]
    pub name: String,

    /// Executable to launch (name resolved via PATH, or a path).
    pub command: String,

    /// Arguments passed to the executable.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Environment overrides for this server only.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Disabled entries are never started.
    #[serde(default)]
    pub disabled: bool,

    /// Working directory for the process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

impl ServerConfig {
    /// Create a config for `command` with no arguments.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            ..Self::default()
        }
    }

    /// Set the argument list.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Add an environment override.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the disabled flag.
    #[must_use]
    pub const fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub const fn is_enabled(&self) -> bool {
        !self.disabled
    }
}

/// Partial update for a server entry.
///
/// All fields are optional - only provided fields are merged into the entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfigUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

impl ServerConfigUpdate {
    /// Update that only toggles the disabled flag.
    pub fn disabled(disabled: bool) -> Self {
        Self {
            disabled: Some(disabled),
            ..Self::default()
        }
    }
}

/// Immutable view of the whole configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSnapshot {
    /// All entries keyed by name, disabled ones included.
    pub servers: BTreeMap<String, ServerConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl ConfigSnapshot {
    /// Build a snapshot from a list of configs, keyed by their names.
    pub fn from_servers(servers: impl IntoIterator<Item = ServerConfig>) -> Self {
        Self {
            servers: servers.into_iter().map(|s| (s.name.clone(), s)).collect(),
            version: None,
            last_updated: None,
        }
    }

    /// Look up an entry regardless of its disabled flag.
    pub fn get(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.get(name)
    }

    /// Entries whose `disabled` flag is false.
    pub fn enabled(&self) -> impl Iterator<Item = &ServerConfig> {
        self.servers.values().filter(|s| s.is_enabled())
    }

    /// Look up an entry only if it is enabled.
    pub fn get_enabled(&self, name: &str) -> Option<&ServerConfig> {
        self.get(name).filter(|s| s.is_enabled())
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn enabled_count(&self) -> usize {
        self.enabled().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> ConfigSnapshot {
        ConfigSnapshot::from_servers([
            ServerConfig::new("a", "node").with_args(["a.js"]),
            ServerConfig::new("b", "python3").with_env("TOKEN", "x"),
            ServerConfig::new("c", "deno").with_disabled(true),
        ])
    }

    #[test]
    fn test_enabled_filters_disabled_entries() {
        let snap = snapshot();
        let names: Vec<&str> = snap.enabled().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(snap.enabled_count(), 2);
        assert_eq!(snap.len(), 3);
    }

    #[test]
    fn test_get_enabled_hides_disabled() {
        let snap = snapshot();
        assert!(snap.get("c").is_some());
        assert!(snap.get_enabled("c").is_none());
        assert!(snap.get_enabled("a").is_some());
    }

    #[test]
    fn test_entry_deserializes_with_defaults() {
        let cfg: ServerConfig = serde_json::from_str(r#"{"command":"npx"}"#).unwrap();
        assert_eq!(cfg.command, "npx");
        assert!(cfg.args.is_empty());
        assert!(cfg.env.is_empty());
        assert!(!cfg.disabled);
        assert!(cfg.cwd.is_none());
    }

    #[test]
    fn test_config_equality_is_deep() {
        let a = ServerConfig::new("a", "node").with_env("K", "1");
        let b = ServerConfig::new("a", "node").with_env("K", "2");
        assert_ne!(a, b);
        assert_eq!(a.clone(), a);
    }
}
