//! Raw configuration document handling.
//!
//! The store keeps the document exactly as written (placeholders unresolved)
//! so that persisting an update never writes secrets resolved from the
//! overlay back to disk. Resolution and validation produce a `ConfigSnapshot`.

use std::path::Path;

use chrono::{DateTime, Utc};
use mcpvisor_core::{ConfigSnapshot, ServerConfig, ServerConfigUpdate};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::env::{EnvOverlay, substitute_placeholders};
use crate::error::ConfigError;

pub const SERVERS_KEY: &str = "mcpServers";
const VERSION_KEY: &str = "version";
const LAST_UPDATED_KEY: &str = "lastUpdated";

/// Read and parse the document from disk.
pub fn read(path: &Path) -> Result<Value, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            ConfigError::io(path, &e)
        }
    })?;
    parse(&text)
}

/// Parse document text. The top level must be an object.
pub fn parse(text: &str) -> Result<Value, ConfigError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ConfigError::InvalidFormat(e.to_string()))?;
    if !value.is_object() {
        return Err(ConfigError::InvalidFormat(
            "top-level value must be an object".to_string(),
        ));
    }
    Ok(value)
}

/// Substitute placeholders and validate, producing a snapshot.
pub fn resolve(raw: &Value, overlay: &EnvOverlay) -> Result<ConfigSnapshot, ConfigError> {
    let mut doc = raw.clone();
    for warning in substitute_placeholders(&mut doc, overlay) {
        warn!(
            variable = %warning.variable,
            location = %warning.location,
            "Unresolved environment placeholder left as-is"
        );
    }
    build_snapshot(&doc)
}

fn build_snapshot(doc: &Value) -> Result<ConfigSnapshot, ConfigError> {
    let root = doc.as_object().ok_or_else(|| {
        ConfigError::InvalidFormat("top-level value must be an object".to_string())
    })?;

    let servers = root
        .get(SERVERS_KEY)
        .ok_or_else(|| ConfigError::MissingField(SERVERS_KEY.to_string()))?
        .as_object()
        .ok_or_else(|| ConfigError::InvalidFormat(format!("{SERVERS_KEY} must be an object")))?;

    if servers.is_empty() {
        return Err(ConfigError::InvalidFormat(format!(
            "{SERVERS_KEY} must contain at least one server"
        )));
    }

    let mut snapshot = ConfigSnapshot {
        version: root.get(VERSION_KEY).and_then(version_string),
        last_updated: root.get(LAST_UPDATED_KEY).and_then(parse_timestamp),
        ..ConfigSnapshot::default()
    };

    for (name, entry) in servers {
        let config = parse_entry(name, entry)?;
        snapshot.servers.insert(name.clone(), config);
    }

    Ok(snapshot)
}

fn parse_entry(name: &str, entry: &Value) -> Result<ServerConfig, ConfigError> {
    let fields = entry.as_object().ok_or_else(|| {
        ConfigError::InvalidFormat(format!("{SERVERS_KEY}.{name} must be an object"))
    })?;

    match fields.get("command") {
        Some(Value::String(cmd)) if !cmd.trim().is_empty() => {}
        Some(Value::String(_) | Value::Null) | None => {
            return Err(ConfigError::MissingField(format!(
                "{SERVERS_KEY}.{name}.command"
            )));
        }
        Some(_) => {
            return Err(ConfigError::InvalidFormat(format!(
                "{SERVERS_KEY}.{name}.command must be a string"
            )));
        }
    }

    let mut config: ServerConfig = serde_json::from_value(entry.clone())
        .map_err(|e| ConfigError::InvalidFormat(format!("{SERVERS_KEY}.{name}: {e}")))?;
    config.name = name.to_string();
    Ok(config)
}

fn version_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let text = value.as_str()?;
    match DateTime::parse_from_rfc3339(text) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(e) => {
            debug!(value = %text, error = %e, "Ignoring unparseable lastUpdated");
            None
        }
    }
}

/// Merge a partial update into the raw entry, creating it if absent.
pub fn merge_update(
    raw: &mut Value,
    name: &str,
    update: &ServerConfigUpdate,
) -> Result<(), ConfigError> {
    let root = raw.as_object_mut().ok_or_else(|| {
        ConfigError::InvalidFormat("top-level value must be an object".to_string())
    })?;

    let servers = root
        .entry(SERVERS_KEY)
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| ConfigError::InvalidFormat(format!("{SERVERS_KEY} must be an object")))?;

    let entry = servers
        .entry(name.to_string())
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| {
            ConfigError::InvalidFormat(format!("{SERVERS_KEY}.{name} must be an object"))
        })?;

    let patch = serde_json::to_value(update)
        .map_err(|e| ConfigError::InvalidFormat(format!("invalid update for {name}: {e}")))?;
    if let Value::Object(fields) = patch {
        for (key, value) in fields {
            entry.insert(key, value);
        }
    }

    Ok(())
}

/// Record the modification time in the document metadata.
pub fn stamp(raw: &mut Value, now: DateTime<Utc>) {
    if let Some(root) = raw.as_object_mut() {
        root.insert(
            LAST_UPDATED_KEY.to_string(),
            Value::String(now.to_rfc3339()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn overlay() -> EnvOverlay {
        EnvOverlay::from_vars([("TOKEN", "abc")])
    }

    #[test]
    fn test_resolve_valid_document() {
        let raw = json!({
            "version": 2,
            "lastUpdated": "2026-01-02T03:04:05Z",
            "mcpServers": {
                "fs": {"command": "npx", "args": ["-y", "fs"], "env": {"T": "${TOKEN}"}},
                "git": {"command": "uvx", "disabled": true}
            }
        });

        let snap = resolve(&raw, &overlay()).unwrap();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap.enabled_count(), 1);
        assert_eq!(snap.version.as_deref(), Some("2"));
        assert!(snap.last_updated.is_some());

        let fs = snap.get("fs").unwrap();
        assert_eq!(fs.name, "fs");
        assert_eq!(fs.env.get("T").map(String::as_str), Some("abc"));
        // Raw document is untouched
        assert_eq!(raw["mcpServers"]["fs"]["env"]["T"], "${TOKEN}");
    }

    #[test]
    fn test_missing_servers_key() {
        let err = resolve(&json!({"servers": {}}), &overlay()).unwrap_err();
        assert_eq!(err, ConfigError::MissingField("mcpServers".to_string()));
    }

    #[test]
    fn test_empty_servers_mapping() {
        let err = resolve(&json!({"mcpServers": {}}), &overlay()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidFormat(_)));
    }

    #[test]
    fn test_servers_not_a_mapping() {
        let err = resolve(&json!({"mcpServers": ["a"]}), &overlay()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidFormat(_)));
    }

    #[test]
    fn test_entry_without_command() {
        let raw = json!({"mcpServers": {"fs": {"args": []}}});
        let err = resolve(&raw, &overlay()).unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingField("mcpServers.fs.command".to_string())
        );
    }

    #[test]
    fn test_entry_with_wrong_types() {
        let raw = json!({"mcpServers": {"fs": {"command": "npx", "args": "not-a-list"}}});
        assert!(matches!(
            resolve(&raw, &overlay()),
            Err(ConfigError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_parse_rejects_bad_json() {
        assert!(matches!(
            parse("{ not json"),
            Err(ConfigError::InvalidFormat(_))
        ));
        assert!(matches!(parse("[1,2]"), Err(ConfigError::InvalidFormat(_))));
    }

    #[test]
    fn test_merge_update_existing_entry() {
        let mut raw = json!({"mcpServers": {"fs": {"command": "npx", "args": ["a"]}}});
        merge_update(&mut raw, "fs", &ServerConfigUpdate::disabled(true)).unwrap();

        assert_eq!(raw["mcpServers"]["fs"]["disabled"], true);
        assert_eq!(raw["mcpServers"]["fs"]["args"], json!(["a"]));
    }

    #[test]
    fn test_merge_update_creates_entry() {
        let mut raw = json!({"mcpServers": {"fs": {"command": "npx"}}});
        let update = ServerConfigUpdate {
            command: Some("uvx".to_string()),
            args: Some(vec!["mcp-server-git".to_string()]),
            ..ServerConfigUpdate::default()
        };
        merge_update(&mut raw, "git", &update).unwrap();

        let snap = resolve(&raw, &overlay()).unwrap();
        assert_eq!(snap.get("git").unwrap().command, "uvx");
    }

    #[test]
    fn test_stamp_sets_last_updated() {
        let mut raw = json!({"mcpServers": {}});
        let now = Utc::now();
        stamp(&mut raw, now);
        assert_eq!(raw["lastUpdated"], now.to_rfc3339());
    }
}
