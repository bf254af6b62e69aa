//! Reconciliation planning between two configuration snapshots.

use std::collections::BTreeSet;

use mcpvisor_core::ConfigSnapshot;

/// One per-name step of a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Newly enabled entry.
    Start(String),
    /// Entry removed or disabled; the worker is stopped and deregistered.
    Stop(String),
    /// Entry definition changed.
    Restart(String),
}

/// Compute the actions that move the enabled set of `old` to that of `new`.
///
/// Only enabled entries are compared, so a disabled entry whose fields change
/// produces nothing. Actions are ordered by name.
pub fn plan(old: &ConfigSnapshot, new: &ConfigSnapshot) -> Vec<ReconcileAction> {
    let names: BTreeSet<&str> = old
        .enabled()
        .chain(new.enabled())
        .map(|s| s.name.as_str())
        .collect();

    names
        .into_iter()
        .filter_map(|name| match (old.get_enabled(name), new.get_enabled(name)) {
            (Some(_), None) => Some(ReconcileAction::Stop(name.to_string())),
            (None, Some(_)) => Some(ReconcileAction::Start(name.to_string())),
            (Some(before), Some(after)) if before != after => {
                Some(ReconcileAction::Restart(name.to_string()))
            }
            _ => None,
        })
        .collect()
}
