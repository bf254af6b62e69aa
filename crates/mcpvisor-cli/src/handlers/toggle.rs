//! Enable/disable command handler.

use anyhow::Result;
use mcpvisor_core::ServerConfigUpdate;

use crate::bootstrap::CliContext;
use crate::error::CliError;

/// Set the `disabled` flag of an existing entry and persist it.
///
/// A running `mcpvisor run` picks the change up through its file watcher.
pub fn execute(ctx: &CliContext, name: &str, disabled: bool) -> Result<()> {
    let Some(entry) = ctx.store.entry(name) else {
        return Err(CliError::Arguments(format!("unknown server '{name}'")).into());
    };

    if entry.disabled == disabled {
        println!("'{name}' is already {}", state(disabled));
        return Ok(());
    }

    ctx.store
        .update_entry(name, &ServerConfigUpdate::disabled(disabled))
        .map_err(CliError::from)?;
    println!("'{name}' is now {}", state(disabled));
    Ok(())
}

const fn state(disabled: bool) -> &'static str {
    if disabled { "disabled" } else { "enabled" }
}
