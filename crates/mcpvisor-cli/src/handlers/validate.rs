//! Validate command handler.

use anyhow::Result;

use crate::bootstrap::CliContext;

/// Print every configured entry. Loading already validated the document.
pub fn execute(ctx: &CliContext) -> Result<()> {
    let snapshot = ctx.store.snapshot();

    println!(
        "Configuration OK: {} ({} server(s), {} enabled)\n",
        ctx.store.path().display(),
        snapshot.len(),
        snapshot.enabled_count()
    );
    println!("{:<24} {:<9} Command", "Name", "State");
    println!("{}", "-".repeat(72));

    for server in snapshot.servers.values() {
        let state = if server.disabled { "disabled" } else { "enabled" };
        let mut command = server.command.clone();
        for arg in &server.args {
            command.push(' ');
            command.push_str(arg);
        }
        println!("{:<24} {:<9} {}", server.name, state, command);
    }

    Ok(())
}
