//! Status command handler.

use anyhow::Result;
use mcpvisor_core::StatusSummary;

use crate::bootstrap::CliContext;

/// Start every enabled server, report the status surface, and stop them again.
pub async fn execute(ctx: &CliContext, json: bool) -> Result<()> {
    ctx.supervisor.initialize().await;
    let summary = ctx.supervisor.status_summary().await;
    ctx.supervisor.shutdown().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn print_summary(summary: &StatusSummary) {
    println!(
        "{} configured, {} enabled, {} running, {} error\n",
        summary.total_configured, summary.enabled, summary.running, summary.errored
    );
    println!("{:<24} {:<9} {:<8} Tools / Error", "Name", "Status", "PID");
    println!("{}", "-".repeat(72));

    for server in &summary.servers {
        let pid = server
            .pid
            .map_or_else(|| "--".to_string(), |p| p.to_string());
        let detail = match &server.error {
            Some(error) => error.clone(),
            None if server.tools.is_empty() => "--".to_string(),
            None => server.tools.join(", "),
        };
        println!(
            "{:<24} {:<9} {:<8} {}",
            server.name, server.status, pid, detail
        );
    }
}
