//! Run command handler.
//!
//! Supervises the configured servers until Ctrl-C: starts every enabled
//! entry, watches the configuration file, reconciles on change, and logs
//! every lifecycle event.

use anyhow::{Context, Result};
use mcpvisor_core::McpEvent;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bootstrap::CliContext;
use crate::error::CliError;

pub async fn execute(ctx: &CliContext, watch: bool) -> Result<()> {
    let logger = spawn_event_logger(ctx.bus.subscribe());
    let reconciler = ctx.supervisor.spawn_reconciler(ctx.bus.subscribe());

    let results = ctx.supervisor.initialize().await;
    let failed = results.iter().filter(|(_, r)| r.is_err()).count();
    if failed > 0 {
        warn!(failed, "Some servers failed to start");
    }

    let watcher = if watch {
        Some(ctx.store.watch().map_err(CliError::from)?)
    } else {
        None
    };

    let summary = ctx.supervisor.status_summary().await;
    println!(
        "Supervising {} server(s) ({} running). Press Ctrl-C to stop.",
        summary.enabled, summary.running
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    println!("Shutting down...");

    if let Some(watcher) = watcher {
        watcher.stop().await;
    }
    ctx.supervisor.shutdown().await;
    if let Err(e) = reconciler.await {
        warn!(error = %e, "Reconciler task failed");
    }
    logger.abort();

    Ok(())
}

fn spawn_event_logger(mut rx: broadcast::Receiver<McpEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event logger lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &McpEvent) {
    match event {
        McpEvent::ServerStarted {
            server_name,
            pid,
            tools,
        } => info!(event = event.event_name(), server_name = %server_name, pid, tools = tools.len()),
        McpEvent::ServerStopped { server_name, exit } => match exit {
            Some(exit) => info!(event = event.event_name(), server_name = %server_name, %exit),
            None => info!(event = event.event_name(), server_name = %server_name),
        },
        McpEvent::ServerError { error } => {
            warn!(event = event.event_name(), server_name = %error.server_name, message = %error.message);
        }
        McpEvent::ConfigChanged { new, .. } => {
            info!(event = event.event_name(), servers = new.len(), enabled = new.enabled_count());
        }
        McpEvent::ReloadError { message } => {
            warn!(event = event.event_name(), message = %message);
        }
    }
}
