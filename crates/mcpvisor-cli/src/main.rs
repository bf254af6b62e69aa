//! CLI entry point - the composition root.
//!
//! Logging is installed here, the context is built through `bootstrap`, and
//! commands are dispatched to handlers.

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use mcpvisor_cli::{Cli, CliConfig, CliError, Commands, bootstrap, handlers};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            let code = e
                .downcast_ref::<CliError>()
                .map_or(1, CliError::exit_code);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

/// `RUST_LOG` wins; otherwise `info`, or `debug` with `--verbose`.
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = CliConfig::new(cli.config);
    config.env_file = cli.env_file;
    if let Commands::Run {
        no_auto_restart: true,
        ..
    } = cli.command
    {
        config.supervisor.auto_restart = false;
    }

    let ctx = bootstrap(&config)?;

    match cli.command {
        Commands::Run { no_watch, .. } => handlers::run::execute(&ctx, !no_watch).await?,
        Commands::Validate => handlers::validate::execute(&ctx)?,
        Commands::Status { json } => handlers::status::execute(&ctx, json).await?,
        Commands::Call { server, tool, args } => {
            handlers::call::execute(&ctx, &server, &tool, args.as_deref()).await?;
        }
        Commands::Enable { name } => handlers::toggle::execute(&ctx, &name, false)?,
        Commands::Disable { name } => handlers::toggle::execute(&ctx, &name, true)?,
    }

    Ok(())
}
