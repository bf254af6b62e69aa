//! Main CLI parser and top-level argument handling.

use std::path::PathBuf;

use clap::Parser;

use crate::commands::Commands;

/// Supervise MCP tool server processes from a declarative configuration.
#[derive(Parser)]
#[command(name = "mcpvisor")]
#[command(about = "Supervise MCP tool server processes")]
#[command(version)]
pub struct Cli {
    /// Path to the MCP server configuration file
    #[arg(
        short = 'c',
        long = "config",
        env = "MCPVISOR_CONFIG",
        default_value = "mcp.json",
        global = true
    )]
    pub config: PathBuf,

    /// Environment overlay file (defaults to .env next to the configuration)
    #[arg(long = "env-file", env = "MCPVISOR_ENV_FILE", global = true)]
    pub env_file: Option<PathBuf>,

    /// Enable verbose/debug output
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parser_builds() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_args() {
        let cli = Cli::parse_from([
            "mcpvisor",
            "--verbose",
            "--config",
            "/etc/mcpvisor/mcp.json",
            "validate",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.config, PathBuf::from("/etc/mcpvisor/mcp.json"));
        assert!(matches!(cli.command, Commands::Validate));
    }

    #[test]
    fn test_call_args() {
        let cli = Cli::parse_from([
            "mcpvisor",
            "call",
            "filesystem",
            "read_file",
            "--args",
            r#"{"path": "/tmp/x"}"#,
        ]);
        match cli.command {
            Commands::Call { server, tool, args } => {
                assert_eq!(server, "filesystem");
                assert_eq!(tool, "read_file");
                assert_eq!(args.as_deref(), Some(r#"{"path": "/tmp/x"}"#));
            }
            _ => panic!("expected call command"),
        }
    }
}
