//! Available commands.

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Start all enabled servers and supervise them until Ctrl-C
    Run {
        /// Do not watch the configuration file for changes
        #[arg(long)]
        no_watch: bool,
        /// Do not restart servers that exit unexpectedly
        #[arg(long)]
        no_auto_restart: bool,
    },

    /// Load and validate the configuration, then list its entries
    Validate,

    /// Start all enabled servers, print their status, and stop them
    Status {
        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Start one server and invoke a tool on it
    Call {
        /// Server name
        server: String,
        /// Tool name
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(long)]
        args: Option<String>,
    },

    /// Enable a configured server
    Enable {
        /// Server name
        name: String,
    },

    /// Disable a configured server
    Disable {
        /// Server name
        name: String,
    },
}
