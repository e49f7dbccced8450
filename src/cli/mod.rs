//! CLI command definitions

use crate::config::DriverKind;
use crate::daemon::ipc::DEFAULT_LOG_LINES;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sandhold")]
#[command(about = "Sandbox orchestration for containerized MCP plugin servers", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (defaults to <data dir>/config.json)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Daemon socket path
    #[arg(short, long, global = true)]
    pub socket: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the daemon in the foreground: bring up the runtime and all plugins
    Daemon {
        /// Override the machine driver (auto, podman-machine, podman-service)
        #[arg(long)]
        driver: Option<DriverKind>,
    },

    /// Show runtime, image, container and tool status
    Status {
        /// Print the raw JSON summary
        #[arg(long)]
        json: bool,
    },

    /// Print a plugin's recent container output
    Logs {
        /// Plugin ID
        plugin: String,

        /// Number of lines
        #[arg(short = 'n', long, default_value_t = DEFAULT_LOG_LINES)]
        lines: usize,
    },

    /// Send a JSON-RPC request to a plugin and print the response
    Call {
        /// Plugin ID
        plugin: String,

        /// Request body, or "-" to read it from stdin
        body: String,
    },

    /// Stream status and progress events
    Watch,

    /// Restart a plugin from its stored record
    Restart {
        /// Plugin ID
        plugin: String,
    },

    /// Stop a plugin and remove it from the running set
    Stop {
        /// Plugin ID
        plugin: String,
    },

    /// Stop all plugins and the runtime, then exit the daemon
    Shutdown,
}
