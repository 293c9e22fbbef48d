//! Command-line argument parsing for Tidal binaries.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::Config;

/// Tidal command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug)]
#[command(name = "tidal", about = "Tidal state replication")]
pub struct CliArgs {
    /// Run mode.
    #[command(subcommand)]
    pub command: Command,

    /// Host address to bind or dial.
    #[arg(long, global = true)]
    pub address: Option<String>,

    /// Host port.
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Maximum number of peers the host admits.
    #[arg(long, global = true)]
    pub max_peers: Option<u32>,

    /// Display name announced to the roster.
    #[arg(long, global = true)]
    pub name: Option<String>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Stop after this many ticks (runs forever when omitted).
    #[arg(long, global = true)]
    pub ticks: Option<u64>,
}

/// Run mode selected on the command line.
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Listen for peers and act as the authority.
    Host,
    /// Connect to a running host.
    Join,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref addr) = args.address {
            self.network.host_address = addr.clone();
        }
        if let Some(port) = args.port {
            self.network.port = port;
        }
        if let Some(max) = args.max_peers {
            self.network.max_peers = max;
        }
        if let Some(ref name) = args.name {
            self.network.client_name = name.clone();
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
