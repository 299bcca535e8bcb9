//! Command-line argument parsing for Expansion War.

use std::path::PathBuf;

use clap::Parser;

use crate::{Config, PeerRole};

/// Expansion War command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "expansion-war", about = "Expansion War, two-player network mode")]
pub struct CliArgs {
    /// Host a game or join one.
    #[arg(long, value_enum)]
    pub role: Option<PeerRole>,

    /// IPv4 address to listen on (host) or connect to (joiner).
    #[arg(long)]
    pub address: Option<String>,

    /// TCP port, 1024 to 65535.
    #[arg(long)]
    pub port: Option<u16>,

    /// Log level (error, warn, info, debug, trace) or a full filter string.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Skip network mode and play both sides locally.
    #[arg(long)]
    pub local: bool,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(role) = args.role {
            self.network.role = role;
        }
        if let Some(ref addr) = args.address {
            self.network.address = addr.clone();
        }
        if let Some(port) = args.port {
            self.network.port = port;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
