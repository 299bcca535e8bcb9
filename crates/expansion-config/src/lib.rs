//! Configuration for Expansion War network play.
//!
//! Settings persist to disk as a RON file, can be overridden from the command
//! line via clap, and are validated before any socket is opened. Unknown and
//! missing fields are tolerated so old and new config files keep loading.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{CONFIG_FILE, Config, DebugConfig, NetworkConfig, PeerRole, default_config_dir};
pub use error::ConfigError;
