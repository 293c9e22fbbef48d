//! Configuration system for Tidal.
//!
//! Settings persist to disk as RON files and can be overridden from the
//! command line via clap. Unknown or missing keys fall back to defaults so
//! older and newer config files keep loading.

mod cli;
mod config;
mod error;

pub use cli::{CliArgs, Command};
pub use config::{Config, DebugConfig, NetworkConfig, SyncConfig};
pub use error::ConfigError;
