//! Configuration structs with sensible defaults and RON persistence.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const CONFIG_FILE: &str = "config.ron";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Transport and handshake settings.
    pub network: NetworkConfig,
    /// Replication and interpolation settings.
    pub sync: SyncConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the host binds to, or the client dials.
    pub host_address: String,
    /// Host port.
    pub port: u16,
    /// Maximum number of connected peers (host only).
    pub max_peers: u32,
    /// First client id handed out by the host. Id 1 is the host itself.
    pub client_id_seed: u16,
    /// Display name announced during the handshake.
    pub client_name: String,
    /// Largest frame the TCP transport accepts, in bytes.
    pub max_frame_bytes: u32,
}

/// Replication configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// Distance below which an interpolated field counts as converged.
    pub lerp_threshold: f64,
    /// Rate used for fields registered without an explicit rate.
    pub default_lerp_rate: f64,
    /// Interpolated fields and their per-tick rate.
    pub lerp_fields: BTreeMap<String, f64>,
    /// Whether the host process holds authority over every record.
    pub host_is_authority: bool,
    /// Simulation ticks per second.
    pub tick_rate: u32,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Write a JSON log file next to the config.
    pub persist_logs: bool,
}

// --- Default implementations ---

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host_address: "127.0.0.1".to_string(),
            port: 7777,
            max_peers: 16,
            client_id_seed: 10,
            client_name: "player".to_string(),
            max_frame_bytes: 4096,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        let mut lerp_fields = BTreeMap::new();
        lerp_fields.insert("x".to_string(), 0.5);
        lerp_fields.insert("y".to_string(), 0.5);
        Self {
            lerp_threshold: 0.1,
            default_lerp_rate: 0.25,
            lerp_fields,
            host_is_authority: true,
            tick_rate: 30,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            persist_logs: false,
        }
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Platform default config directory (`<config_dir>/tidal`).
    pub fn default_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join("tidal"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join(CONFIG_FILE);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    /// `host:port` string for the configured host.
    pub fn host_endpoint(&self) -> String {
        format!("{}:{}", self.network.host_address, self.network.port)
    }
}
