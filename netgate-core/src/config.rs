//! Configuration management for netgate
//!
//! Config files are stored in platform-appropriate locations:
//! - Linux: ~/.config/netgate/
//! - macOS: ~/Library/Application Support/netgate/
//! - Windows: %APPDATA%\netgate\

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Config directory not found")]
    NoDirFound,
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Firewall rule controller settings
    #[serde(default)]
    pub firewall: FirewallConfig,

    /// Portal policy
    #[serde(default)]
    pub portal: PortalConfig,

    /// Where registry state is persisted
    #[serde(default)]
    pub storage: StorageConfig,
}

/// How accept rules are written to the firewall
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallConfig {
    /// iptables executable
    #[serde(default = "default_binary")]
    pub binary: String,

    /// Prefix every command with `sudo`
    #[serde(default)]
    pub use_sudo: bool,

    /// Netfilter table holding the accept rules
    #[serde(default = "default_table")]
    pub table: String,

    /// Chain holding the accept rules
    #[serde(default = "default_chain")]
    pub chain: String,

    /// Report success when deleting a rule that does not exist
    #[serde(default = "default_true")]
    pub tolerate_missing_rule: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalConfig {
    /// Initial device ceiling per user (adjustable at runtime)
    #[serde(default = "default_max_devices")]
    pub max_devices_per_user: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// JSON state file; defaults to the platform data dir
    pub state_file: Option<PathBuf>,
}

// Default value functions
fn default_binary() -> String {
    "iptables".to_string()
}
fn default_table() -> String {
    "nat".to_string()
}
fn default_chain() -> String {
    "PREROUTING".to_string()
}
fn default_max_devices() -> u32 {
    crate::DEFAULT_MAX_DEVICES_PER_USER
}
fn default_true() -> bool {
    true
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            use_sudo: false,
            table: default_table(),
            chain: default_chain(),
            tolerate_missing_rule: true,
        }
    }
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            max_devices_per_user: default_max_devices(),
        }
    }
}

impl Config {
    /// Get config directory path
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|p| p.join(crate::APP_DIR_NAME))
            .ok_or(ConfigError::NoDirFound)
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load config from default location
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load config from specific path
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save config to specific path
    pub fn save_to(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Resolved state file path
    pub fn state_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.storage.state_file {
            return Ok(path.clone());
        }
        dirs::data_dir()
            .map(|p| p.join(crate::APP_DIR_NAME).join("state.json"))
            .ok_or(ConfigError::NoDirFound)
    }
}
