use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

use crate::key_pair_factory::KeyType;
use crate::settings::DEFAULT_EXPIRY_DAYS;
use crate::signature_algorithm::SignatureAlgorithm;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub defaults: CaDefaults,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ManagerConfig {
    /// CA directories opened at startup.
    #[serde(default)]
    pub ca_directories: Vec<PathBuf>,
}

/// Policy applied to CAs created from the console.
#[derive(Debug, Deserialize, Clone)]
pub struct CaDefaults {
    #[serde(default = "default_expiry_days")]
    pub expiry_days: i64,
    #[serde(default = "default_incremental_serial")]
    pub incremental_serial: bool,
    /// Derived from the CA key when absent.
    #[serde(default)]
    pub signature_algorithm: Option<SignatureAlgorithm>,
    #[serde(default = "default_key_type")]
    pub key_type: KeyType,
    #[serde(default = "default_ca_validity_days")]
    pub ca_validity_days: i64,
}

impl Default for CaDefaults {
    fn default() -> Self {
        Self {
            expiry_days: default_expiry_days(),
            incremental_serial: default_incremental_serial(),
            signature_algorithm: None,
            key_type: default_key_type(),
            ca_validity_days: default_ca_validity_days(),
        }
    }
}

fn default_expiry_days() -> i64 {
    DEFAULT_EXPIRY_DAYS
}

fn default_incremental_serial() -> bool {
    true
}

fn default_key_type() -> KeyType {
    KeyType::EcP384
}

fn default_ca_validity_days() -> i64 {
    3650 // 10 years
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let config_str =
            fs::read_to_string(path).context(format!("Failed to read config file: {}", path))?;

        let config: AppConfig =
            toml::from_str(&config_str).context("Failed to parse config file")?;

        if config.defaults.expiry_days <= 0 {
            anyhow::bail!(
                "defaults.expiry_days must be positive, got {}",
                config.defaults.expiry_days
            );
        }

        Ok(config)
    }

    /// Load configuration with default path (config.toml)
    pub fn load() -> Result<Self> {
        Self::from_file("config.toml")
    }
}
