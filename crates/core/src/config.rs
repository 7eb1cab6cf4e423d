//! Configuration management for attest.
//!
//! Configuration is read from a TOML file. Secrets are never stored in the
//! file itself: the key store section only names the environment variable
//! that carries the keyring wrapping secret.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub key_store: KeyStoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub timestamp: TimestampConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeyStoreConfig {
    /// Location of the sealed keyring file
    #[serde(default = "default_keyring_path")]
    pub path: PathBuf,
    /// Name of the environment variable holding the wrapping secret
    #[serde(default = "default_wrapping_secret_env")]
    pub wrapping_secret_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerificationConfig {
    #[serde(default = "default_true")]
    pub require_signatures: bool,
    #[serde(default = "default_true")]
    pub require_timestamps: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimestampConfig {
    /// Tolerated clock skew for timestamps ahead of the local clock
    #[serde(default = "default_max_future_skew_ms")]
    pub max_future_skew_ms: u64,
}

fn default_keyring_path() -> PathBuf {
    PathBuf::from("data/keyring.sealed")
}

fn default_wrapping_secret_env() -> String {
    "ATTEST_KEYRING_SECRET".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_future_skew_ms() -> u64 {
    300_000
}

impl Default for KeyStoreConfig {
    fn default() -> Self {
        Self {
            path: default_keyring_path(),
            wrapping_secret_env: default_wrapping_secret_env(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            require_signatures: true,
            require_timestamps: true,
        }
    }
}

impl Default for TimestampConfig {
    fn default() -> Self {
        Self {
            max_future_skew_ms: default_max_future_skew_ms(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}

impl Config {
    pub fn default_config() -> Self {
        Self {
            key_store: KeyStoreConfig::default(),
            logging: LoggingConfig::default(),
            verification: VerificationConfig::default(),
            timestamp: TimestampConfig::default(),
        }
    }

    /// Load and validate a TOML configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.key_store.path.as_os_str().is_empty() {
            return Err(Error::Config("key_store.path must not be empty".to_string()));
        }
        if self.key_store.wrapping_secret_env.trim().is_empty() {
            return Err(Error::Config(
                "key_store.wrapping_secret_env must name an environment variable".to_string(),
            ));
        }
        if self.logging.level.trim().is_empty() {
            return Err(Error::Config("logging.level must not be empty".to_string()));
        }
        Ok(())
    }

    /// Read the keyring wrapping secret from the configured environment variable.
    pub fn wrapping_secret(&self) -> Result<Vec<u8>> {
        let name = &self.key_store.wrapping_secret_env;
        match std::env::var(name) {
            Ok(value) if !value.is_empty() => Ok(value.into_bytes()),
            _ => Err(Error::MissingEnv(name.clone())),
        }
    }
}
