//! Core error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for attest
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnv(String),
}
