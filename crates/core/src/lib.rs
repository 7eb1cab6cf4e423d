//! Shared foundations for the attest provenance workspace.
//!
//! This crate holds the pieces every other attest crate leans on: the
//! workspace error type, TOML configuration, structured logging setup and the
//! injectable clock used to timestamp records.

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, KeyStoreConfig, LoggingConfig, TimestampConfig, VerificationConfig};
pub use error::{Error, Result};
