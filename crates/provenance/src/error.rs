//! Error types for the provenance service.

use attest_crypto::ProvenanceError;
use thiserror::Error;

/// Errors surfaced by [`crate::ProvenanceService`].
#[derive(Debug, Error)]
pub enum ServiceError {
    /// A cryptographic creation operation failed
    #[error(transparent)]
    Provenance(#[from] ProvenanceError),

    /// The record store could not be read or written
    #[error("Record store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration or environment problem at startup
    #[error("Configuration error: {0}")]
    Config(#[from] attest_core::Error),
}

/// Errors from a [`crate::RecordStore`] backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record store unavailable: {0}")]
    Unavailable(String),

    #[error("Record rejected by store: {0}")]
    Rejected(String),
}

pub type Result<T> = std::result::Result<T, ServiceError>;
