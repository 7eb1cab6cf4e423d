//! Error types for the provenance primitives.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The reason a hash chain was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChainFault {
    /// The record's own digest does not recompute from its fields
    RecordHashMismatch,
    /// `chain_hash` does not recompute from the record digest and its link
    ChainHashMismatch,
    /// The previous-hash pointer does not name the immediate predecessor
    BrokenLink,
    /// The first record claims a predecessor
    InvalidGenesis,
    /// The record belongs to a different document
    DocumentMismatch,
    /// The record is older than its predecessor
    TimeRegression,
}

impl fmt::Display for ChainFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ChainFault::RecordHashMismatch => "record hash mismatch",
            ChainFault::ChainHashMismatch => "chain hash mismatch",
            ChainFault::BrokenLink => "broken link",
            ChainFault::InvalidGenesis => "invalid genesis record",
            ChainFault::DocumentMismatch => "document mismatch",
            ChainFault::TimeRegression => "time regression",
        };
        f.write_str(text)
    }
}

/// Errors raised by creation operations. Verification operations report
/// failure through their return value instead.
#[derive(Debug, Error)]
pub enum ProvenanceError {
    #[error("Encryption failed: {0}")]
    EncryptionFailure(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailure(String),

    #[error("Key store unavailable: {0}")]
    KeyStoreUnavailable(String),

    #[error("Signing failed: {0}")]
    SignatureInvalid(String),

    #[error("Chain broken at index {index}: {fault}")]
    ChainBroken { index: usize, fault: ChainFault },

    #[error("Audit entry tampered: {0}")]
    AuditTamperDetected(String),

    #[error("Invalid field '{field}': {reason}")]
    InvalidInput { field: String, reason: String },
}

impl ProvenanceError {
    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ProvenanceError::InvalidInput {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProvenanceError>;

/// Rejects empty or whitespace-only identifiers.
pub(crate) fn require_id(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ProvenanceError::invalid(field, "must not be empty"));
    }
    Ok(())
}
