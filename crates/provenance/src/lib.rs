//! Document provenance service for attest.
//!
//! Composes the primitives from `attest-crypto` into one chain of custody:
//! who created a document, who signed it and when, and whether it has been
//! altered since.
//!
//! - [`ProvenanceService`]: the facade callers use; serializes chain appends
//!   per document and persists records through a [`RecordStore`]
//! - [`VerificationOrchestrator`]: recomputes and cross-checks every record
//!   into a [`VerificationVerdict`]

pub mod error;
pub mod service;
pub mod store;
pub mod verification;

pub use error::{Result, ServiceError, StoreError};
pub use service::{KeyInfo, ProvenanceService};
pub use store::{MemoryRecordStore, RecordStore};
pub use verification::{Finding, VerificationOrchestrator, VerificationPolicy, VerificationVerdict};
