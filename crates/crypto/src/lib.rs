//! Document provenance primitives for attest.
//!
//! This crate provides the cryptographic core of the provenance stack:
//! authenticated encryption, signatures, hash-chained timestamps and
//! tamper-evident audit hashing, all driven by one injected
//! [`CryptoProvider`] and one [`KeyStore`].
//!
//! # Core Capabilities
//!
//! - **Key lifecycle**: sealed keyring persistence, rotation, teardown
//! - **Encryption**: ChaCha20-Poly1305 payloads bound to their metadata
//! - **Signatures**: Ed25519 signature chains for multi-party signing
//! - **Timestamps**: monotonic hash-chained stamps and notarization
//! - **Audit**: canonical-JSON entry hashes and optional chained trails
//!
//! # Algorithms
//!
//! - **Hashing**: BLAKE3 for every integrity check
//! - **Encryption**: ChaCha20-Poly1305
//! - **Signatures**: Ed25519
//!
//! # Security Principles
//!
//! - Secrets are zeroized on drop and never logged or persisted in the clear
//! - Creation operations return errors; verification returns `false`
//! - Every multi-field hash is length-framed and domain-separated

pub mod audit;
pub mod chain;
pub mod encryption;
pub mod error;
pub mod keystore;
pub mod preimage;
pub mod provider;
pub mod signing;
pub mod timestamp;

pub use audit::{canonical_json, AuditEntry, AuditHasher, AuditTrail, ChainedAuditEntry};
pub use chain::{compute_chain_hash, inspect_chain, ChainLog, ChainRecord, ChainReport};
pub use encryption::{ContentKey, EncryptedPayload, EncryptionEngine};
pub use error::{ChainFault, ProvenanceError, Result};
pub use keystore::{
    FileKeyStorage, KeyMaterial, KeyStorage, KeyStore, MemoryKeyStorage, PublicKeyDirectory,
    PublicKeyEntry, WrappingKey,
};
pub use provider::{AlgorithmSuite, CryptoProvider, Digest, StandardProvider, SymmetricKey};
pub use signing::{SignatureChain, SignatureEngine, SignatureRecord};
pub use timestamp::{TimestampChain, TimestampEngine, TimestampRecord, NOTARIZE_ACTION};
