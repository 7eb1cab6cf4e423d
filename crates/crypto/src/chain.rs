//! Append-only hash chains.
//!
//! Signature, timestamp and audit chains share one structure: each record
//! carries its own digest, a pointer to the predecessor's `chain_hash`, and
//! `chain_hash = H(record_digest || previous)`. [`ChainLog`] enforces the link
//! invariant when a record is appended; [`inspect_chain`] re-derives it for a
//! record sequence loaded from elsewhere.
//!
//! # Verification
//!
//! A single linear walk. The first record that fails any check is reported
//! with its index, so tampering with record `k` is always reported at an index
//! of at least `k`. Verification is O(n) in the number of records.

use std::fmt;
use std::sync::Arc;
use tracing::warn;

use crate::error::{ChainFault, ProvenanceError, Result};
use crate::preimage::Preimage;
use crate::provider::{CryptoProvider, Digest};

const CHAIN_DOMAIN: &str = "attest:chain:v1";

/// A record that can be linked into a [`ChainLog`].
pub trait ChainRecord: Clone {
    fn document_id(&self) -> &str;

    /// The digest stored on the record.
    fn record_digest(&self) -> Digest;

    /// The digest recomputed from the record's fields.
    fn recompute_digest(&self, provider: &dyn CryptoProvider) -> Digest;

    fn chain_hash(&self) -> Digest;

    fn previous_hash(&self) -> Option<Digest>;

    /// Ordering time in Unix milliseconds. Must not decrease along a chain.
    fn recorded_at(&self) -> u64;
}

/// `H(record_digest || previous_chain_hash)`, with an empty field for the genesis record.
pub fn compute_chain_hash(
    provider: &dyn CryptoProvider,
    record_digest: &Digest,
    previous: Option<&Digest>,
) -> Digest {
    Preimage::new(CHAIN_DOMAIN)
        .field(record_digest)
        .optional(previous)
        .digest(provider)
}

/// Outcome of walking a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainReport {
    Intact { length: usize },
    Broken { index: usize, fault: ChainFault },
}

impl ChainReport {
    pub fn is_intact(&self) -> bool {
        matches!(self, ChainReport::Intact { .. })
    }

    pub fn broken_at(&self) -> Option<usize> {
        match self {
            ChainReport::Intact { .. } => None,
            ChainReport::Broken { index, .. } => Some(*index),
        }
    }

    pub fn into_result(self) -> Result<()> {
        match self {
            ChainReport::Intact { .. } => Ok(()),
            ChainReport::Broken { index, fault } => Err(ProvenanceError::ChainBroken { index, fault }),
        }
    }
}

impl fmt::Display for ChainReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainReport::Intact { length } => write!(f, "intact ({} records)", length),
            ChainReport::Broken { index, fault } => write!(f, "broken at index {}: {}", index, fault),
        }
    }
}

/// Check one record against its expected predecessor.
fn check_record<R: ChainRecord>(
    provider: &dyn CryptoProvider,
    document_id: &str,
    record: &R,
    previous: Option<&R>,
) -> std::result::Result<(), ChainFault> {
    if record.document_id() != document_id {
        return Err(ChainFault::DocumentMismatch);
    }
    if record.recompute_digest(provider) != record.record_digest() {
        return Err(ChainFault::RecordHashMismatch);
    }

    match (previous, record.previous_hash()) {
        (None, Some(_)) => return Err(ChainFault::InvalidGenesis),
        (Some(_), None) => return Err(ChainFault::BrokenLink),
        (Some(prev), Some(link)) if prev.chain_hash() != link => return Err(ChainFault::BrokenLink),
        _ => {}
    }

    let expected = compute_chain_hash(provider, &record.record_digest(), record.previous_hash().as_ref());
    if expected != record.chain_hash() {
        return Err(ChainFault::ChainHashMismatch);
    }

    if let Some(prev) = previous {
        if record.recorded_at() < prev.recorded_at() {
            return Err(ChainFault::TimeRegression);
        }
    }

    Ok(())
}

/// Walk `records` in order. An empty sequence is intact.
pub fn inspect_chain<R: ChainRecord>(provider: &dyn CryptoProvider, records: &[R]) -> ChainReport {
    let Some(first) = records.first() else {
        return ChainReport::Intact { length: 0 };
    };
    let document_id = first.document_id();

    let mut previous: Option<&R> = None;
    for (index, record) in records.iter().enumerate() {
        if let Err(fault) = check_record(provider, document_id, record, previous) {
            warn!(document_id, index, %fault, "Chain verification failed");
            return ChainReport::Broken { index, fault };
        }
        previous = Some(record);
    }

    ChainReport::Intact {
        length: records.len(),
    }
}

/// An append-only chain for one document.
#[derive(Clone)]
pub struct ChainLog<R: ChainRecord> {
    document_id: String,
    provider: Arc<dyn CryptoProvider>,
    records: Vec<R>,
}

impl<R: ChainRecord + fmt::Debug> fmt::Debug for ChainLog<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainLog")
            .field("document_id", &self.document_id)
            .field("records", &self.records)
            .finish()
    }
}

impl<R: ChainRecord> ChainLog<R> {
    pub fn new(provider: Arc<dyn CryptoProvider>, document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            provider,
            records: Vec::new(),
        }
    }

    /// Rebuild a chain from stored records, validating every link.
    ///
    /// # Errors
    /// `ChainBroken` naming the first offending record.
    pub fn from_records(
        provider: Arc<dyn CryptoProvider>,
        document_id: impl Into<String>,
        records: Vec<R>,
    ) -> Result<Self> {
        let mut log = Self::new(provider, document_id);
        log.records.reserve(records.len());
        for record in records {
            log.append(record)?;
        }
        Ok(log)
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn head(&self) -> Option<&R> {
        self.records.last()
    }

    /// `chain_hash` of the last record, the link for the next append.
    pub fn head_hash(&self) -> Option<Digest> {
        self.records.last().map(|record| record.chain_hash())
    }

    /// Append a record that links to the current head.
    ///
    /// # Errors
    /// `ChainBroken { index: self.len(), .. }` if the record does not extend
    /// the chain. The log is unchanged on error.
    pub fn append(&mut self, record: R) -> Result<&R> {
        let index = self.records.len();
        check_record(
            self.provider.as_ref(),
            &self.document_id,
            &record,
            self.records.last(),
        )
        .map_err(|fault| ProvenanceError::ChainBroken { index, fault })?;

        self.records.push(record);
        Ok(&self.records[index])
    }

    pub fn records(&self) -> &[R] {
        &self.records
    }

    pub fn get(&self, index: usize) -> Option<&R> {
        self.records.get(index)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn verify(&self) -> ChainReport {
        inspect_chain(self.provider.as_ref(), &self.records)
    }

    pub fn into_records(self) -> Vec<R> {
        self.records
    }
}
