//! Record persistence seam.
//!
//! The provenance core only appends, loads by document and deletes by
//! document; it never queries or joins. [`MemoryRecordStore`] is the in-process
//! backend used by tests and the operator binary.

use attest_crypto::{ChainedAuditEntry, Digest, SignatureRecord, TimestampRecord};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::StoreError;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Append-only storage of provenance records keyed by document id.
pub trait RecordStore: Send + Sync {
    fn append_signature(&self, record: &SignatureRecord) -> StoreResult<()>;

    /// Signatures for a document in append order.
    fn signatures(&self, document_id: &str) -> StoreResult<Vec<SignatureRecord>>;

    fn append_timestamp(&self, record: &TimestampRecord) -> StoreResult<()>;

    fn timestamps(&self, document_id: &str) -> StoreResult<Vec<TimestampRecord>>;

    fn append_audit(&self, entry: &ChainedAuditEntry) -> StoreResult<()>;

    fn audit_entries(&self, scope: &str) -> StoreResult<Vec<ChainedAuditEntry>>;

    /// Remove a document's signature and timestamp records. Audit entries are
    /// retained. Returns the number of records removed.
    fn delete_document(&self, document_id: &str) -> StoreResult<usize>;
}

#[derive(Debug, Default)]
struct DocumentRecords {
    signatures: Vec<SignatureRecord>,
    timestamps: Vec<TimestampRecord>,
}

/// In-memory [`RecordStore`]. Rejects appends that do not extend the stored
/// head, and can be switched off to simulate an outage.
#[derive(Debug)]
pub struct MemoryRecordStore {
    documents: RwLock<HashMap<String, DocumentRecords>>,
    audit: RwLock<HashMap<String, Vec<ChainedAuditEntry>>>,
    available: AtomicBool,
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            audit: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn document_count(&self) -> usize {
        self.documents.read().len()
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("record store is offline".to_string()))
        }
    }
}

fn check_head(kind: &str, head: Option<Digest>, link: Option<Digest>) -> StoreResult<()> {
    if head != link {
        return Err(StoreError::Rejected(format!(
            "{} does not extend the stored head",
            kind
        )));
    }
    Ok(())
}

impl RecordStore for MemoryRecordStore {
    fn append_signature(&self, record: &SignatureRecord) -> StoreResult<()> {
        self.check_available()?;
        let mut documents = self.documents.write();
        let records = documents.entry(record.document_id.clone()).or_default();
        check_head(
            "signature",
            records.signatures.last().map(|r| r.chain_hash),
            record.previous_signature_hash,
        )?;
        records.signatures.push(record.clone());
        Ok(())
    }

    fn signatures(&self, document_id: &str) -> StoreResult<Vec<SignatureRecord>> {
        self.check_available()?;
        Ok(self
            .documents
            .read()
            .get(document_id)
            .map(|records| records.signatures.clone())
            .unwrap_or_default())
    }

    fn append_timestamp(&self, record: &TimestampRecord) -> StoreResult<()> {
        self.check_available()?;
        let mut documents = self.documents.write();
        let records = documents.entry(record.document_id.clone()).or_default();
        check_head(
            "timestamp",
            records.timestamps.last().map(|r| r.chain_hash),
            record.previous_timestamp_hash,
        )?;
        records.timestamps.push(record.clone());
        Ok(())
    }

    fn timestamps(&self, document_id: &str) -> StoreResult<Vec<TimestampRecord>> {
        self.check_available()?;
        Ok(self
            .documents
            .read()
            .get(document_id)
            .map(|records| records.timestamps.clone())
            .unwrap_or_default())
    }

    fn append_audit(&self, entry: &ChainedAuditEntry) -> StoreResult<()> {
        self.check_available()?;
        let mut audit = self.audit.write();
        let entries = audit.entry(entry.entry.scope.clone()).or_default();
        check_head(
            "audit entry",
            entries.last().map(|e| e.chain_hash),
            entry.previous_hash,
        )?;
        entries.push(entry.clone());
        Ok(())
    }

    fn audit_entries(&self, scope: &str) -> StoreResult<Vec<ChainedAuditEntry>> {
        self.check_available()?;
        Ok(self.audit.read().get(scope).cloned().unwrap_or_default())
    }

    fn delete_document(&self, document_id: &str) -> StoreResult<usize> {
        self.check_available()?;
        Ok(self
            .documents
            .write()
            .remove(document_id)
            .map(|records| records.signatures.len() + records.timestamps.len())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attest_core::ManualClock;
    use attest_crypto::{KeyStore, SignatureEngine, StandardProvider, TimestampEngine};
    use std::sync::Arc;

    fn signature_engine() -> SignatureEngine {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let keys = Arc::new(KeyStore::ephemeral(StandardProvider::shared(), clock.clone()).unwrap());
        SignatureEngine::new(keys, clock)
    }

    #[test]
    fn test_append_and_load() {
        let store = MemoryRecordStore::new();
        let engine = signature_engine();
        let records = engine.chain_sign("doc-1", b"content", &["alice", "bob"]).unwrap();

        for record in &records {
            store.append_signature(record).unwrap();
        }
        assert_eq!(store.signatures("doc-1").unwrap(), records);
        assert!(store.signatures("doc-2").unwrap().is_empty());
    }

    #[test]
    fn test_rejects_non_extending_append() {
        let store = MemoryRecordStore::new();
        let engine = signature_engine();
        let records = engine.chain_sign("doc-1", b"content", &["alice", "bob"]).unwrap();

        assert!(matches!(
            store.append_signature(&records[1]),
            Err(StoreError::Rejected(_))
        ));
        store.append_signature(&records[0]).unwrap();
        assert!(matches!(
            store.append_signature(&records[0]),
            Err(StoreError::Rejected(_))
        ));
    }

    #[test]
    fn test_delete_document() {
        let store = MemoryRecordStore::new();
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let stamps = TimestampEngine::new(StandardProvider::shared(), clock, 300_000);
        let mut chain = stamps.new_chain("doc-1");
        let record = stamps.stamp(&mut chain, b"v1", "alice", "create").unwrap();
        store.append_timestamp(&record).unwrap();
        store
            .append_signature(&signature_engine().sign("doc-1", b"v1", "alice").unwrap())
            .unwrap();

        assert_eq!(store.delete_document("doc-1").unwrap(), 2);
        assert!(store.timestamps("doc-1").unwrap().is_empty());
        assert_eq!(store.delete_document("doc-1").unwrap(), 0);
        assert_eq!(store.document_count(), 0);
    }

    #[test]
    fn test_offline_store() {
        let store = MemoryRecordStore::new();
        store.set_available(false);
        assert!(matches!(
            store.signatures("doc-1"),
            Err(StoreError::Unavailable(_))
        ));
    }
}
