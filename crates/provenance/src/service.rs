//! Provenance service facade.
//!
//! [`ProvenanceService`] wires the key store, the engines, the verification
//! orchestrator and a [`RecordStore`] together. It is the only place chain
//! appends happen, and it serializes appends per document: two writers on the
//! same document take turns while different documents proceed in parallel.

use attest_core::{Clock, Config, SystemClock};
use attest_crypto::{
    AuditEntry, AuditHasher, AuditTrail, ChainLog, ChainReport, ChainedAuditEntry, ContentKey,
    CryptoProvider, EncryptedPayload, EncryptionEngine, FileKeyStorage, KeyMaterial, KeyStore,
    SignatureEngine, SignatureRecord, StandardProvider, TimestampEngine, TimestampRecord,
    WrappingKey,
};
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::store::RecordStore;
use crate::verification::{VerificationOrchestrator, VerificationPolicy, VerificationVerdict};

/// Non-secret description of the active keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyInfo {
    pub version: u32,
    pub key_id: String,
    pub created_at: u64,
    pub known_key_ids: Vec<String>,
}

/// One mutex per document id. Entries live only while someone holds or waits
/// on them.
#[derive(Default)]
struct DocumentLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DocumentLocks {
    fn lock(&self, document_id: &str) -> DocumentGuard<'_> {
        let lock = Arc::clone(
            self.locks
                .lock()
                .entry(document_id.to_string())
                .or_default(),
        );
        DocumentGuard {
            locks: self,
            document_id: document_id.to_string(),
            guard: Some(lock.lock_arc()),
        }
    }

    /// Drop the entry when no other guard holds a reference. Clones are only
    /// taken under the map lock, so the count cannot grow while we look.
    fn release(&self, document_id: &str) {
        let mut locks = self.locks.lock();
        if locks
            .get(document_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(document_id);
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks.lock().len()
    }
}

struct DocumentGuard<'a> {
    locks: &'a DocumentLocks,
    document_id: String,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl Drop for DocumentGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks.release(&self.document_id);
    }
}

pub struct ProvenanceService {
    provider: Arc<dyn CryptoProvider>,
    keys: Arc<KeyStore>,
    encryption: Arc<EncryptionEngine>,
    signatures: Arc<SignatureEngine>,
    timestamps: Arc<TimestampEngine>,
    audit: AuditHasher,
    orchestrator: VerificationOrchestrator,
    store: Arc<dyn RecordStore>,
    policy: VerificationPolicy,
    locks: DocumentLocks,
}

impl ProvenanceService {
    /// Build the service around an initialized key store.
    pub fn new(
        keys: Arc<KeyStore>,
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        config: &Config,
    ) -> Self {
        let provider = Arc::clone(keys.provider());
        let encryption = Arc::new(EncryptionEngine::new(Arc::clone(&keys), Arc::clone(&clock)));
        let signatures = Arc::new(SignatureEngine::new(Arc::clone(&keys), Arc::clone(&clock)));
        let timestamps = Arc::new(TimestampEngine::new(
            Arc::clone(&provider),
            Arc::clone(&clock),
            config.timestamp.max_future_skew_ms,
        ));
        let audit = AuditHasher::new(Arc::clone(&provider), clock);
        let orchestrator = VerificationOrchestrator::new(
            Arc::clone(&provider),
            Arc::clone(&signatures),
            Arc::clone(&timestamps),
            Arc::clone(&encryption),
        );

        Self {
            provider,
            keys,
            encryption,
            signatures,
            timestamps,
            audit,
            orchestrator,
            store,
            policy: VerificationPolicy::from(&config.verification),
            locks: DocumentLocks::default(),
        }
    }

    /// Open the file-backed key store named in `config` and build the
    /// service with the standard provider and the system clock.
    ///
    /// # Errors
    /// `Config` if the wrapping secret is missing from the environment,
    /// `Provenance(KeyStoreUnavailable)` if the keyring cannot be loaded.
    pub fn open(config: &Config, store: Arc<dyn RecordStore>) -> Result<Self> {
        config.validate()?;
        let secret = zeroize::Zeroizing::new(config.wrapping_secret()?);

        let provider = StandardProvider::shared();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let wrapping_key = WrappingKey::derive(provider.as_ref(), &secret)?;
        let keys = KeyStore::initialize(
            Arc::new(FileKeyStorage::new(&config.key_store.path)),
            provider,
            wrapping_key,
            Arc::clone(&clock),
        )?;

        info!(path = %config.key_store.path.display(), "Provenance service opened");
        Ok(Self::new(Arc::new(keys), store, clock, config))
    }

    pub fn policy(&self) -> VerificationPolicy {
        self.policy
    }

    pub fn key_store(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    // Encryption

    pub fn encrypt(&self, plaintext: &[u8], associated_context: &[u8]) -> Result<EncryptedPayload> {
        Ok(self.encryption.encrypt(plaintext, associated_context)?)
    }

    pub fn decrypt(&self, payload: &EncryptedPayload, associated_context: &[u8]) -> Result<Vec<u8>> {
        Ok(self.encryption.decrypt(payload, associated_context)?)
    }

    pub fn reencrypt(&self, payload: &EncryptedPayload, associated_context: &[u8]) -> Result<EncryptedPayload> {
        Ok(self.encryption.reencrypt(payload, associated_context)?)
    }

    pub fn derive_content_key(&self, document_id: &str, actor_id: &str) -> Result<ContentKey> {
        Ok(self.encryption.derive_content_key(document_id, actor_id)?)
    }

    // Signatures

    /// Append `signer_id`'s signature over `content` to the document's chain.
    pub fn sign(&self, document_id: &str, content: &[u8], signer_id: &str) -> Result<SignatureRecord> {
        let _guard = self.locks.lock(document_id);

        let mut chain = self.load_signature_chain(document_id)?;
        let record = self.signatures.countersign(&mut chain, content, signer_id)?;
        self.store.append_signature(&record)?;
        Ok(record)
    }

    /// Append one signature per signer, in order.
    pub fn chain_sign<S: AsRef<str>>(
        &self,
        document_id: &str,
        content: &[u8],
        signers: &[S],
    ) -> Result<Vec<SignatureRecord>> {
        if signers.is_empty() {
            return Err(attest_crypto::ProvenanceError::InvalidInput {
                field: "signers".to_string(),
                reason: "at least one signer is required".to_string(),
            }
            .into());
        }

        let _guard = self.locks.lock(document_id);

        // The whole batch is signed before anything reaches the store.
        let mut chain = self.load_signature_chain(document_id)?;
        let mut appended = Vec::with_capacity(signers.len());
        for signer in signers {
            appended.push(self.signatures.countersign(&mut chain, content, signer.as_ref())?);
        }
        for record in &appended {
            self.store.append_signature(record)?;
        }
        Ok(appended)
    }

    pub fn signature_records(&self, document_id: &str) -> Result<Vec<SignatureRecord>> {
        Ok(self.store.signatures(document_id)?)
    }

    pub fn verify_signature(&self, content: &[u8], record: &SignatureRecord) -> bool {
        self.signatures.verify(content, record)
    }

    pub fn verify_signature_chain(&self, records: &[SignatureRecord]) -> bool {
        self.signatures.verify_chain(records)
    }

    // Timestamps

    /// Append a timestamp for a state-changing action.
    pub fn stamp(&self, document_id: &str, content: &[u8], actor_id: &str, action: &str) -> Result<TimestampRecord> {
        let _guard = self.locks.lock(document_id);

        let mut chain = self.load_timestamp_chain(document_id)?;
        let record = self.timestamps.stamp(&mut chain, content, actor_id, action)?;
        self.store.append_timestamp(&record)?;
        Ok(record)
    }

    /// Append a notarization binding `document` alongside the content.
    pub fn notarize(
        &self,
        document_id: &str,
        content: &[u8],
        actor_id: &str,
        document: &[u8],
    ) -> Result<TimestampRecord> {
        let _guard = self.locks.lock(document_id);

        let mut chain = self.load_timestamp_chain(document_id)?;
        let record = self.timestamps.notarize(&mut chain, content, actor_id, document)?;
        self.store.append_timestamp(&record)?;
        Ok(record)
    }

    pub fn timestamp_records(&self, document_id: &str) -> Result<Vec<TimestampRecord>> {
        Ok(self.store.timestamps(document_id)?)
    }

    pub fn verify_timestamp(&self, record: &TimestampRecord, content: &[u8], actor_id: &str) -> bool {
        self.timestamps.verify(record, content, actor_id)
    }

    pub fn verify_notarization(
        &self,
        record: &TimestampRecord,
        content: &[u8],
        actor_id: &str,
        document: &[u8],
    ) -> bool {
        self.timestamps.verify_notarization(record, content, actor_id, document)
    }

    pub fn verify_timestamp_chain(&self, records: &[TimestampRecord]) -> bool {
        self.timestamps.verify_chain(records)
    }

    // Audit

    /// An unsealed entry stamped with the current time.
    pub fn audit_entry(&self, actor_id: &str, action: &str, scope: &str) -> AuditEntry {
        self.audit.entry(actor_id, action, scope)
    }

    /// Seal an entry without recording it.
    pub fn seal_audit(&self, entry: AuditEntry) -> Result<AuditEntry> {
        Ok(self.audit.seal_entry(entry)?)
    }

    /// Seal an entry and append it to its scope's audit trail.
    pub fn record_audit(&self, entry: AuditEntry) -> Result<ChainedAuditEntry> {
        let _guard = self.locks.lock(&entry.scope);
        self.append_audit(entry)
    }

    pub fn verify_audit(&self, entry: &AuditEntry) -> bool {
        self.audit.verify(entry)
    }

    pub fn audit_trail(&self, scope: &str) -> Result<Vec<ChainedAuditEntry>> {
        Ok(self.store.audit_entries(scope)?)
    }

    /// Walk a scope's stored audit trail.
    pub fn verify_audit_trail(&self, scope: &str) -> Result<ChainReport> {
        let entries = self.store.audit_entries(scope)?;
        Ok(self.audit.inspect_trail(&entries))
    }

    // Verification

    /// Verify `content` against the supplied records under the configured policy.
    pub fn verify_document(
        &self,
        content: &[u8],
        signatures: &[SignatureRecord],
        timestamps: &[TimestampRecord],
    ) -> VerificationVerdict {
        self.orchestrator
            .verify_document(content, signatures, timestamps, self.policy)
    }

    /// Verify `content` against the records stored for `document_id`. Only a
    /// store failure is an error.
    pub fn verify_stored_document(&self, document_id: &str, content: &[u8]) -> Result<VerificationVerdict> {
        let signatures = self.store.signatures(document_id)?;
        let timestamps = self.store.timestamps(document_id)?;
        Ok(self.verify_document(content, &signatures, &timestamps))
    }

    pub fn verify_encrypted_document(
        &self,
        payload: &EncryptedPayload,
        associated_context: &[u8],
        signatures: &[SignatureRecord],
        timestamps: &[TimestampRecord],
    ) -> VerificationVerdict {
        self.orchestrator.verify_encrypted_document(
            payload,
            associated_context,
            signatures,
            timestamps,
            self.policy,
        )
    }

    // Key lifecycle

    pub fn key_info(&self) -> Result<KeyInfo> {
        let material = self.keys.current()?;
        Ok(self.describe(&material))
    }

    pub fn rotate_signing_keys(&self) -> Result<KeyInfo> {
        let material = self.keys.rotate_signing_keys()?;
        Ok(self.describe(&material))
    }

    pub fn rotate_master_key(&self) -> Result<KeyInfo> {
        let material = self.keys.rotate_master_key()?;
        Ok(self.describe(&material))
    }

    /// The sealed keyring blob for the backup subsystem.
    pub fn backup_snapshot(&self) -> Result<Vec<u8>> {
        Ok(self.keys.backup_snapshot()?)
    }

    pub fn teardown(&self) {
        self.keys.teardown();
    }

    /// Remove a document's signature and timestamp records and record the
    /// deletion in its audit trail. Returns the number of records removed.
    pub fn delete_document(&self, document_id: &str, actor_id: &str) -> Result<usize> {
        let _guard = self.locks.lock(document_id);

        // The audit entry is built against a verified trail before anything
        // is removed, so a broken trail or an unreadable store deletes nothing.
        let removed =
            self.store.signatures(document_id)?.len() + self.store.timestamps(document_id)?.len();
        let entry = self
            .audit
            .entry(actor_id, "document.delete", document_id)
            .with_context("removed_records", serde_json::json!(removed));
        let chained = self.chain_audit(entry)?;

        let deleted = self.store.delete_document(document_id)?;
        if deleted != removed {
            warn!(document_id, expected = removed, deleted, "Store removed an unexpected record count");
        }
        self.store.append_audit(&chained)?;

        info!(document_id, actor_id, removed = deleted, "Deleted document records");
        Ok(deleted)
    }

    fn describe(&self, material: &KeyMaterial) -> KeyInfo {
        KeyInfo {
            version: material.version(),
            key_id: material.key_id().to_string(),
            created_at: material.created_at(),
            known_key_ids: self.keys.key_ids(),
        }
    }

    fn load_signature_chain(&self, document_id: &str) -> Result<ChainLog<SignatureRecord>> {
        let records = self.store.signatures(document_id)?;
        Ok(ChainLog::from_records(Arc::clone(&self.provider), document_id, records)?)
    }

    fn load_timestamp_chain(&self, document_id: &str) -> Result<ChainLog<TimestampRecord>> {
        let records = self.store.timestamps(document_id)?;
        Ok(ChainLog::from_records(Arc::clone(&self.provider), document_id, records)?)
    }

    /// Seal `entry` onto its scope's verified trail without persisting it.
    /// Caller holds the scope's lock.
    fn chain_audit(&self, entry: AuditEntry) -> Result<ChainedAuditEntry> {
        let scope = entry.scope.clone();
        let existing = self.store.audit_entries(&scope)?;
        let mut trail = AuditTrail::from_entries(&self.audit, &scope, existing)?;
        Ok(trail.append(entry)?.clone())
    }

    /// Caller holds the scope's lock.
    fn append_audit(&self, entry: AuditEntry) -> Result<ChainedAuditEntry> {
        let chained = self.chain_audit(entry)?;
        self.store.append_audit(&chained)?;
        debug!(scope = %chained.entry.scope, action = %chained.entry.action, "Recorded audit entry");
        Ok(chained)
    }
}
