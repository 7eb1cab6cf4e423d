//! Document signing.
//!
//! Each signature is an Ed25519 signature over a domain-separated preimage of
//! the document id, signer id, content hash and signing time. Records form an
//! append-only chain per document so multi-party signing order is
//! tamper-evident.
//!
//! # Security Model
//!
//! - Private keys never leave the [`KeyStore`]
//! - Verification resolves `public_key_ref` through the public-key directory,
//!   so records signed before a rotation still verify
//! - Verification never errors: any mismatch or unknown key is `false`

use attest_core::Clock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::chain::{compute_chain_hash, inspect_chain, ChainLog, ChainRecord, ChainReport};
use crate::error::{require_id, ProvenanceError, Result};
use crate::keystore::{KeyStore, PublicKeyDirectory};
use crate::preimage::Preimage;
use crate::provider::{CryptoProvider, Digest};

const SIGNING_DOMAIN: &str = "attest:sign:v1";
const SIGNATURE_HASH_DOMAIN: &str = "attest:signature:v1";

/// One signer's signature over one version of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRecord {
    pub document_id: String,
    pub signer_id: String,
    pub content_hash: Digest,
    #[serde(with = "hex::serde")]
    pub signature_bytes: Vec<u8>,
    pub signature_hash: Digest,
    /// `key_id` of the signing key in the public-key directory
    pub public_key_ref: String,
    pub algorithm_id: String,
    pub signed_at: u64,
    pub chain_hash: Digest,
    /// `chain_hash` of the preceding record, `None` for the first signature
    pub previous_signature_hash: Option<Digest>,
}

impl ChainRecord for SignatureRecord {
    fn document_id(&self) -> &str {
        &self.document_id
    }

    fn record_digest(&self) -> Digest {
        self.signature_hash
    }

    fn recompute_digest(&self, provider: &dyn CryptoProvider) -> Digest {
        signature_hash(
            provider,
            &self.document_id,
            &self.signer_id,
            &self.signature_bytes,
            self.signed_at,
        )
    }

    fn chain_hash(&self) -> Digest {
        self.chain_hash
    }

    fn previous_hash(&self) -> Option<Digest> {
        self.previous_signature_hash
    }

    fn recorded_at(&self) -> u64 {
        self.signed_at
    }
}

pub type SignatureChain = ChainLog<SignatureRecord>;

/// `H(document_id || signer_id || signature_bytes || signed_at)`
pub fn signature_hash(
    provider: &dyn CryptoProvider,
    document_id: &str,
    signer_id: &str,
    signature_bytes: &[u8],
    signed_at: u64,
) -> Digest {
    Preimage::new(SIGNATURE_HASH_DOMAIN)
        .text(document_id)
        .text(signer_id)
        .field(signature_bytes)
        .u64(signed_at)
        .digest(provider)
}

fn signing_preimage(
    algorithm_id: &str,
    document_id: &str,
    signer_id: &str,
    content_hash: &Digest,
    signed_at: u64,
) -> Preimage {
    Preimage::new(SIGNING_DOMAIN)
        .text(algorithm_id)
        .text(document_id)
        .text(signer_id)
        .field(content_hash)
        .u64(signed_at)
}

pub struct SignatureEngine {
    keys: Arc<KeyStore>,
    provider: Arc<dyn CryptoProvider>,
    directory: PublicKeyDirectory,
    clock: Arc<dyn Clock>,
}

impl SignatureEngine {
    pub fn new(keys: Arc<KeyStore>, clock: Arc<dyn Clock>) -> Self {
        let provider = Arc::clone(keys.provider());
        let directory = keys.public_keys();
        Self {
            keys,
            provider,
            directory,
            clock,
        }
    }

    /// An empty signature chain for `document_id`.
    pub fn new_chain(&self, document_id: &str) -> SignatureChain {
        ChainLog::new(Arc::clone(&self.provider), document_id)
    }

    /// Sign `content` as the first signature of a document.
    ///
    /// # Errors
    /// `SignatureInvalid` if no signing key is available, `InvalidInput` for
    /// empty identifiers.
    pub fn sign(&self, document_id: &str, content: &[u8], signer_id: &str) -> Result<SignatureRecord> {
        let mut chain = self.new_chain(document_id);
        self.countersign(&mut chain, content, signer_id)
    }

    /// Append one signature to an existing chain.
    pub fn countersign(
        &self,
        chain: &mut SignatureChain,
        content: &[u8],
        signer_id: &str,
    ) -> Result<SignatureRecord> {
        let record = self.create_record(chain.document_id(), content, signer_id, chain.head())?;
        let appended = chain.append(record)?.clone();

        debug!(
            document_id = %appended.document_id,
            signer_id = %appended.signer_id,
            key_id = %appended.public_key_ref,
            index = chain.len() - 1,
            "Signed document"
        );
        Ok(appended)
    }

    /// Sign `content` once per signer, in order, as one linked chain.
    pub fn chain_sign<S: AsRef<str>>(
        &self,
        document_id: &str,
        content: &[u8],
        signers: &[S],
    ) -> Result<Vec<SignatureRecord>> {
        if signers.is_empty() {
            return Err(ProvenanceError::InvalidInput {
                field: "signers".to_string(),
                reason: "at least one signer is required".to_string(),
            });
        }

        let mut chain = self.new_chain(document_id);
        for signer in signers {
            self.countersign(&mut chain, content, signer.as_ref())?;
        }
        Ok(chain.into_records())
    }

    /// True iff `record` is an authentic signature over exactly `content`.
    pub fn verify(&self, content: &[u8], record: &SignatureRecord) -> bool {
        if self.provider.digest(content) != record.content_hash {
            warn!(
                document_id = %record.document_id,
                signer_id = %record.signer_id,
                "Content does not match signed hash"
            );
            return false;
        }
        self.verify_record(record)
    }

    /// Check everything about a record that does not need the content:
    /// algorithm, signature hash, chain hash and the signature itself.
    pub fn verify_record(&self, record: &SignatureRecord) -> bool {
        if record.algorithm_id != self.provider.suite().signature {
            return false;
        }
        if record.recompute_digest(self.provider.as_ref()) != record.signature_hash {
            warn!(document_id = %record.document_id, "Signature hash mismatch");
            return false;
        }
        let expected_chain = compute_chain_hash(
            self.provider.as_ref(),
            &record.signature_hash,
            record.previous_signature_hash.as_ref(),
        );
        if expected_chain != record.chain_hash {
            warn!(document_id = %record.document_id, "Signature chain hash mismatch");
            return false;
        }

        let Some(entry) = self.directory.get(&record.public_key_ref) else {
            warn!(key_id = %record.public_key_ref, "Unknown signing key");
            return false;
        };
        if entry.algorithm_id != record.algorithm_id {
            return false;
        }

        let message = signing_preimage(
            &record.algorithm_id,
            &record.document_id,
            &record.signer_id,
            &record.content_hash,
            record.signed_at,
        );
        let valid = self
            .provider
            .verify(&entry.public_key, message.as_bytes(), &record.signature_bytes);
        if !valid {
            warn!(
                document_id = %record.document_id,
                signer_id = %record.signer_id,
                key_id = %record.public_key_ref,
                "Signature rejected"
            );
        }
        valid
    }

    /// True iff the chain links are intact and every signature is authentic.
    /// An empty sequence is vacuously valid.
    pub fn verify_chain(&self, records: &[SignatureRecord]) -> bool {
        self.inspect_chain(records).is_intact() && records.iter().all(|r| self.verify_record(r))
    }

    /// Walk the chain links, reporting the first broken record.
    pub fn inspect_chain(&self, records: &[SignatureRecord]) -> ChainReport {
        inspect_chain(self.provider.as_ref(), records)
    }

    fn create_record(
        &self,
        document_id: &str,
        content: &[u8],
        signer_id: &str,
        previous: Option<&SignatureRecord>,
    ) -> Result<SignatureRecord> {
        require_id("document_id", document_id)?;
        require_id("signer_id", signer_id)?;

        let material = self
            .keys
            .current()
            .map_err(|e| ProvenanceError::SignatureInvalid(e.to_string()))?;
        let key_pair = material.signing_key_pair();
        let algorithm_id = self.provider.suite().signature.to_string();

        let content_hash = self.provider.digest(content);
        // Never earlier than the record being extended.
        let signed_at = previous
            .map(|p| p.signed_at)
            .unwrap_or(0)
            .max(self.clock.now_millis());

        let message = signing_preimage(&algorithm_id, document_id, signer_id, &content_hash, signed_at);
        let signature_bytes = self
            .provider
            .sign(key_pair, message.as_bytes())
            .map_err(|e| ProvenanceError::SignatureInvalid(e.to_string()))?;

        let signature_hash = signature_hash(
            self.provider.as_ref(),
            document_id,
            signer_id,
            &signature_bytes,
            signed_at,
        );
        let previous_signature_hash = previous.map(|p| p.chain_hash);
        let chain_hash = compute_chain_hash(
            self.provider.as_ref(),
            &signature_hash,
            previous_signature_hash.as_ref(),
        );

        Ok(SignatureRecord {
            document_id: document_id.to_string(),
            signer_id: signer_id.to_string(),
            content_hash,
            signature_bytes,
            signature_hash,
            public_key_ref: key_pair.key_id().to_string(),
            algorithm_id,
            signed_at,
            chain_hash,
            previous_signature_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChainFault;
    use crate::provider::StandardProvider;
    use attest_core::ManualClock;
    use proptest::prelude::*;

    struct Fixture {
        engine: SignatureEngine,
        keys: Arc<KeyStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let keys = Arc::new(KeyStore::ephemeral(StandardProvider::shared(), clock.clone()).unwrap());
        let engine = SignatureEngine::new(keys.clone(), clock.clone());
        Fixture { engine, keys, clock }
    }

    #[test]
    fn test_sign_and_verify() {
        let f = fixture();
        let record = f.engine.sign("doc-1", b"Hello", "alice").unwrap();

        assert_eq!(record.document_id, "doc-1");
        assert_eq!(record.signer_id, "alice");
        assert_eq!(record.signature_bytes.len(), 64);
        assert_eq!(record.algorithm_id, "ed25519");
        assert_eq!(record.public_key_ref, f.keys.current().unwrap().key_id());
        assert!(record.previous_signature_hash.is_none());

        assert!(f.engine.verify(b"Hello", &record));
        assert!(!f.engine.verify(b"Hello!", &record));
    }

    #[test]
    fn test_field_tamper_rejected() {
        let f = fixture();
        let record = f.engine.sign("doc-1", b"content", "alice").unwrap();

        let mut signer = record.clone();
        signer.signer_id = "mallory".to_string();
        assert!(!f.engine.verify(b"content", &signer));

        let mut time = record.clone();
        time.signed_at += 1;
        assert!(!f.engine.verify(b"content", &time));

        let mut bytes = record.clone();
        bytes.signature_bytes[0] ^= 0xFF;
        assert!(!f.engine.verify(b"content", &bytes));

        let mut unknown_key = record.clone();
        unknown_key.public_key_ref = "00".repeat(16);
        assert!(!f.engine.verify(b"content", &unknown_key));

        let mut algorithm = record;
        algorithm.algorithm_id = "rsa-pss".to_string();
        assert!(!f.engine.verify(b"content", &algorithm));
    }

    #[test]
    fn test_rehashed_forgery_rejected() {
        // An attacker who recomputes every hash still cannot move a signature
        // to another signer.
        let f = fixture();
        let provider = StandardProvider::new();
        let mut forged = f.engine.sign("doc-1", b"content", "alice").unwrap();

        forged.signer_id = "mallory".to_string();
        forged.signature_hash = forged.recompute_digest(&provider);
        forged.chain_hash = compute_chain_hash(&provider, &forged.signature_hash, None);
        assert!(!f.engine.verify(b"content", &forged));
    }

    #[test]
    fn test_chain_sign_links_records() {
        let f = fixture();
        let records = f
            .engine
            .chain_sign("doc-1", b"contract", &["alice", "bob", "carol"])
            .unwrap();

        assert_eq!(records.len(), 3);
        assert!(records[0].previous_signature_hash.is_none());
        assert_eq!(records[1].previous_signature_hash, Some(records[0].chain_hash));
        assert_eq!(records[2].previous_signature_hash, Some(records[1].chain_hash));
        assert!(f.engine.verify_chain(&records));
        for record in &records {
            assert!(f.engine.verify(b"contract", record));
        }
    }

    #[test]
    fn test_chain_sign_requires_signers() {
        let f = fixture();
        let signers: [&str; 0] = [];
        assert!(matches!(
            f.engine.chain_sign("doc-1", b"x", &signers),
            Err(ProvenanceError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_signed_at_never_regresses() {
        let f = fixture();
        let mut chain = f.engine.new_chain("doc-1");
        let first = f.engine.countersign(&mut chain, b"x", "alice").unwrap();

        f.clock.set(1_000);
        let second = f.engine.countersign(&mut chain, b"x", "bob").unwrap();
        assert_eq!(second.signed_at, first.signed_at);
        assert!(f.engine.verify_chain(chain.records()));
    }

    #[test]
    fn test_reordered_chain_rejected() {
        let f = fixture();
        let mut records = f
            .engine
            .chain_sign("doc-1", b"contract", &["alice", "bob", "carol"])
            .unwrap();
        records.swap(0, 1);

        assert!(!f.engine.verify_chain(&records));
        assert_eq!(
            f.engine.inspect_chain(&records),
            ChainReport::Broken {
                index: 0,
                fault: ChainFault::InvalidGenesis
            }
        );
    }

    #[test]
    fn test_rotation_between_signers() {
        let f = fixture();
        let mut chain = f.engine.new_chain("doc-1");
        let a = f.engine.countersign(&mut chain, b"agreement", "signer-a").unwrap();

        f.keys.rotate_signing_keys().unwrap();
        f.clock.advance(60_000);
        let b = f.engine.countersign(&mut chain, b"agreement", "signer-b").unwrap();

        assert_ne!(a.public_key_ref, b.public_key_ref);
        assert!(f.engine.verify(b"agreement", &a));
        assert!(f.engine.verify(b"agreement", &b));
        assert!(f.engine.verify_chain(chain.records()));
    }

    #[test]
    fn test_teardown_blocks_signing_not_verification() {
        let f = fixture();
        let record = f.engine.sign("doc-1", b"content", "alice").unwrap();

        f.keys.teardown();
        assert!(matches!(
            f.engine.sign("doc-1", b"content", "alice"),
            Err(ProvenanceError::SignatureInvalid(_))
        ));
        assert!(f.engine.verify(b"content", &record));
    }

    #[test]
    fn test_empty_chain_verifies() {
        let f = fixture();
        assert!(f.engine.verify_chain(&[]));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_chain_tamper_detected_at_or_after(length in 2usize..8, target in any::<prop::sample::Index>(), field in 0u8..4) {
            let f = fixture();
            let signers: Vec<String> = (0..length).map(|i| format!("signer-{}", i)).collect();
            let mut records = f.engine.chain_sign("doc-1", b"content", &signers).unwrap();

            let k = target.index(length);
            match field {
                0 => records[k].signature_bytes[0] ^= 0x01,
                1 => records[k].signer_id.push('x'),
                2 => records[k].chain_hash[0] ^= 0x01,
                _ => records[k].signed_at += 1,
            }

            prop_assert!(!f.engine.verify_chain(&records));
            let report = f.engine.inspect_chain(&records);
            let index = report.broken_at();
            prop_assert!(index.is_some());
            prop_assert!(index.unwrap_or(0) >= k);
        }
    }
}
