//! End-to-end document verification.
//!
//! The orchestrator recomputes every hash and signature for a document and
//! reports four independent sub-verdicts:
//!
//! - `signature_valid`: every signature record is authentic over the content
//! - `timestamp_valid`: every timestamp is internally consistent and the
//!   latest one stamps the current content
//! - `hash_valid`: the content hash matches every signature and the latest
//!   timestamp
//! - `chain_valid`: both chains are intact, belong to the same document, and
//!   the records the policy requires are present
//!
//! Verification never fails with an error; problems are reported as
//! [`Finding`]s on the verdict.

use attest_core::VerificationConfig;
use attest_crypto::{
    ChainFault, ChainReport, CryptoProvider, EncryptedPayload, EncryptionEngine, SignatureEngine,
    SignatureRecord, TimestampEngine, TimestampRecord,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Which records a document must carry to verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationPolicy {
    pub require_signatures: bool,
    pub require_timestamps: bool,
}

impl Default for VerificationPolicy {
    fn default() -> Self {
        Self {
            require_signatures: true,
            require_timestamps: true,
        }
    }
}

impl From<&VerificationConfig> for VerificationPolicy {
    fn from(config: &VerificationConfig) -> Self {
        Self {
            require_signatures: config.require_signatures,
            require_timestamps: config.require_timestamps,
        }
    }
}

/// One reason a verdict is not fully valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Finding {
    MissingSignatures,
    MissingTimestamps,
    SignatureRejected { index: usize, signer_id: String },
    TimestampRejected { index: usize },
    SignatureContentMismatch { index: usize },
    TimestampContentMismatch { index: usize },
    SignatureChainBroken { index: usize, fault: ChainFault },
    TimestampChainBroken { index: usize, fault: ChainFault },
    DocumentMismatch { expected: String, found: String },
    DecryptionFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationVerdict {
    pub signature_valid: bool,
    pub timestamp_valid: bool,
    pub hash_valid: bool,
    pub chain_valid: bool,
    pub overall_valid: bool,
    pub findings: Vec<Finding>,
}

impl VerificationVerdict {
    /// Every sub-verdict false.
    pub fn rejected(findings: Vec<Finding>) -> Self {
        Self {
            signature_valid: false,
            timestamp_valid: false,
            hash_valid: false,
            chain_valid: false,
            overall_valid: false,
            findings,
        }
    }
}

pub struct VerificationOrchestrator {
    provider: Arc<dyn CryptoProvider>,
    signatures: Arc<SignatureEngine>,
    timestamps: Arc<TimestampEngine>,
    encryption: Arc<EncryptionEngine>,
}

impl VerificationOrchestrator {
    pub fn new(
        provider: Arc<dyn CryptoProvider>,
        signatures: Arc<SignatureEngine>,
        timestamps: Arc<TimestampEngine>,
        encryption: Arc<EncryptionEngine>,
    ) -> Self {
        Self {
            provider,
            signatures,
            timestamps,
            encryption,
        }
    }

    /// Verify `content` against its signature and timestamp chains.
    ///
    /// # Arguments
    /// * `content` - The document content as it exists now
    /// * `signatures` - The document's signature chain in append order
    /// * `timestamps` - The document's timestamp chain in append order
    /// * `policy` - Which record kinds must be present
    pub fn verify_document(
        &self,
        content: &[u8],
        signatures: &[SignatureRecord],
        timestamps: &[TimestampRecord],
        policy: VerificationPolicy,
    ) -> VerificationVerdict {
        let mut findings = Vec::new();
        let content_hash = self.provider.digest(content);

        let mut signature_valid = true;
        let mut hash_valid = true;
        for (index, record) in signatures.iter().enumerate() {
            if record.content_hash != content_hash {
                hash_valid = false;
                findings.push(Finding::SignatureContentMismatch { index });
            }
            if !self.signatures.verify(content, record) {
                signature_valid = false;
                findings.push(Finding::SignatureRejected {
                    index,
                    signer_id: record.signer_id.clone(),
                });
            }
        }

        let mut timestamp_valid = true;
        for (index, record) in timestamps.iter().enumerate() {
            if !self.timestamps.verify_record(record) {
                timestamp_valid = false;
                findings.push(Finding::TimestampRejected { index });
            }
        }
        if let Some(head) = timestamps.last() {
            let index = timestamps.len() - 1;
            if head.content_hash != content_hash {
                hash_valid = false;
                timestamp_valid = false;
                findings.push(Finding::TimestampContentMismatch { index });
            } else if !self.timestamps.verify(head, content, &head.actor_id) {
                timestamp_valid = false;
            }
        }

        let mut chain_valid = true;
        if let ChainReport::Broken { index, fault } = self.signatures.inspect_chain(signatures) {
            chain_valid = false;
            findings.push(Finding::SignatureChainBroken { index, fault });
        }
        if let ChainReport::Broken { index, fault } = self.timestamps.inspect_chain(timestamps) {
            chain_valid = false;
            findings.push(Finding::TimestampChainBroken { index, fault });
        }
        if policy.require_signatures && signatures.is_empty() {
            chain_valid = false;
            findings.push(Finding::MissingSignatures);
        }
        if policy.require_timestamps && timestamps.is_empty() {
            chain_valid = false;
            findings.push(Finding::MissingTimestamps);
        }
        if let (Some(signature), Some(timestamp)) = (signatures.first(), timestamps.first()) {
            if signature.document_id != timestamp.document_id {
                chain_valid = false;
                findings.push(Finding::DocumentMismatch {
                    expected: signature.document_id.clone(),
                    found: timestamp.document_id.clone(),
                });
            }
        }

        let overall_valid = signature_valid && timestamp_valid && hash_valid && chain_valid;
        let document_id = signatures
            .first()
            .map(|r| r.document_id.as_str())
            .or_else(|| timestamps.first().map(|r| r.document_id.as_str()))
            .unwrap_or("");

        if overall_valid {
            info!(
                document_id,
                signatures = signatures.len(),
                timestamps = timestamps.len(),
                "Document verified"
            );
        } else {
            warn!(
                document_id,
                signature_valid,
                timestamp_valid,
                hash_valid,
                chain_valid,
                findings = findings.len(),
                "Document failed verification"
            );
        }

        VerificationVerdict {
            signature_valid,
            timestamp_valid,
            hash_valid,
            chain_valid,
            overall_valid,
            findings,
        }
    }

    /// Decrypt `payload` and verify the plaintext. A payload that cannot be
    /// decrypted yields an all-false verdict.
    pub fn verify_encrypted_document(
        &self,
        payload: &EncryptedPayload,
        associated_context: &[u8],
        signatures: &[SignatureRecord],
        timestamps: &[TimestampRecord],
        policy: VerificationPolicy,
    ) -> VerificationVerdict {
        match self.encryption.decrypt(payload, associated_context) {
            Ok(content) => self.verify_document(&content, signatures, timestamps, policy),
            Err(e) => {
                warn!(error = %e, "Encrypted document could not be decrypted for verification");
                VerificationVerdict::rejected(vec![Finding::DecryptionFailed])
            }
        }
    }
}
