//! Authenticated encryption of document content and metadata.
//!
//! Payloads are sealed with the current master key. The algorithm id, key
//! version, creation time and caller-supplied associated context are all bound
//! into the AEAD associated data, so a change to any of them fails the tag
//! check on decrypt.

use attest_core::Clock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{require_id, ProvenanceError, Result};
use crate::keystore::KeyStore;
use crate::preimage::Preimage;
use crate::provider::{CryptoProvider, SymmetricKey, NONCE_LEN, TAG_LEN};

const PAYLOAD_AAD_DOMAIN: &str = "attest:payload:v1";
const CONTENT_KEY_CONTEXT: &str = "attest 2024-06-01 document content key v1";
const CONTENT_KEY_DOMAIN: &str = "attest:content-key:v1";

/// An encrypted blob with everything needed to decrypt it except the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    #[serde(with = "hex::serde")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub initialization_vector: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub authentication_tag: Vec<u8>,
    pub algorithm_id: String,
    pub key_version: u32,
    pub created_at: u64,
}

/// A per-document, per-actor key derived from the master key.
pub struct ContentKey {
    key: SymmetricKey,
    key_version: u32,
}

impl ContentKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.key.as_bytes()
    }

    /// Master key version the key was derived from.
    pub fn key_version(&self) -> u32 {
        self.key_version
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentKey")
            .field("key", &"[REDACTED]")
            .field("key_version", &self.key_version)
            .finish()
    }
}

pub struct EncryptionEngine {
    keys: Arc<KeyStore>,
    provider: Arc<dyn CryptoProvider>,
    clock: Arc<dyn Clock>,
}

impl EncryptionEngine {
    pub fn new(keys: Arc<KeyStore>, clock: Arc<dyn Clock>) -> Self {
        let provider = Arc::clone(keys.provider());
        Self {
            keys,
            provider,
            clock,
        }
    }

    /// Encrypt `plaintext` under the current master key.
    ///
    /// # Arguments
    /// * `plaintext` - Content to protect; may be empty
    /// * `associated_context` - Authenticated but unencrypted context, e.g. an
    ///   actor id. The same bytes must be supplied to decrypt.
    ///
    /// # Errors
    /// `EncryptionFailure` if no key is available or the cipher fails.
    pub fn encrypt(&self, plaintext: &[u8], associated_context: &[u8]) -> Result<EncryptedPayload> {
        let material = self
            .keys
            .current()
            .map_err(|e| ProvenanceError::EncryptionFailure(e.to_string()))?;

        let algorithm_id = self.provider.suite().aead.to_string();
        let key_version = material.version();
        let created_at = self.clock.now_millis();

        let nonce = self
            .provider
            .generate_nonce()
            .map_err(|e| ProvenanceError::EncryptionFailure(e.to_string()))?;
        let aad = payload_aad(&algorithm_id, key_version, created_at, associated_context);

        let sealed = self
            .provider
            .seal(material.symmetric_key(), &nonce, &aad, plaintext)
            .map_err(|e| ProvenanceError::EncryptionFailure(e.to_string()))?;

        debug!(
            key_version,
            bytes = plaintext.len(),
            "Encrypted payload"
        );

        Ok(EncryptedPayload {
            ciphertext: sealed.ciphertext,
            initialization_vector: nonce.to_vec(),
            authentication_tag: sealed.tag.to_vec(),
            algorithm_id,
            key_version,
            created_at,
        })
    }

    /// Decrypt a payload produced by [`EncryptionEngine::encrypt`] under any
    /// key version the key store still holds.
    ///
    /// # Errors
    /// `DecryptionFailure` on algorithm mismatch, unknown key version,
    /// malformed nonce or tag, context mismatch, or any tampering.
    pub fn decrypt(&self, payload: &EncryptedPayload, associated_context: &[u8]) -> Result<Vec<u8>> {
        let expected_algorithm = self.provider.suite().aead;
        if payload.algorithm_id != expected_algorithm {
            return Err(ProvenanceError::DecryptionFailure(format!(
                "unsupported algorithm '{}'",
                payload.algorithm_id
            )));
        }

        let nonce = <[u8; NONCE_LEN]>::try_from(payload.initialization_vector.as_slice()).map_err(|_| {
            ProvenanceError::DecryptionFailure(format!(
                "initialization vector must be {} bytes",
                NONCE_LEN
            ))
        })?;
        let tag = <[u8; TAG_LEN]>::try_from(payload.authentication_tag.as_slice()).map_err(|_| {
            ProvenanceError::DecryptionFailure(format!(
                "authentication tag must be {} bytes",
                TAG_LEN
            ))
        })?;

        let key = self.keys.symmetric_key(payload.key_version).ok_or_else(|| {
            ProvenanceError::DecryptionFailure(format!(
                "no key for version {}",
                payload.key_version
            ))
        })?;

        let aad = payload_aad(
            &payload.algorithm_id,
            payload.key_version,
            payload.created_at,
            associated_context,
        );

        self.provider
            .open(&key, &nonce, &aad, &payload.ciphertext, &tag)
            .map_err(|_| {
                warn!(
                    key_version = payload.key_version,
                    "Payload failed authentication"
                );
                ProvenanceError::DecryptionFailure("authentication failed".to_string())
            })
    }

    /// Re-seal a payload under the current key version. Payloads already on
    /// the current version are re-sealed with a fresh nonce.
    pub fn reencrypt(&self, payload: &EncryptedPayload, associated_context: &[u8]) -> Result<EncryptedPayload> {
        let plaintext = zeroize::Zeroizing::new(self.decrypt(payload, associated_context)?);
        let migrated = self.encrypt(&plaintext, associated_context)?;
        debug!(
            from_version = payload.key_version,
            to_version = migrated.key_version,
            "Re-encrypted payload"
        );
        Ok(migrated)
    }

    /// Derive a one-way key for a document and actor from the current master key.
    pub fn derive_content_key(&self, document_id: &str, actor_id: &str) -> Result<ContentKey> {
        require_id("document_id", document_id)?;
        require_id("actor_id", actor_id)?;

        let material = self
            .keys
            .current()
            .map_err(|e| ProvenanceError::EncryptionFailure(e.to_string()))?;

        let input = Preimage::new(CONTENT_KEY_DOMAIN)
            .field(material.symmetric_key().as_bytes())
            .text(document_id)
            .text(actor_id);
        let key = self.provider.derive_key(CONTENT_KEY_CONTEXT, input.as_bytes());

        Ok(ContentKey {
            key,
            key_version: material.version(),
        })
    }
}

fn payload_aad(algorithm_id: &str, key_version: u32, created_at: u64, context: &[u8]) -> Vec<u8> {
    Preimage::new(PAYLOAD_AAD_DOMAIN)
        .text(algorithm_id)
        .u64(u64::from(key_version))
        .u64(created_at)
        .field(context)
        .into_bytes()
}
