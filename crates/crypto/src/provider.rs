//! Cryptographic provider interface.
//!
//! All primitives used by the engines go through a single [`CryptoProvider`]
//! that is constructed once at startup and shared as `Arc<dyn CryptoProvider>`.
//! [`StandardProvider`] is the production implementation:
//!
//! - Digest: BLAKE3-256
//! - Key derivation: BLAKE3 `derive_key`
//! - AEAD: ChaCha20-Poly1305 (96-bit nonce, 128-bit tag)
//! - Signatures: Ed25519 (roughly 128-bit security, stronger than RSA-2048)

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A BLAKE3-256 digest.
pub type Digest = [u8; 32];

pub const DIGEST_LEN: usize = 32;
pub const SYMMETRIC_KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Algorithm identifiers recorded alongside every artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlgorithmSuite {
    pub digest: &'static str,
    pub aead: &'static str,
    pub signature: &'static str,
}

pub const STANDARD_SUITE: AlgorithmSuite = AlgorithmSuite {
    digest: "blake3-256",
    aead: "chacha20-poly1305",
    signature: "ed25519",
};

/// Errors from the underlying primitives. Engines translate these into
/// [`crate::ProvenanceError`] variants that match the failing operation.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Randomness source failed: {0}")]
    Randomness(String),

    #[error("AEAD operation failed")]
    Aead,

    #[error("Invalid key material: {0}")]
    InvalidKey(String),
}

/// A 256-bit symmetric secret. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; SYMMETRIC_KEY_LEN]);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; SYMMETRIC_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProviderError> {
        let array = <[u8; SYMMETRIC_KEY_LEN]>::try_from(bytes).map_err(|_| {
            ProviderError::InvalidKey(format!(
                "symmetric key must be {} bytes, got {}",
                SYMMETRIC_KEY_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; SYMMETRIC_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey([REDACTED])")
    }
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct SecretBytes(Vec<u8>);

/// A signing keypair with its stable identifier.
#[derive(Clone)]
pub struct SigningKeyPair {
    key_id: String,
    public_key: Vec<u8>,
    secret: SecretBytes,
}

impl SigningKeyPair {
    /// Identifier used as `public_key_ref` in signature records.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub(crate) fn secret_bytes(&self) -> &[u8] {
        &self.secret.0
    }
}

impl fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeyPair")
            .field("key_id", &self.key_id)
            .field("public_key", &hex::encode(&self.public_key))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Output of an AEAD seal with the tag detached.
#[derive(Debug, Clone)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

/// The cryptographic capabilities the engines depend on.
pub trait CryptoProvider: Send + Sync + fmt::Debug {
    fn suite(&self) -> AlgorithmSuite;

    fn digest(&self, data: &[u8]) -> Digest;

    /// One-way derivation of a 256-bit key from `material` under `context`.
    fn derive_key(&self, context: &str, material: &[u8]) -> SymmetricKey;

    fn fill_random(&self, dest: &mut [u8]) -> Result<(), ProviderError>;

    fn seal(
        &self,
        key: &SymmetricKey,
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Sealed, ProviderError>;

    fn open(
        &self,
        key: &SymmetricKey,
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        ciphertext: &[u8],
        tag: &[u8; TAG_LEN],
    ) -> Result<Vec<u8>, ProviderError>;

    fn generate_signing_key(&self) -> Result<SigningKeyPair, ProviderError>;

    /// Rebuild a keypair from its persisted secret.
    fn signing_key_from_secret(&self, secret: &[u8]) -> Result<SigningKeyPair, ProviderError>;

    fn sign(&self, key: &SigningKeyPair, message: &[u8]) -> Result<Vec<u8>, ProviderError>;

    /// Returns false for malformed keys or signatures as well as bad ones.
    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool;

    fn generate_symmetric_key(&self) -> Result<SymmetricKey, ProviderError> {
        let mut bytes = [0u8; SYMMETRIC_KEY_LEN];
        self.fill_random(&mut bytes)?;
        let key = SymmetricKey::from_bytes(bytes);
        bytes.zeroize();
        Ok(key)
    }

    fn generate_nonce(&self) -> Result<[u8; NONCE_LEN], ProviderError> {
        let mut nonce = [0u8; NONCE_LEN];
        self.fill_random(&mut nonce)?;
        Ok(nonce)
    }

    /// Key identifier: hex of the first 16 bytes of the public key digest.
    fn key_id(&self, public_key: &[u8]) -> String {
        hex::encode(&self.digest(public_key)[..16])
    }
}

/// BLAKE3 + ChaCha20-Poly1305 + Ed25519.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardProvider;

impl StandardProvider {
    pub fn new() -> Self {
        Self
    }

    pub fn shared() -> Arc<dyn CryptoProvider> {
        Arc::new(Self)
    }

    fn keypair_from_signing_key(&self, signing_key: &SigningKey) -> SigningKeyPair {
        let public_key = signing_key.verifying_key().to_bytes().to_vec();
        SigningKeyPair {
            key_id: self.key_id(&public_key),
            public_key,
            secret: SecretBytes(signing_key.to_bytes().to_vec()),
        }
    }
}

impl CryptoProvider for StandardProvider {
    fn suite(&self) -> AlgorithmSuite {
        STANDARD_SUITE
    }

    fn digest(&self, data: &[u8]) -> Digest {
        *blake3::hash(data).as_bytes()
    }

    fn derive_key(&self, context: &str, material: &[u8]) -> SymmetricKey {
        SymmetricKey::from_bytes(blake3::derive_key(context, material))
    }

    fn fill_random(&self, dest: &mut [u8]) -> Result<(), ProviderError> {
        getrandom::getrandom(dest).map_err(|e| ProviderError::Randomness(e.to_string()))
    }

    fn seal(
        &self,
        key: &SymmetricKey,
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Sealed, ProviderError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        let mut ciphertext = cipher
            .encrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| ProviderError::Aead)?;

        // Output is ciphertext || tag.
        let split = ciphertext.len().checked_sub(TAG_LEN).ok_or(ProviderError::Aead)?;
        let tag = <[u8; TAG_LEN]>::try_from(&ciphertext[split..]).map_err(|_| ProviderError::Aead)?;
        ciphertext.truncate(split);

        Ok(Sealed { ciphertext, tag })
    }

    fn open(
        &self,
        key: &SymmetricKey,
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        ciphertext: &[u8],
        tag: &[u8; TAG_LEN],
    ) -> Result<Vec<u8>, ProviderError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        let mut combined = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        combined.extend_from_slice(ciphertext);
        combined.extend_from_slice(tag);

        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: &combined,
                    aad,
                },
            )
            .map_err(|_| ProviderError::Aead)
    }

    fn generate_signing_key(&self) -> Result<SigningKeyPair, ProviderError> {
        let mut seed = [0u8; 32];
        self.fill_random(&mut seed)?;
        let signing_key = SigningKey::from_bytes(&seed);
        seed.zeroize();
        Ok(self.keypair_from_signing_key(&signing_key))
    }

    fn signing_key_from_secret(&self, secret: &[u8]) -> Result<SigningKeyPair, ProviderError> {
        let mut seed = <[u8; 32]>::try_from(secret).map_err(|_| {
            ProviderError::InvalidKey(format!(
                "ed25519 secret must be 32 bytes, got {}",
                secret.len()
            ))
        })?;
        let signing_key = SigningKey::from_bytes(&seed);
        seed.zeroize();
        Ok(self.keypair_from_signing_key(&signing_key))
    }

    fn sign(&self, key: &SigningKeyPair, message: &[u8]) -> Result<Vec<u8>, ProviderError> {
        let mut seed = <[u8; 32]>::try_from(key.secret_bytes())
            .map_err(|_| ProviderError::InvalidKey("ed25519 secret must be 32 bytes".to_string()))?;
        let signing_key = SigningKey::from_bytes(&seed);
        seed.zeroize();
        Ok(signing_key.sign(message).to_bytes().to_vec())
    }

    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
        let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
            return false;
        };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        verifying_key.verify_strict(message, &signature).is_ok()
    }
}
