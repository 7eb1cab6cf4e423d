//! Key store: lifecycle of the symmetric master key and the signing keypair.
//!
//! The keyring is persisted as one opaque blob through a [`KeyStorage`]
//! backend. The blob is a JSON envelope whose payload is the keyring sealed
//! with ChaCha20-Poly1305 under a [`WrappingKey`]; plaintext key material never
//! reaches storage.
//!
//! # Lifecycle
//!
//! - [`KeyStore::initialize`] loads the keyring, or generates and persists one
//! - [`KeyStore::rotate_signing_keys`] / [`KeyStore::rotate_master_key`] persist
//!   the new keyring first, then swap the in-memory pointer
//! - [`KeyStore::teardown`] drops the in-memory secrets
//!
//! Readers take an `Arc<KeyMaterial>` via [`KeyStore::current`] and keep using it
//! for the duration of one operation, so rotation never tears a reader.
//! Retired symmetric keys stay in an archive keyed by version so older
//! payloads remain decryptable. Public keys live in a separate
//! [`PublicKeyDirectory`] which survives teardown.

use attest_core::Clock;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{ProvenanceError, Result};
use crate::provider::{CryptoProvider, SigningKeyPair, SymmetricKey, NONCE_LEN, TAG_LEN};

const KEYRING_FORMAT: u32 = 1;
const KEYRING_AAD_DOMAIN: &str = "attest:keyring:v1";
const WRAPPING_KEY_CONTEXT: &str = "attest 2024-06-01 keyring wrapping key v1";

/// Persistence backend for the sealed keyring blob.
pub trait KeyStorage: Send + Sync {
    /// Returns `None` when no keyring has been stored yet.
    fn load(&self) -> io::Result<Option<Vec<u8>>>;

    fn store(&self, blob: &[u8]) -> io::Result<()>;
}

/// Keyring stored in a single file, replaced atomically on every write.
#[derive(Debug, Clone)]
pub struct FileKeyStorage {
    path: PathBuf,
}

impl FileKeyStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyStorage for FileKeyStorage {
    fn load(&self) -> io::Result<Option<Vec<u8>>> {
        match std::fs::read(&self.path) {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn store(&self, blob: &[u8]) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        {
            let mut file = options.open(&tmp)?;
            file.write_all(blob)?;
            // The new keyring must be durable before it replaces the old one.
            file.sync_all()?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }

        std::fs::rename(&tmp, &self.path)?;

        #[cfg(unix)]
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::File::open(parent)?.sync_all()?;
        }

        Ok(())
    }
}

/// In-process keyring storage. Can be switched off to simulate an outage.
#[derive(Debug)]
pub struct MemoryKeyStorage {
    blob: Mutex<Option<Vec<u8>>>,
    available: AtomicBool,
}

impl Default for MemoryKeyStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKeyStorage {
    pub fn new() -> Self {
        Self {
            blob: Mutex::new(None),
            available: AtomicBool::new(true),
        }
    }

    /// Storage pre-loaded with a sealed keyring, e.g. a backup snapshot.
    pub fn with_blob(blob: Vec<u8>) -> Self {
        Self {
            blob: Mutex::new(Some(blob)),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn blob(&self) -> Option<Vec<u8>> {
        self.blob.lock().clone()
    }

    fn check_available(&self) -> io::Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Other,
                "key storage is offline",
            ))
        }
    }
}

impl KeyStorage for MemoryKeyStorage {
    fn load(&self) -> io::Result<Option<Vec<u8>>> {
        self.check_available()?;
        Ok(self.blob.lock().clone())
    }

    fn store(&self, blob: &[u8]) -> io::Result<()> {
        self.check_available()?;
        *self.blob.lock() = Some(blob.to_vec());
        Ok(())
    }
}

/// Key that seals the persisted keyring.
pub struct WrappingKey(SymmetricKey);

impl WrappingKey {
    /// Derive the wrapping key from an operator-supplied secret.
    pub fn derive(provider: &dyn CryptoProvider, secret: &[u8]) -> Result<Self> {
        if secret.is_empty() {
            return Err(ProvenanceError::KeyStoreUnavailable(
                "wrapping secret is empty".to_string(),
            ));
        }
        Ok(Self(provider.derive_key(WRAPPING_KEY_CONTEXT, secret)))
    }

    /// A random wrapping key, for keyrings that never outlive the process.
    pub fn generate(provider: &dyn CryptoProvider) -> Result<Self> {
        provider
            .generate_symmetric_key()
            .map(Self)
            .map_err(|e| ProvenanceError::KeyStoreUnavailable(e.to_string()))
    }
}

impl fmt::Debug for WrappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WrappingKey([REDACTED])")
    }
}

/// The active key material. Handed out as `Arc<KeyMaterial>`.
pub struct KeyMaterial {
    version: u32,
    symmetric_key: SymmetricKey,
    signing_key_pair: SigningKeyPair,
    created_at: u64,
}

impl KeyMaterial {
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn symmetric_key(&self) -> &SymmetricKey {
        &self.symmetric_key
    }

    pub fn signing_key_pair(&self) -> &SigningKeyPair {
        &self.signing_key_pair
    }

    pub fn key_id(&self) -> &str {
        self.signing_key_pair.key_id()
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("version", &self.version)
            .field("key_id", &self.key_id())
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// A published signing public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyEntry {
    pub key_id: String,
    pub algorithm_id: String,
    #[serde(with = "hex::serde")]
    pub public_key: Vec<u8>,
    /// Key material version that introduced this key
    pub version: u32,
    pub activated_at: u64,
    pub retired_at: Option<u64>,
}

/// Public keys by `key_id`, including retired ones.
#[derive(Debug, Clone, Default)]
pub struct PublicKeyDirectory {
    entries: Arc<RwLock<HashMap<String, PublicKeyEntry>>>,
}

impl PublicKeyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key_id: &str) -> Option<PublicKeyEntry> {
        self.entries.read().get(key_id).cloned()
    }

    pub fn insert(&self, entry: PublicKeyEntry) {
        self.entries.write().insert(entry.key_id.clone(), entry);
    }

    pub fn retire(&self, key_id: &str, at: u64) {
        if let Some(entry) = self.entries.write().get_mut(key_id) {
            entry.retired_at.get_or_insert(at);
        }
    }

    pub fn key_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// All entries, oldest version first.
    pub fn entries(&self) -> Vec<PublicKeyEntry> {
        let mut entries: Vec<PublicKeyEntry> = self.entries.read().values().cloned().collect();
        entries.sort_by(|a, b| a.version.cmp(&b.version).then(a.key_id.cmp(&b.key_id)));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[derive(Serialize, Deserialize)]
struct SealedKeyring {
    format: u32,
    algorithm_id: String,
    #[serde(with = "hex::serde")]
    nonce: Vec<u8>,
    #[serde(with = "hex::serde")]
    ciphertext: Vec<u8>,
    #[serde(with = "hex::serde")]
    tag: Vec<u8>,
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct ArchivedKey {
    version: u32,
    #[serde(with = "hex::serde")]
    key: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct KeyringDocument {
    current_version: u32,
    created_at: u64,
    #[serde(with = "hex::serde")]
    signing_secret: Vec<u8>,
    symmetric_keys: Vec<ArchivedKey>,
    public_keys: Vec<PublicKeyEntry>,
}

impl Drop for KeyringDocument {
    fn drop(&mut self) {
        self.signing_secret.zeroize();
    }
}

struct Keyring {
    current: Arc<KeyMaterial>,
    /// Every symmetric key by version, current included
    archive: BTreeMap<u32, SymmetricKey>,
}

/// Owner of all key material.
pub struct KeyStore {
    provider: Arc<dyn CryptoProvider>,
    storage: Arc<dyn KeyStorage>,
    wrapping_key: WrappingKey,
    clock: Arc<dyn Clock>,
    state: RwLock<Option<Keyring>>,
    directory: PublicKeyDirectory,
    rotation: Mutex<()>,
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("KeyStore")
            .field("version", &state.as_ref().map(|k| k.current.version))
            .field("public_keys", &self.directory.len())
            .finish_non_exhaustive()
    }
}

fn unavailable(context: &str, err: impl fmt::Display) -> ProvenanceError {
    ProvenanceError::KeyStoreUnavailable(format!("{}: {}", context, err))
}

impl KeyStore {
    /// Load the keyring from `storage`, generating and persisting a fresh one
    /// when storage is empty.
    ///
    /// # Errors
    ///
    /// `KeyStoreUnavailable` when storage cannot be read or written, or the
    /// stored keyring cannot be unsealed with `wrapping_key`.
    pub fn initialize(
        storage: Arc<dyn KeyStorage>,
        provider: Arc<dyn CryptoProvider>,
        wrapping_key: WrappingKey,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let existing = storage
            .load()
            .map_err(|e| unavailable("failed to read keyring", e))?;

        let store = Self {
            provider,
            storage,
            wrapping_key,
            clock,
            state: RwLock::new(None),
            directory: PublicKeyDirectory::new(),
            rotation: Mutex::new(()),
        };

        let keyring = match existing {
            Some(blob) => {
                let keyring = store.restore(&blob)?;
                info!(
                    version = keyring.current.version,
                    key_id = %keyring.current.key_id(),
                    "Loaded keyring"
                );
                keyring
            }
            None => {
                let keyring = store.generate()?;
                info!(
                    version = keyring.current.version,
                    key_id = %keyring.current.key_id(),
                    "Generated new keyring"
                );
                keyring
            }
        };

        *store.state.write() = Some(keyring);
        Ok(store)
    }

    /// A key store backed by memory and a random wrapping key.
    pub fn ephemeral(provider: Arc<dyn CryptoProvider>, clock: Arc<dyn Clock>) -> Result<Self> {
        let wrapping_key = WrappingKey::generate(provider.as_ref())?;
        Self::initialize(
            Arc::new(MemoryKeyStorage::new()),
            provider,
            wrapping_key,
            clock,
        )
    }

    pub fn provider(&self) -> &Arc<dyn CryptoProvider> {
        &self.provider
    }

    /// The active key material.
    pub fn current(&self) -> Result<Arc<KeyMaterial>> {
        self.state
            .read()
            .as_ref()
            .map(|keyring| Arc::clone(&keyring.current))
            .ok_or_else(|| ProvenanceError::KeyStoreUnavailable("key store is torn down".to_string()))
    }

    /// Symmetric key for a given version, current or retired.
    pub fn symmetric_key(&self, version: u32) -> Option<SymmetricKey> {
        self.state
            .read()
            .as_ref()
            .and_then(|keyring| keyring.archive.get(&version).cloned())
    }

    pub fn public_keys(&self) -> PublicKeyDirectory {
        self.directory.clone()
    }

    pub fn public_key(&self, key_id: &str) -> Option<PublicKeyEntry> {
        self.directory.get(key_id)
    }

    pub fn key_ids(&self) -> Vec<String> {
        self.directory.key_ids()
    }

    /// Replace the signing keypair. The symmetric key is unchanged but the
    /// version still advances.
    pub fn rotate_signing_keys(&self) -> Result<Arc<KeyMaterial>> {
        self.rotate("signing", |provider, current| {
            let signing_key_pair = provider
                .generate_signing_key()
                .map_err(|e| unavailable("failed to generate signing key", e))?;
            Ok((current.symmetric_key.clone(), signing_key_pair))
        })
    }

    /// Replace the symmetric master key. The previous key is archived for
    /// decryption only.
    pub fn rotate_master_key(&self) -> Result<Arc<KeyMaterial>> {
        self.rotate("master", |provider, current| {
            let symmetric_key = provider
                .generate_symmetric_key()
                .map_err(|e| unavailable("failed to generate master key", e))?;
            Ok((symmetric_key, current.signing_key_pair.clone()))
        })
    }

    /// The current keyring, freshly sealed under the wrapping key.
    pub fn backup_snapshot(&self) -> Result<Vec<u8>> {
        let state = self.state.read();
        let keyring = state
            .as_ref()
            .ok_or_else(|| ProvenanceError::KeyStoreUnavailable("key store is torn down".to_string()))?;
        let document = self.document(&keyring.current, &keyring.archive, self.directory.entries());
        let blob = self.seal(&document)?;
        debug!(version = keyring.current.version, "Produced keyring snapshot");
        Ok(blob)
    }

    /// Drop in-memory secrets. Creation operations fail afterwards while
    /// signature verification through the public-key directory keeps working.
    pub fn teardown(&self) {
        let _guard = self.rotation.lock();
        if self.state.write().take().is_some() {
            info!("Key store torn down");
        }
    }

    fn rotate<F>(&self, kind: &str, next: F) -> Result<Arc<KeyMaterial>>
    where
        F: FnOnce(&dyn CryptoProvider, &KeyMaterial) -> Result<(SymmetricKey, SigningKeyPair)>,
    {
        let _guard = self.rotation.lock();

        let (current, mut archive) = {
            let state = self.state.read();
            let keyring = state.as_ref().ok_or_else(|| {
                ProvenanceError::KeyStoreUnavailable("key store is torn down".to_string())
            })?;
            (Arc::clone(&keyring.current), keyring.archive.clone())
        };

        let version = current
            .version
            .checked_add(1)
            .ok_or_else(|| ProvenanceError::KeyStoreUnavailable("key version exhausted".to_string()))?;
        let now = self.clock.now_millis();
        let (symmetric_key, signing_key_pair) = next(self.provider.as_ref(), &current)?;

        let material = KeyMaterial {
            version,
            symmetric_key,
            signing_key_pair,
            created_at: now,
        };
        archive.insert(version, material.symmetric_key.clone());

        let signing_changed = material.key_id() != current.key_id();
        let mut entries = self.directory.entries();
        if signing_changed {
            for entry in entries.iter_mut() {
                if entry.key_id == current.key_id() {
                    entry.retired_at.get_or_insert(now);
                }
            }
            entries.push(self.public_entry(&material));
        }

        // Persist before publishing; a failed write leaves the old keyring active.
        let document = self.document(&material, &archive, entries);
        let blob = self.seal(&document)?;
        if let Err(e) = self.storage.store(&blob) {
            warn!(kind, error = %e, "Key rotation aborted: keyring could not be persisted");
            return Err(unavailable("failed to persist keyring", e));
        }

        // Publish the new public key before the new private key is usable.
        if signing_changed {
            self.directory.insert(self.public_entry(&material));
            self.directory.retire(current.key_id(), now);
        }

        let material = Arc::new(material);
        *self.state.write() = Some(Keyring {
            current: Arc::clone(&material),
            archive,
        });

        info!(
            kind,
            version = material.version,
            key_id = %material.key_id(),
            previous_key_id = %current.key_id(),
            "Rotated keys"
        );
        Ok(material)
    }

    fn generate(&self) -> Result<Keyring> {
        let symmetric_key = self
            .provider
            .generate_symmetric_key()
            .map_err(|e| unavailable("failed to generate master key", e))?;
        let signing_key_pair = self
            .provider
            .generate_signing_key()
            .map_err(|e| unavailable("failed to generate signing key", e))?;

        let material = KeyMaterial {
            version: 1,
            symmetric_key,
            signing_key_pair,
            created_at: self.clock.now_millis(),
        };

        let mut archive = BTreeMap::new();
        archive.insert(material.version, material.symmetric_key.clone());
        let entry = self.public_entry(&material);

        let document = self.document(&material, &archive, vec![entry.clone()]);
        let blob = self.seal(&document)?;
        self.storage
            .store(&blob)
            .map_err(|e| unavailable("failed to persist keyring", e))?;

        self.directory.insert(entry);
        Ok(Keyring {
            current: Arc::new(material),
            archive,
        })
    }

    fn restore(&self, blob: &[u8]) -> Result<Keyring> {
        let document = self.open(blob)?;

        let mut archive = BTreeMap::new();
        for archived in &document.symmetric_keys {
            let key = SymmetricKey::from_slice(&archived.key)
                .map_err(|e| unavailable("keyring holds a malformed master key", e))?;
            archive.insert(archived.version, key);
        }

        let symmetric_key = archive.get(&document.current_version).cloned().ok_or_else(|| {
            ProvenanceError::KeyStoreUnavailable(format!(
                "keyring has no master key for version {}",
                document.current_version
            ))
        })?;
        let signing_key_pair = self
            .provider
            .signing_key_from_secret(&document.signing_secret)
            .map_err(|e| unavailable("keyring holds a malformed signing key", e))?;

        let material = KeyMaterial {
            version: document.current_version,
            symmetric_key,
            signing_key_pair,
            created_at: document.created_at,
        };

        for entry in &document.public_keys {
            self.directory.insert(entry.clone());
        }
        if self.directory.get(material.key_id()).is_none() {
            self.directory.insert(self.public_entry(&material));
        }

        Ok(Keyring {
            current: Arc::new(material),
            archive,
        })
    }

    fn public_entry(&self, material: &KeyMaterial) -> PublicKeyEntry {
        PublicKeyEntry {
            key_id: material.key_id().to_string(),
            algorithm_id: self.provider.suite().signature.to_string(),
            public_key: material.signing_key_pair.public_key().to_vec(),
            version: material.version,
            activated_at: material.created_at,
            retired_at: None,
        }
    }

    fn document(
        &self,
        material: &KeyMaterial,
        archive: &BTreeMap<u32, SymmetricKey>,
        public_keys: Vec<PublicKeyEntry>,
    ) -> KeyringDocument {
        KeyringDocument {
            current_version: material.version,
            created_at: material.created_at,
            signing_secret: material.signing_key_pair.secret_bytes().to_vec(),
            symmetric_keys: archive
                .iter()
                .map(|(version, key)| ArchivedKey {
                    version: *version,
                    key: key.as_bytes().to_vec(),
                })
                .collect(),
            public_keys,
        }
    }

    fn keyring_aad(&self) -> Vec<u8> {
        let mut aad = KEYRING_AAD_DOMAIN.as_bytes().to_vec();
        aad.extend_from_slice(&KEYRING_FORMAT.to_le_bytes());
        aad
    }

    fn seal(&self, document: &KeyringDocument) -> Result<Vec<u8>> {
        let plaintext = Zeroizing::new(
            serde_json::to_vec(document).map_err(|e| unavailable("failed to encode keyring", e))?,
        );
        let nonce = self
            .provider
            .generate_nonce()
            .map_err(|e| unavailable("failed to generate nonce", e))?;
        let sealed = self
            .provider
            .seal(&self.wrapping_key.0, &nonce, &self.keyring_aad(), &plaintext)
            .map_err(|e| unavailable("failed to seal keyring", e))?;

        let envelope = SealedKeyring {
            format: KEYRING_FORMAT,
            algorithm_id: self.provider.suite().aead.to_string(),
            nonce: nonce.to_vec(),
            ciphertext: sealed.ciphertext,
            tag: sealed.tag.to_vec(),
        };
        serde_json::to_vec(&envelope).map_err(|e| unavailable("failed to encode keyring", e))
    }

    fn open(&self, blob: &[u8]) -> Result<KeyringDocument> {
        let envelope: SealedKeyring = serde_json::from_slice(blob)
            .map_err(|e| unavailable("keyring blob is malformed", e))?;

        if envelope.format != KEYRING_FORMAT {
            return Err(ProvenanceError::KeyStoreUnavailable(format!(
                "unsupported keyring format {}",
                envelope.format
            )));
        }
        if envelope.algorithm_id != self.provider.suite().aead {
            return Err(ProvenanceError::KeyStoreUnavailable(format!(
                "keyring sealed with unsupported algorithm {}",
                envelope.algorithm_id
            )));
        }

        let nonce = <[u8; NONCE_LEN]>::try_from(envelope.nonce.as_slice())
            .map_err(|_| ProvenanceError::KeyStoreUnavailable("keyring nonce is malformed".to_string()))?;
        let tag = <[u8; TAG_LEN]>::try_from(envelope.tag.as_slice())
            .map_err(|_| ProvenanceError::KeyStoreUnavailable("keyring tag is malformed".to_string()))?;

        let plaintext = Zeroizing::new(
            self.provider
                .open(
                    &self.wrapping_key.0,
                    &nonce,
                    &self.keyring_aad(),
                    &envelope.ciphertext,
                    &tag,
                )
                .map_err(|_| {
                    warn!("Keyring could not be unsealed: wrong wrapping key or tampered blob");
                    ProvenanceError::KeyStoreUnavailable("keyring could not be unsealed".to_string())
                })?,
        );

        serde_json::from_slice(&plaintext).map_err(|e| unavailable("keyring contents are malformed", e))
    }
}
