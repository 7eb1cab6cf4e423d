//! Shared fixtures for the integration suites.

use attest_core::{Config, ManualClock};
use attest_crypto::{
    FileKeyStorage, KeyStorage, KeyStore, MemoryKeyStorage, StandardProvider, WrappingKey,
};
use attest_provenance::{MemoryRecordStore, ProvenanceService};
use std::path::Path;
use std::sync::Arc;

/// Fixed start time so stamped records are reproducible.
pub const START_MS: u64 = 1_700_000_000_000;

/// A service wired to a manual clock and an in-memory record store.
pub struct TestEnvironment {
    pub service: Arc<ProvenanceService>,
    pub store: Arc<MemoryRecordStore>,
    pub clock: Arc<ManualClock>,
}

impl TestEnvironment {
    /// Ephemeral keyring with the default configuration.
    pub fn new() -> Self {
        Self::with_config(&Config::default_config())
    }

    pub fn with_config(config: &Config) -> Self {
        Self::with_storage(Arc::new(MemoryKeyStorage::new()), b"integration-secret", config)
    }

    /// Keyring sealed to a file at `path` under `secret`.
    pub fn with_keyring_file(path: &Path, secret: &[u8]) -> Self {
        Self::with_storage(
            Arc::new(FileKeyStorage::new(path)),
            secret,
            &Config::default_config(),
        )
    }

    pub fn with_storage(storage: Arc<dyn KeyStorage>, secret: &[u8], config: &Config) -> Self {
        let provider = StandardProvider::shared();
        let clock = Arc::new(ManualClock::new(START_MS));
        let wrapping_key =
            WrappingKey::derive(provider.as_ref(), secret).expect("derive wrapping key");
        let keys = KeyStore::initialize(storage, provider, wrapping_key, clock.clone())
            .expect("initialize key store");
        let store = Arc::new(MemoryRecordStore::new());
        let service = ProvenanceService::new(Arc::new(keys), store.clone(), clock.clone(), config);

        Self {
            service: Arc::new(service),
            store,
            clock,
        }
    }

    /// Move the clock forward one second.
    pub fn tick(&self) {
        self.clock.advance(1_000);
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}
