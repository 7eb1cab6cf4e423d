//! Key lifecycle across rotation, restart and backup.
//!
//! This suite validates:
//! - Signatures made before a rotation keep verifying after it
//! - Payloads encrypted under retired master keys still decrypt
//! - Encryption racing with rotation never yields an unreadable payload
//! - A keyring file survives a restart and rejects the wrong secret
//! - Backup snapshots are sealed and restore to a working key store

use crate::test_utils::{init_tracing, TestEnvironment};
use attest_core::Config;
use attest_crypto::{MemoryKeyStorage, ProvenanceError};
use attest_provenance::ServiceError;
use std::sync::Arc;

#[test]
fn test_signers_across_signing_rotation() {
    init_tracing();
    let env = TestEnvironment::new();
    let service = &env.service;
    let content = b"quarterly report";

    tracing::info!("Step 1: Signer A signs under the first keypair");
    let before = service.key_info().unwrap();
    service.stamp("doc-rot", content, "signer-a", "create").unwrap();
    let first = service.sign("doc-rot", content, "signer-a").unwrap();

    tracing::info!("Step 2: Rotate signing keys");
    env.tick();
    let after = service.rotate_signing_keys().unwrap();
    assert_eq!(after.version, before.version + 1);
    assert_ne!(after.key_id, before.key_id);
    assert!(after.known_key_ids.contains(&before.key_id));

    tracing::info!("Step 3: Signer B countersigns under the new keypair");
    let second = service.sign("doc-rot", content, "signer-b").unwrap();
    assert_eq!(first.public_key_ref, before.key_id);
    assert_eq!(second.public_key_ref, after.key_id);
    assert_eq!(second.previous_signature_hash, Some(first.chain_hash));

    tracing::info!("Step 4: Both signatures and the chain verify");
    assert!(service.verify_signature(content, &first));
    assert!(service.verify_signature(content, &second));
    let verdict = service.verify_stored_document("doc-rot", content).unwrap();
    assert!(verdict.overall_valid, "findings: {:?}", verdict.findings);
}

#[test]
fn test_payloads_survive_master_rotation() {
    init_tracing();
    let env = TestEnvironment::new();
    let service = &env.service;

    let old = service.encrypt(b"archived contract", b"ctx").unwrap();
    service.rotate_master_key().unwrap();
    let new = service.encrypt(b"fresh contract", b"ctx").unwrap();

    assert!(new.key_version > old.key_version);
    assert_eq!(service.decrypt(&old, b"ctx").unwrap(), b"archived contract");
    assert_eq!(service.decrypt(&new, b"ctx").unwrap(), b"fresh contract");

    let migrated = service.reencrypt(&old, b"ctx").unwrap();
    assert_eq!(migrated.key_version, new.key_version);
    assert_eq!(service.decrypt(&migrated, b"ctx").unwrap(), b"archived contract");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_encrypt_during_rotation() {
    init_tracing();
    let env = TestEnvironment::new();

    let mut writers = Vec::new();
    for worker in 0..4 {
        let service = Arc::clone(&env.service);
        writers.push(tokio::task::spawn_blocking(move || {
            (0..25)
                .map(|i| {
                    let plaintext = format!("worker {} message {}", worker, i).into_bytes();
                    let payload = service.encrypt(&plaintext, b"race").unwrap();
                    (plaintext, payload)
                })
                .collect::<Vec<_>>()
        }));
    }

    let rotator = {
        let service = Arc::clone(&env.service);
        tokio::task::spawn_blocking(move || {
            for _ in 0..5 {
                service.rotate_master_key().unwrap();
                service.rotate_signing_keys().unwrap();
            }
        })
    };

    rotator.await.unwrap();
    for writer in writers {
        for (plaintext, payload) in writer.await.unwrap() {
            assert_eq!(env.service.decrypt(&payload, b"race").unwrap(), plaintext);
        }
    }
    assert_eq!(env.service.key_info().unwrap().version, 11);
}

#[test]
fn test_keyring_file_restart() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keyring.sealed");

    tracing::info!("Step 1: First start generates and persists the keyring");
    let first = TestEnvironment::with_keyring_file(&path, b"correct horse");
    let payload = first.service.encrypt(b"persisted", b"ctx").unwrap();
    first.service.rotate_master_key().unwrap();
    let signature = first.service.sign("doc-file", b"persisted", "alice").unwrap();
    let info = first.service.key_info().unwrap();
    first.service.teardown();
    assert!(path.exists());

    tracing::info!("Step 2: Restart with the same secret");
    let second = TestEnvironment::with_keyring_file(&path, b"correct horse");
    assert_eq!(second.service.key_info().unwrap().key_id, info.key_id);
    assert_eq!(second.service.decrypt(&payload, b"ctx").unwrap(), b"persisted");
    assert!(second.service.verify_signature(b"persisted", &signature));

    tracing::info!("Step 3: The wrong secret cannot open the keyring");
    let provider = attest_crypto::StandardProvider::shared();
    let wrong = attest_crypto::WrappingKey::derive(provider.as_ref(), b"battery staple").unwrap();
    let result = attest_crypto::KeyStore::initialize(
        Arc::new(attest_crypto::FileKeyStorage::new(&path)),
        provider,
        wrong,
        second.clock.clone(),
    );
    assert!(matches!(result, Err(ProvenanceError::KeyStoreUnavailable(_))));
}

#[test]
fn test_backup_snapshot_restores() {
    init_tracing();
    let env = TestEnvironment::new();
    let service = &env.service;

    let payload = service.encrypt(b"backed up", b"ctx").unwrap();
    service.rotate_master_key().unwrap();
    let signature = service.sign("doc-backup", b"backed up", "alice").unwrap();
    let snapshot = service.backup_snapshot().unwrap();

    let master = service.key_store().current().unwrap();
    let text = String::from_utf8_lossy(&snapshot);
    assert!(!text.contains(&hex::encode(master.symmetric_key().as_bytes())));
    assert!(!text.contains("signing_secret"));
    drop(master);

    let restored = TestEnvironment::with_storage(
        Arc::new(MemoryKeyStorage::with_blob(snapshot)),
        b"integration-secret",
        &Config::default_config(),
    );
    assert_eq!(
        restored.service.key_info().unwrap().key_id,
        service.key_info().unwrap().key_id
    );
    assert_eq!(restored.service.decrypt(&payload, b"ctx").unwrap(), b"backed up");
    assert!(restored.service.verify_signature(b"backed up", &signature));
}

#[test]
fn test_failed_rotation_keeps_current_keys() {
    init_tracing();
    let storage = Arc::new(MemoryKeyStorage::new());
    let env = TestEnvironment::with_storage(
        storage.clone(),
        b"integration-secret",
        &Config::default_config(),
    );
    let before = env.service.key_info().unwrap();

    storage.set_available(false);
    let err = env.service.rotate_signing_keys().unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Provenance(ProvenanceError::KeyStoreUnavailable(_))
    ));

    let after = env.service.key_info().unwrap();
    assert_eq!(after.key_id, before.key_id);
    assert_eq!(after.version, before.version);
    env.service.sign("doc-outage", b"still signing", "alice").unwrap();
}

#[test]
fn test_teardown_blocks_creation_but_not_verification() {
    init_tracing();
    let env = TestEnvironment::new();
    let service = &env.service;

    let signature = service.sign("doc-down", b"final", "alice").unwrap();
    service.teardown();

    assert!(service.verify_signature(b"final", &signature));
    assert!(service.encrypt(b"more", b"ctx").is_err());
    assert!(service.sign("doc-down", b"final", "bob").is_err());
    assert!(service.key_info().is_err());
}
