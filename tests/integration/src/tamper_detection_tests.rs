//! Tamper detection across stored provenance records.
//!
//! Records are produced through the service, altered the way an attacker with
//! write access to storage would, and then verified again.

use crate::test_utils::{init_tracing, TestEnvironment};
use attest_crypto::{ChainFault, ChainReport};
use attest_provenance::Finding;
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::thread;

fn signed_document(env: &TestEnvironment, document_id: &str, signers: usize) {
    env.service
        .stamp(document_id, b"ledger", "signer-0", "create")
        .unwrap();
    for i in 0..signers {
        env.tick();
        env.service
            .sign(document_id, b"ledger", &format!("signer-{}", i))
            .unwrap();
    }
}

#[test]
fn test_deleted_audit_entry_is_detected() {
    init_tracing();
    let env = TestEnvironment::new();
    let service = &env.service;

    for (actor, action) in [("alice", "create"), ("bob", "review"), ("carol", "approve")] {
        let entry = service
            .audit_entry(actor, action, "doc-audit")
            .with_context("ip", json!("10.0.0.7"));
        service.record_audit(entry).unwrap();
        env.tick();
    }
    assert!(service.verify_audit_trail("doc-audit").unwrap().is_intact());

    let mut trail = service.audit_trail("doc-audit").unwrap();
    trail.remove(1);
    let provider = env.service.key_store().provider();
    let hasher = attest_crypto::AuditHasher::new(Arc::clone(provider), env.clock.clone());
    assert_eq!(
        hasher.inspect_trail(&trail),
        ChainReport::Broken {
            index: 1,
            fault: ChainFault::BrokenLink
        }
    );

    let mut headless = service.audit_trail("doc-audit").unwrap();
    headless.remove(0);
    assert_eq!(
        hasher.inspect_trail(&headless),
        ChainReport::Broken {
            index: 0,
            fault: ChainFault::InvalidGenesis
        }
    );
}

#[test]
fn test_reordered_signatures_are_detected() {
    init_tracing();
    let env = TestEnvironment::new();
    signed_document(&env, "doc-order", 3);

    let mut signatures = env.service.signature_records("doc-order").unwrap();
    signatures.swap(1, 2);
    let timestamps = env.service.timestamp_records("doc-order").unwrap();

    let verdict = env.service.verify_document(b"ledger", &signatures, &timestamps);
    assert!(verdict.signature_valid);
    assert!(!verdict.chain_valid);
    assert!(verdict.findings.iter().any(|f| matches!(
        f,
        Finding::SignatureChainBroken { index: 1, .. }
    )));
}

#[test]
fn test_backdated_timestamp_is_detected() {
    init_tracing();
    let env = TestEnvironment::new();
    env.service.stamp("doc-ts", b"v1", "alice", "create").unwrap();
    env.tick();
    env.service.stamp("doc-ts", b"v1", "bob", "review").unwrap();

    let mut timestamps = env.service.timestamp_records("doc-ts").unwrap();
    timestamps[1].timestamp_value -= 5_000;
    assert!(!env.service.verify_timestamp_chain(&timestamps));
    assert!(!env.service.verify_timestamp(&timestamps[1], b"v1", "bob"));
}

#[test]
fn test_future_timestamp_is_rejected() {
    init_tracing();
    let env = TestEnvironment::new();
    env.clock.advance(3_600_000);
    env.service.stamp("doc-future", b"v1", "alice", "create").unwrap();

    let stamped = env.service.timestamp_records("doc-future").unwrap();
    assert!(env.service.verify_timestamp_chain(&stamped));

    env.clock.set(crate::test_utils::START_MS);
    assert!(!env.service.verify_timestamp_chain(&stamped));
}

#[test]
fn test_records_from_another_document_are_detected() {
    init_tracing();
    let env = TestEnvironment::new();
    signed_document(&env, "doc-a", 1);
    signed_document(&env, "doc-b", 1);

    let signatures = env.service.signature_records("doc-a").unwrap();
    let timestamps = env.service.timestamp_records("doc-b").unwrap();
    let verdict = env.service.verify_document(b"ledger", &signatures, &timestamps);
    assert!(!verdict.overall_valid);
    assert!(verdict.findings.contains(&Finding::DocumentMismatch {
        expected: "doc-a".to_string(),
        found: "doc-b".to_string(),
    }));
}

#[test]
fn test_concurrent_appends_keep_chains_linear() {
    init_tracing();
    let env = TestEnvironment::new();

    thread::scope(|scope| {
        for worker in 0..8 {
            let service = Arc::clone(&env.service);
            scope.spawn(move || {
                for document in ["doc-x", "doc-y"] {
                    service
                        .sign(document, b"shared", &format!("worker-{}", worker))
                        .unwrap();
                    service
                        .stamp(document, b"shared", &format!("worker-{}", worker), "review")
                        .unwrap();
                }
            });
        }
    });

    for document in ["doc-x", "doc-y"] {
        let signatures = env.service.signature_records(document).unwrap();
        let timestamps = env.service.timestamp_records(document).unwrap();
        assert_eq!(signatures.len(), 8);
        assert_eq!(timestamps.len(), 8);

        let verdict = env.service.verify_document(b"shared", &signatures, &timestamps);
        assert!(verdict.overall_valid, "{}: {:?}", document, verdict.findings);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_tampered_signer_breaks_chain_at_index(signers in 2usize..6, pick in 0usize..6) {
        let env = TestEnvironment::new();
        signed_document(&env, "doc-prop", signers);
        let target = pick % signers;

        let mut signatures = env.service.signature_records("doc-prop").unwrap();
        signatures[target].signer_id = "mallory".to_string();
        let timestamps = env.service.timestamp_records("doc-prop").unwrap();

        let verdict = env.service.verify_document(b"ledger", &signatures, &timestamps);
        prop_assert!(!verdict.overall_valid);
        let broken_at = verdict.findings.iter().find_map(|f| match f {
            Finding::SignatureChainBroken { index, .. } => Some(*index),
            _ => None,
        });
        prop_assert_eq!(broken_at, Some(target));
    }
}
