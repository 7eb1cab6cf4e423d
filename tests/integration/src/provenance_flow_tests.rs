//! End-to-end document lifecycle through the provenance service.
//!
//! A document is encrypted, stamped, signed and audited, then verified as it
//! was and after it has been modified.

use crate::test_utils::{init_tracing, TestEnvironment};
use attest_core::Config;
use attest_crypto::{ChainReport, ProvenanceError};
use attest_provenance::{Finding, ServiceError};
use serde_json::json;

#[test]
fn test_hello_document_lifecycle() {
    init_tracing();
    let env = TestEnvironment::new();
    let service = &env.service;

    tracing::info!("Step 1: Encrypt the original document");
    let payload = service.encrypt(b"Hello", b"doc-hello").unwrap();
    assert_eq!(service.decrypt(&payload, b"doc-hello").unwrap(), b"Hello");

    tracing::info!("Step 2: Stamp creation and collect signatures");
    service.stamp("doc-hello", b"Hello", "alice", "create").unwrap();
    env.tick();
    service.chain_sign("doc-hello", b"Hello", &["alice", "bob"]).unwrap();

    tracing::info!("Step 3: Record the creation in the audit trail");
    let entry = service
        .audit_entry("alice", "document.create", "doc-hello")
        .with_states(json!(null), json!({ "status": "draft" }));
    let recorded = service.record_audit(entry).unwrap();
    assert!(service.verify_audit(&recorded.entry));

    tracing::info!("Step 4: Verify the untouched document");
    let signatures = service.signature_records("doc-hello").unwrap();
    let timestamps = service.timestamp_records("doc-hello").unwrap();
    let verdict = service.verify_encrypted_document(&payload, b"doc-hello", &signatures, &timestamps);
    assert!(verdict.overall_valid, "findings: {:?}", verdict.findings);

    tracing::info!("Step 5: Verify a modified copy against the same records");
    let verdict = service.verify_document(b"Hello!", &signatures, &timestamps);
    assert!(!verdict.overall_valid);
    assert!(!verdict.signature_valid);
    assert!(!verdict.hash_valid);
    assert!(verdict
        .findings
        .contains(&Finding::SignatureContentMismatch { index: 0 }));

    tracing::info!("Step 6: A rewritten audit entry no longer verifies");
    let mut forged = recorded.entry.clone();
    forged.after_state = json!({ "status": "approved" });
    assert!(!service.verify_audit(&forged));
}

#[test]
fn test_document_revision_extends_chains() {
    init_tracing();
    let env = TestEnvironment::new();
    let service = &env.service;

    service.stamp("doc-rev", b"v1", "alice", "create").unwrap();
    service.sign("doc-rev", b"v1", "alice").unwrap();
    env.tick();
    service.stamp("doc-rev", b"v2", "bob", "update").unwrap();

    let timestamps = service.timestamp_records("doc-rev").unwrap();
    assert_eq!(timestamps.len(), 2);
    assert!(timestamps[1].timestamp_value > timestamps[0].timestamp_value);
    assert_eq!(timestamps[1].previous_timestamp_hash, Some(timestamps[0].chain_hash));
    assert!(service.verify_timestamp_chain(&timestamps));

    // Timestamps follow the latest revision but alice only signed v1.
    let verdict = service.verify_stored_document("doc-rev", b"v2").unwrap();
    assert!(verdict.timestamp_valid);
    assert!(!verdict.signature_valid);

    service.sign("doc-rev", b"v2", "bob").unwrap();
    let signatures = service.signature_records("doc-rev").unwrap();
    assert_eq!(signatures.len(), 2);
    assert!(service.verify_signature(b"v1", &signatures[0]));
    assert!(service.verify_signature(b"v2", &signatures[1]));
    assert!(service.verify_signature_chain(&signatures));
}

#[test]
fn test_notarized_document() {
    init_tracing();
    let env = TestEnvironment::new();
    let service = &env.service;
    let content = b"contract body";
    let attachment = b"%PDF-1.7 scanned signature page";

    service.stamp("doc-notary", content, "alice", "create").unwrap();
    env.tick();
    let record = service
        .notarize("doc-notary", content, "notary-7", attachment)
        .unwrap();

    assert!(record.is_notarization());
    assert!(service.verify_notarization(&record, content, "notary-7", attachment));
    assert!(!service.verify_notarization(&record, content, "notary-7", b"other page"));
    assert!(!service.verify_notarization(&record, content, "notary-8", attachment));

    let err = service
        .stamp("doc-notary", content, "alice", "notarize")
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Provenance(ProvenanceError::InvalidInput { .. })
    ));
}

#[test]
fn test_policy_allows_unstamped_documents() {
    init_tracing();
    let mut config = Config::default_config();
    config.verification.require_timestamps = false;
    let env = TestEnvironment::with_config(&config);
    let service = &env.service;

    service.sign("doc-lite", b"memo", "alice").unwrap();
    let verdict = service.verify_stored_document("doc-lite", b"memo").unwrap();
    assert!(verdict.overall_valid, "findings: {:?}", verdict.findings);

    let strict = TestEnvironment::new();
    strict.service.sign("doc-lite", b"memo", "alice").unwrap();
    let verdict = strict.service.verify_stored_document("doc-lite", b"memo").unwrap();
    assert!(!verdict.overall_valid);
    assert!(verdict.findings.contains(&Finding::MissingTimestamps));
}

#[test]
fn test_delete_document_leaves_audit_record() {
    init_tracing();
    let env = TestEnvironment::new();
    let service = &env.service;

    service.stamp("doc-gone", b"draft", "alice", "create").unwrap();
    service.chain_sign("doc-gone", b"draft", &["alice", "bob"]).unwrap();
    env.tick();

    assert_eq!(service.delete_document("doc-gone", "admin").unwrap(), 3);
    assert!(service.signature_records("doc-gone").unwrap().is_empty());
    assert!(service.timestamp_records("doc-gone").unwrap().is_empty());

    let trail = service.audit_trail("doc-gone").unwrap();
    assert_eq!(trail.len(), 1);
    assert_eq!(trail[0].entry.action, "document.delete");
    assert_eq!(trail[0].entry.context["removed_records"], json!(3));
    assert!(matches!(
        service.verify_audit_trail("doc-gone").unwrap(),
        ChainReport::Intact { length: 1 }
    ));
}

#[test]
fn test_content_keys_are_scoped() {
    init_tracing();
    let env = TestEnvironment::new();
    let service = &env.service;

    let alice = service.derive_content_key("doc-1", "alice").unwrap();
    let again = service.derive_content_key("doc-1", "alice").unwrap();
    let bob = service.derive_content_key("doc-1", "bob").unwrap();
    let other_doc = service.derive_content_key("doc-2", "alice").unwrap();

    assert_eq!(alice.as_bytes(), again.as_bytes());
    assert_ne!(alice.as_bytes(), bob.as_bytes());
    assert_ne!(alice.as_bytes(), other_doc.as_bytes());
    assert!(service.derive_content_key("", "alice").is_err());
}
