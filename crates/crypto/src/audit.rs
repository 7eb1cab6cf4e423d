//! Tamper-evident audit entries.
//!
//! Each [`AuditEntry`] carries `audit_hash`, a BLAKE3 digest over the
//! canonical JSON of every other field (keys sorted, no whitespace). Any
//! change to any field, nested state included, changes the hash.
//!
//! Per-entry hashes cannot reveal a deleted or reordered entry, so
//! [`AuditTrail`] optionally chains sealed entries for one scope.

use attest_core::Clock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::chain::{compute_chain_hash, inspect_chain, ChainLog, ChainRecord, ChainReport};
use crate::error::{require_id, ProvenanceError, Result};
use crate::preimage::Preimage;
use crate::provider::{CryptoProvider, Digest};

const AUDIT_DOMAIN: &str = "attest:audit:v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub actor_id: String,
    pub action: String,
    /// The document or entity the action touched
    pub scope: String,
    pub before_state: Value,
    pub after_state: Value,
    pub context: BTreeMap<String, Value>,
    pub recorded_at: u64,
    /// `None` until sealed
    pub audit_hash: Option<Digest>,
}

impl AuditEntry {
    pub fn new(
        actor_id: impl Into<String>,
        action: impl Into<String>,
        scope: impl Into<String>,
        recorded_at: u64,
    ) -> Self {
        Self {
            actor_id: actor_id.into(),
            action: action.into(),
            scope: scope.into(),
            before_state: Value::Null,
            after_state: Value::Null,
            context: BTreeMap::new(),
            recorded_at,
            audit_hash: None,
        }
    }

    pub fn with_states(mut self, before_state: Value, after_state: Value) -> Self {
        self.before_state = before_state;
        self.after_state = after_state;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn is_sealed(&self) -> bool {
        self.audit_hash.is_some()
    }

    /// Canonical JSON of every field except `audit_hash`.
    pub fn canonical_form(&self) -> String {
        let context: serde_json::Map<String, Value> = self
            .context
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let body = serde_json::json!({
            "actor_id": self.actor_id,
            "action": self.action,
            "scope": self.scope,
            "before_state": self.before_state,
            "after_state": self.after_state,
            "context": Value::Object(context),
            "recorded_at": self.recorded_at,
        });
        canonical_json(&body)
    }
}

/// Deterministic JSON: object keys sorted, no whitespace. `serde_json`
/// numbers are always finite so this cannot fail.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => value.to_string(),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let pairs: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", pairs.join(","))
        }
    }
}

/// Digest of an entry's canonical form.
pub fn compute_audit_hash(provider: &dyn CryptoProvider, entry: &AuditEntry) -> Digest {
    Preimage::new(AUDIT_DOMAIN)
        .text(&entry.canonical_form())
        .digest(provider)
}

/// Seals and verifies audit entries.
#[derive(Clone)]
pub struct AuditHasher {
    provider: Arc<dyn CryptoProvider>,
    clock: Arc<dyn Clock>,
}

impl AuditHasher {
    pub fn new(provider: Arc<dyn CryptoProvider>, clock: Arc<dyn Clock>) -> Self {
        Self { provider, clock }
    }

    /// An unsealed entry stamped with the current time.
    pub fn entry(&self, actor_id: &str, action: &str, scope: &str) -> AuditEntry {
        AuditEntry::new(actor_id, action, scope, self.clock.now_millis())
    }

    /// Compute the audit hash for `entry`. Deterministic: equal entries give
    /// equal hashes regardless of JSON key order.
    ///
    /// # Errors
    /// `InvalidInput` if the actor, action or scope is empty.
    pub fn seal(&self, entry: &AuditEntry) -> Result<Digest> {
        require_id("actor_id", &entry.actor_id)?;
        require_id("action", &entry.action)?;
        require_id("scope", &entry.scope)?;
        Ok(compute_audit_hash(self.provider.as_ref(), entry))
    }

    /// Seal `entry`, storing the hash on it.
    pub fn seal_entry(&self, mut entry: AuditEntry) -> Result<AuditEntry> {
        let hash = self.seal(&entry)?;
        entry.audit_hash = Some(hash);
        debug!(
            scope = %entry.scope,
            action = %entry.action,
            actor_id = %entry.actor_id,
            "Sealed audit entry"
        );
        Ok(entry)
    }

    /// True iff the entry is sealed and its hash recomputes.
    pub fn verify(&self, entry: &AuditEntry) -> bool {
        match entry.audit_hash {
            Some(stored) => {
                let intact = compute_audit_hash(self.provider.as_ref(), entry) == stored;
                if !intact {
                    warn!(scope = %entry.scope, action = %entry.action, "Audit entry tampered");
                }
                intact
            }
            None => false,
        }
    }

    /// Raising variant of [`AuditHasher::verify`].
    pub fn ensure_intact(&self, entry: &AuditEntry) -> Result<()> {
        if entry.audit_hash.is_none() {
            return Err(ProvenanceError::AuditTamperDetected(format!(
                "entry '{}' on '{}' is not sealed",
                entry.action, entry.scope
            )));
        }
        if !self.verify(entry) {
            return Err(ProvenanceError::AuditTamperDetected(format!(
                "entry '{}' on '{}' does not match its hash",
                entry.action, entry.scope
            )));
        }
        Ok(())
    }

    pub fn new_trail(&self, scope: &str) -> AuditTrail {
        AuditTrail {
            hasher: self.clone(),
            log: ChainLog::new(Arc::clone(&self.provider), scope),
        }
    }

    /// Walk a chained trail. An empty trail is intact.
    pub fn inspect_trail(&self, entries: &[ChainedAuditEntry]) -> ChainReport {
        inspect_chain(self.provider.as_ref(), entries)
    }
}

/// A sealed audit entry linked to its predecessor in the same scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainedAuditEntry {
    pub entry: AuditEntry,
    pub previous_hash: Option<Digest>,
    pub chain_hash: Digest,
}

impl ChainRecord for ChainedAuditEntry {
    fn document_id(&self) -> &str {
        &self.entry.scope
    }

    fn record_digest(&self) -> Digest {
        self.entry.audit_hash.unwrap_or([0u8; 32])
    }

    fn recompute_digest(&self, provider: &dyn CryptoProvider) -> Digest {
        compute_audit_hash(provider, &self.entry)
    }

    fn chain_hash(&self) -> Digest {
        self.chain_hash
    }

    fn previous_hash(&self) -> Option<Digest> {
        self.previous_hash
    }

    fn recorded_at(&self) -> u64 {
        self.entry.recorded_at
    }
}

/// Append-only chain of audit entries for one scope.
pub struct AuditTrail {
    hasher: AuditHasher,
    log: ChainLog<ChainedAuditEntry>,
}

impl AuditTrail {
    /// Rebuild a trail from stored entries, validating every link.
    pub fn from_entries(hasher: &AuditHasher, scope: &str, entries: Vec<ChainedAuditEntry>) -> Result<Self> {
        let log = ChainLog::from_records(Arc::clone(&hasher.provider), scope, entries)?;
        Ok(Self {
            hasher: hasher.clone(),
            log,
        })
    }

    /// Link an entry onto the trail, sealing it first if needed.
    ///
    /// # Errors
    /// `AuditTamperDetected` if a sealed entry does not match its hash,
    /// `ChainBroken` if it belongs to another scope or predates the head.
    pub fn append(&mut self, entry: AuditEntry) -> Result<&ChainedAuditEntry> {
        let entry = if entry.is_sealed() {
            self.hasher.ensure_intact(&entry)?;
            entry
        } else {
            self.hasher.seal_entry(entry)?
        };

        let digest = entry.audit_hash.unwrap_or([0u8; 32]);
        let previous_hash = self.log.head_hash();
        let chain_hash = compute_chain_hash(
            self.hasher.provider.as_ref(),
            &digest,
            previous_hash.as_ref(),
        );

        self.log.append(ChainedAuditEntry {
            entry,
            previous_hash,
            chain_hash,
        })
    }

    pub fn scope(&self) -> &str {
        self.log.document_id()
    }

    pub fn entries(&self) -> &[ChainedAuditEntry] {
        self.log.records()
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    pub fn verify(&self) -> ChainReport {
        self.log.verify()
    }

    pub fn into_entries(self) -> Vec<ChainedAuditEntry> {
        self.log.into_records()
    }
}
