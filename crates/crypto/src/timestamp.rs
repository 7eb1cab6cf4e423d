//! Hash-chained timestamps.
//!
//! Every state-changing action on a document appends a [`TimestampRecord`]
//! binding the content hash, the actor and the time. Records chain through
//! `previous_timestamp_hash`, and `timestamp_value` never decreases along a
//! chain even when the local clock steps backwards.
//!
//! Notarization is a stamp with the `notarize` action that also binds the
//! hash of a supporting document.

use attest_core::Clock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::chain::{compute_chain_hash, inspect_chain, ChainLog, ChainRecord, ChainReport};
use crate::error::{require_id, ProvenanceError, Result};
use crate::preimage::Preimage;
use crate::provider::{CryptoProvider, Digest};

pub const NOTARIZE_ACTION: &str = "notarize";

const TIMESTAMP_DOMAIN: &str = "attest:timestamp:v1";
const COMBINED_DOMAIN: &str = "attest:timestamp-combined:v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampRecord {
    pub document_id: String,
    pub content_hash: Digest,
    pub actor_id: String,
    pub action: String,
    /// Unix milliseconds
    pub timestamp_value: u64,
    pub timestamp_hash: Digest,
    pub combined_hash: Digest,
    pub chain_hash: Digest,
    pub previous_timestamp_hash: Option<Digest>,
    /// Hash of the notarized document, present only for `notarize`
    pub document_hash: Option<Digest>,
}

impl TimestampRecord {
    pub fn is_notarization(&self) -> bool {
        self.action == NOTARIZE_ACTION
    }
}

impl ChainRecord for TimestampRecord {
    fn document_id(&self) -> &str {
        &self.document_id
    }

    fn record_digest(&self) -> Digest {
        self.combined_hash
    }

    fn recompute_digest(&self, provider: &dyn CryptoProvider) -> Digest {
        combined_hash(
            provider,
            &self.document_id,
            &self.action,
            &self.content_hash,
            &timestamp_hash(provider, self.timestamp_value),
            &self.actor_id,
            self.document_hash.as_ref(),
        )
    }

    fn chain_hash(&self) -> Digest {
        self.chain_hash
    }

    fn previous_hash(&self) -> Option<Digest> {
        self.previous_timestamp_hash
    }

    fn recorded_at(&self) -> u64 {
        self.timestamp_value
    }
}

pub type TimestampChain = ChainLog<TimestampRecord>;

/// `H(timestamp_value)`
pub fn timestamp_hash(provider: &dyn CryptoProvider, timestamp_value: u64) -> Digest {
    Preimage::new(TIMESTAMP_DOMAIN)
        .u64(timestamp_value)
        .digest(provider)
}

/// `H(content_hash || timestamp_hash || actor_id [|| document_hash])`, also
/// binding the document id and action.
pub fn combined_hash(
    provider: &dyn CryptoProvider,
    document_id: &str,
    action: &str,
    content_hash: &Digest,
    timestamp_hash: &Digest,
    actor_id: &str,
    document_hash: Option<&Digest>,
) -> Digest {
    Preimage::new(COMBINED_DOMAIN)
        .text(document_id)
        .text(action)
        .field(content_hash)
        .field(timestamp_hash)
        .text(actor_id)
        .optional(document_hash)
        .digest(provider)
}

pub struct TimestampEngine {
    provider: Arc<dyn CryptoProvider>,
    clock: Arc<dyn Clock>,
    max_future_skew_ms: u64,
}

impl TimestampEngine {
    /// # Arguments
    /// * `max_future_skew_ms` - How far ahead of the local clock a record may
    ///   be before verification rejects it
    pub fn new(provider: Arc<dyn CryptoProvider>, clock: Arc<dyn Clock>, max_future_skew_ms: u64) -> Self {
        Self {
            provider,
            clock,
            max_future_skew_ms,
        }
    }

    pub fn new_chain(&self, document_id: &str) -> TimestampChain {
        ChainLog::new(Arc::clone(&self.provider), document_id)
    }

    /// Append a timestamp for `action` on `content` by `actor_id`.
    ///
    /// # Errors
    /// `InvalidInput` for empty identifiers or the reserved `notarize` action
    /// (use [`TimestampEngine::notarize`]).
    pub fn stamp(
        &self,
        chain: &mut TimestampChain,
        content: &[u8],
        actor_id: &str,
        action: &str,
    ) -> Result<TimestampRecord> {
        if action == NOTARIZE_ACTION {
            return Err(ProvenanceError::InvalidInput {
                field: "action".to_string(),
                reason: "notarization must go through notarize()".to_string(),
            });
        }
        self.append(chain, content, actor_id, action, None)
    }

    /// Append a notarization binding `document` alongside the content.
    pub fn notarize(
        &self,
        chain: &mut TimestampChain,
        content: &[u8],
        actor_id: &str,
        document: &[u8],
    ) -> Result<TimestampRecord> {
        let document_hash = self.provider.digest(document);
        self.append(chain, content, actor_id, NOTARIZE_ACTION, Some(document_hash))
    }

    /// True iff `record` stamps exactly `content` by `actor_id` and all of
    /// its hashes recompute.
    pub fn verify(&self, record: &TimestampRecord, content: &[u8], actor_id: &str) -> bool {
        if record.actor_id != actor_id {
            warn!(document_id = %record.document_id, "Timestamp actor mismatch");
            return false;
        }
        if self.provider.digest(content) != record.content_hash {
            warn!(document_id = %record.document_id, "Content does not match timestamped hash");
            return false;
        }
        self.verify_record(record)
    }

    pub fn verify_notarization(
        &self,
        record: &TimestampRecord,
        content: &[u8],
        actor_id: &str,
        document: &[u8],
    ) -> bool {
        if !record.is_notarization() {
            return false;
        }
        if record.document_hash != Some(self.provider.digest(document)) {
            warn!(document_id = %record.document_id, "Notarized document mismatch");
            return false;
        }
        self.verify(record, content, actor_id)
    }

    /// Internal consistency of one record, without the content.
    pub fn verify_record(&self, record: &TimestampRecord) -> bool {
        if record.is_notarization() != record.document_hash.is_some() {
            return false;
        }
        if record.timestamp_hash != timestamp_hash(self.provider.as_ref(), record.timestamp_value) {
            warn!(document_id = %record.document_id, "Timestamp hash mismatch");
            return false;
        }
        if record.recompute_digest(self.provider.as_ref()) != record.combined_hash {
            warn!(document_id = %record.document_id, "Combined hash mismatch");
            return false;
        }
        let expected_chain = compute_chain_hash(
            self.provider.as_ref(),
            &record.combined_hash,
            record.previous_timestamp_hash.as_ref(),
        );
        if expected_chain != record.chain_hash {
            warn!(document_id = %record.document_id, "Timestamp chain hash mismatch");
            return false;
        }

        let horizon = self.clock.now_millis().saturating_add(self.max_future_skew_ms);
        if record.timestamp_value > horizon {
            warn!(
                document_id = %record.document_id,
                timestamp = record.timestamp_value,
                horizon,
                "Timestamp is in the future"
            );
            return false;
        }
        true
    }

    /// True iff links, monotonic time and every record's hashes are intact.
    pub fn verify_chain(&self, records: &[TimestampRecord]) -> bool {
        self.inspect_chain(records).is_intact() && records.iter().all(|r| self.verify_record(r))
    }

    pub fn inspect_chain(&self, records: &[TimestampRecord]) -> ChainReport {
        inspect_chain(self.provider.as_ref(), records)
    }

    fn append(
        &self,
        chain: &mut TimestampChain,
        content: &[u8],
        actor_id: &str,
        action: &str,
        document_hash: Option<Digest>,
    ) -> Result<TimestampRecord> {
        require_id("document_id", chain.document_id())?;
        require_id("actor_id", actor_id)?;
        require_id("action", action)?;

        let provider = self.provider.as_ref();
        let head = chain.head();

        let timestamp_value = head
            .map(|h| h.timestamp_value)
            .unwrap_or(0)
            .max(self.clock.now_millis());
        let content_hash = provider.digest(content);
        let timestamp_hash = timestamp_hash(provider, timestamp_value);
        let combined_hash = combined_hash(
            provider,
            chain.document_id(),
            action,
            &content_hash,
            &timestamp_hash,
            actor_id,
            document_hash.as_ref(),
        );
        let previous_timestamp_hash = head.map(|h| h.chain_hash);
        let chain_hash = compute_chain_hash(provider, &combined_hash, previous_timestamp_hash.as_ref());

        let record = TimestampRecord {
            document_id: chain.document_id().to_string(),
            content_hash,
            actor_id: actor_id.to_string(),
            action: action.to_string(),
            timestamp_value,
            timestamp_hash,
            combined_hash,
            chain_hash,
            previous_timestamp_hash,
            document_hash,
        };
        let appended = chain.append(record)?.clone();

        debug!(
            document_id = %appended.document_id,
            actor_id = %appended.actor_id,
            action = %appended.action,
            timestamp = appended.timestamp_value,
            "Timestamped action"
        );
        Ok(appended)
    }
}
