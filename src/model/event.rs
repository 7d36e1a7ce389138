//! The `Event` and `ProposedEvent` types
//!
//! An `Event` is immutable once committed (spec I1). A `ProposedEvent`
//! is what a caller hands to the store's `append` — it must not carry
//! any of the fields the store assigns (`id`, `sequence`, `previous_hash`,
//! `hash`), which is why the two are distinct types rather than one
//! struct with optional commit fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::actor::Actor;
use super::canonical::{canonical_string, hash_input, sha256_hex};
use super::causation::Causation;
use super::CanonicalizeError;

/// A caller's proposal to append an event. Carries everything the
/// store needs except the identifiers it is responsible for assigning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedEvent {
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    /// The version this event should become, i.e. current tip + 1.
    pub expected_aggregate_version: i64,
    pub payload: Value,
    pub actor: Actor,
    #[serde(default)]
    pub causation: Option<Causation>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub signer_id: Option<String>,
}

impl ProposedEvent {
    pub fn new(
        event_type: impl Into<String>,
        aggregate_type: impl Into<String>,
        aggregate_id: Uuid,
        expected_aggregate_version: i64,
        payload: Value,
        actor: Actor,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            aggregate_type: aggregate_type.into(),
            aggregate_id,
            expected_aggregate_version,
            payload,
            actor,
            causation: None,
            timestamp: Utc::now(),
            signature: None,
            signer_id: None,
        }
    }

    pub fn with_causation(mut self, causation: Causation) -> Self {
        self.causation = Some(causation);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// A fully materialized, committed event. Every field is set once at
/// commit and never changes afterward (spec I1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub sequence: i64,
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    pub aggregate_version: i64,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    pub actor: Actor,
    pub causation: Option<Causation>,
    pub previous_hash: String,
    pub hash: String,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub signer_id: Option<String>,
}

impl Event {
    /// Compute this event's canonical hash input and content hash from
    /// its current fields. Used both to assign `hash` at commit time
    /// and to re-verify it later (spec I7).
    pub fn compute_hash(&self) -> Result<String, CanonicalizeError> {
        let payload_canonical = canonical_string(&self.payload)?;
        let causation_canonical = self
            .causation
            .as_ref()
            .map(Causation::canonical)
            .unwrap_or_default();

        let input = hash_input(
            &self.id.to_string(),
            self.sequence,
            &self.timestamp.to_rfc3339(),
            &self.event_type,
            &self.aggregate_type,
            &self.aggregate_id.to_string(),
            self.aggregate_version,
            &payload_canonical,
            &self.actor.canonical(),
            &causation_canonical,
            &self.previous_hash,
        );
        Ok(sha256_hex(&input))
    }

    /// Recompute and compare against the stored hash (spec I7 / the
    /// `verify_chain` tamper-detection path).
    pub fn verify_hash(&self) -> Result<bool, CanonicalizeError> {
        Ok(self.compute_hash()? == self.hash)
    }

    /// The causation nonce, if this event carried one.
    pub fn command_id(&self) -> Option<Uuid> {
        self.causation.as_ref().and_then(|c| c.command_id)
    }

    pub fn correlation_id(&self) -> Option<Uuid> {
        self.causation.as_ref().and_then(|c| c.correlation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_event() -> Event {
        Event {
            id: Uuid::new_v4(),
            sequence: 1,
            aggregate_type: "Wallet".into(),
            aggregate_id: Uuid::new_v4(),
            aggregate_version: 1,
            event_type: "WalletOpened".into(),
            timestamp: Utc::now(),
            payload: json!({"initial_balance": 0}),
            actor: Actor::System { id: "core".into() },
            causation: None,
            previous_hash: super::super::canonical::GENESIS_HASH.to_string(),
            hash: String::new(),
            signature: None,
            signer_id: None,
        }
    }

    #[test]
    fn hash_is_stable_and_verifiable() {
        let mut event = sample_event();
        event.hash = event.compute_hash().unwrap();
        assert!(event.verify_hash().unwrap());
    }

    #[test]
    fn mutating_any_field_breaks_verification() {
        let mut event = sample_event();
        event.hash = event.compute_hash().unwrap();
        event.payload = json!({"initial_balance": 1});
        assert!(!event.verify_hash().unwrap());
    }

    #[test]
    fn two_events_with_identical_timestamps_still_hash_differently_by_sequence() {
        let mut a = sample_event();
        let mut b = sample_event();
        b.timestamp = a.timestamp;
        b.sequence = a.sequence + 1;
        a.hash = a.compute_hash().unwrap();
        b.hash = b.compute_hash().unwrap();
        assert_ne!(a.hash, b.hash);
    }
}
