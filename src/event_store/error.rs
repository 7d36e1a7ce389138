//! Event store errors

use uuid::Uuid;

use crate::guard::GuardError;
use crate::model::CanonicalizeError;

#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    #[error("concurrency conflict on aggregate {aggregate_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        aggregate_id: Uuid,
        expected: i64,
        actual: i64,
    },

    #[error("aggregate not found: {0}")]
    AggregateNotFound(Uuid),

    #[error("hash chain broken at sequence {sequence}: expected previous_hash {expected}, found {actual}")]
    ChainBroken {
        sequence: i64,
        expected: String,
        actual: String,
    },

    #[error("stored hash for event {event_id} does not match its recomputed content hash")]
    TamperedEvent { event_id: Uuid },

    #[error("maximum append retries exceeded for aggregate {0}")]
    MaxRetriesExceeded(Uuid),

    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error(transparent)]
    Canonicalize(#[from] CanonicalizeError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EventStoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EventStoreError::ConcurrencyConflict { .. })
    }
}
