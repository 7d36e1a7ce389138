//! Event Store Repository
//!
//! Append-only persistence for the event log: atomic per-aggregate
//! appends under optimistic concurrency control, hash-chain assembly,
//! and the read paths the query surface and rehydrator build on.
//! Concurrency control follows the teacher's `append_atomic` retry
//! loop; `FOR UPDATE` on the aggregate's current tip row takes the
//! place of the teacher's separate idempotency-table gate, since here
//! the per-aggregate serialization point *is* the tip row itself.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::guard::{GuardError, ReplayGuard, SequenceMode};
use crate::model::canonical::GENESIS_HASH;
use crate::model::{Actor, Causation, Event, ProposedEvent};

use super::query::EventFilter;
use super::EventStoreError;

const MAX_APPEND_RETRIES: u32 = 5;

#[derive(Clone)]
pub struct EventStore {
    pool: PgPool,
    guard: std::sync::Arc<ReplayGuard>,
}

impl EventStore {
    pub fn new(pool: PgPool, guard: std::sync::Arc<ReplayGuard>) -> Self {
        Self { pool, guard }
    }

    /// Append a single proposed event, retrying on concurrency
    /// conflicts with exponential backoff (spec §5's bounded-retry
    /// resource rule).
    pub async fn append(
        &self,
        proposed: ProposedEvent,
        mode: SequenceMode,
    ) -> Result<Event, EventStoreError> {
        for attempt in 0..MAX_APPEND_RETRIES {
            match self.try_append(&proposed, mode).await {
                Ok(event) => return Ok(event),
                Err(EventStoreError::ConcurrencyConflict { .. })
                    if attempt + 1 < MAX_APPEND_RETRIES =>
                {
                    let delay = Duration::from_millis(20 * 2u64.pow(attempt));
                    tracing::warn!(
                        aggregate_id = %proposed.aggregate_id,
                        attempt,
                        "concurrency conflict appending event, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Err(EventStoreError::MaxRetriesExceeded(proposed.aggregate_id))
    }

    async fn try_append(
        &self,
        proposed: &ProposedEvent,
        mode: SequenceMode,
    ) -> Result<Event, EventStoreError> {
        self.guard.check_clock_skew(proposed.timestamp)?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        let aggregate_version: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT aggregate_version FROM events
            WHERE aggregate_id = $1
            ORDER BY aggregate_version DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(proposed.aggregate_id)
        .fetch_optional(&mut *tx)
        .await?;

        let current_version = aggregate_version.unwrap_or(0);

        self.guard
            .check_sequence(current_version, proposed.expected_aggregate_version, mode)
            .map_err(|e| match e {
                GuardError::SequenceViolation {
                    expected, actual, ..
                } => EventStoreError::ConcurrencyConflict {
                    aggregate_id: proposed.aggregate_id,
                    expected,
                    actual,
                },
                other => EventStoreError::Guard(other),
            })?;

        if let Some(command_id) = proposed.causation.as_ref().and_then(|c| c.command_id) {
            self.guard.check_and_reserve_nonce(&mut tx, command_id).await?;
        }

        // The global tip, not the aggregate's own tip: `previous_hash`
        // links into the single store-wide chain (spec I2/§4.1 step 5),
        // so every aggregate's events interleave into one sequence.
        let global_tip: Option<(i64, String)> = sqlx::query_as(
            r#"
            SELECT sequence, hash FROM events
            ORDER BY sequence DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let (last_sequence, previous_hash) =
            global_tip.unwrap_or_else(|| (0, GENESIS_HASH.to_string()));
        let next_sequence = last_sequence + 1;

        let mut event = Event {
            id: Uuid::new_v4(),
            sequence: next_sequence,
            aggregate_type: proposed.aggregate_type.clone(),
            aggregate_id: proposed.aggregate_id,
            aggregate_version: proposed.expected_aggregate_version,
            event_type: proposed.event_type.clone(),
            timestamp: proposed.timestamp,
            payload: proposed.payload.clone(),
            actor: proposed.actor.clone(),
            causation: proposed.causation.clone(),
            previous_hash,
            hash: String::new(),
            signature: proposed.signature.clone(),
            signer_id: proposed.signer_id.clone(),
        };
        event.hash = event.compute_hash()?;

        insert_event(&mut tx, &event).await?;

        tx.commit().await?;

        tracing::info!(
            event_id = %event.id,
            aggregate_id = %event.aggregate_id,
            sequence = event.sequence,
            "event appended"
        );

        Ok(event)
    }

    /// Current version and content hash of an aggregate's tip, or the
    /// genesis sentinel if it has no events yet.
    pub async fn tip(&self, aggregate_id: Uuid) -> Result<(i64, String), EventStoreError> {
        let row: Option<(i64, String)> = sqlx::query_as(
            r#"
            SELECT aggregate_version, hash FROM events
            WHERE aggregate_id = $1
            ORDER BY aggregate_version DESC
            LIMIT 1
            "#,
        )
        .bind(aggregate_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.unwrap_or_else(|| (0, GENESIS_HASH.to_string())))
    }

    pub async fn count(&self) -> Result<i64, EventStoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// All events for one aggregate, in sequence order, optionally
    /// bounded to a version ceiling (used by the rehydrator to replay
    /// as-of a point in time).
    pub async fn get_events_for_aggregate(
        &self,
        aggregate_id: Uuid,
        after_version: i64,
        up_to_version: Option<i64>,
    ) -> Result<Vec<Event>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, sequence, aggregate_type, aggregate_id, aggregate_version,
                   event_type, timestamp, payload, actor, causation,
                   previous_hash, hash, signature, signer_id
            FROM events
            WHERE aggregate_id = $1
              AND aggregate_version > $2
              AND ($3::bigint IS NULL OR aggregate_version <= $3)
            ORDER BY aggregate_version ASC
            "#,
        )
        .bind(aggregate_id)
        .bind(after_version)
        .bind(up_to_version)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_event).collect()
    }

    /// Composable query over the full log, ordered by `sequence ASC`
    /// (spec §4.7).
    pub async fn query(&self, filter: &EventFilter) -> Result<Vec<Event>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, sequence, aggregate_type, aggregate_id, aggregate_version,
                   event_type, timestamp, payload, actor, causation,
                   previous_hash, hash, signature, signer_id
            FROM events
            WHERE ($1::text IS NULL OR aggregate_type = $1)
              AND ($2::uuid IS NULL OR aggregate_id = $2)
              AND ($3::text IS NULL OR event_type = $3)
              AND ($4::uuid IS NULL OR (causation->>'correlation_id')::uuid = $4)
              AND ($5::timestamptz IS NULL OR timestamp >= $5)
              AND ($6::timestamptz IS NULL OR timestamp <= $6)
              AND ($7::bigint IS NULL OR sequence > $7)
            ORDER BY sequence ASC
            LIMIT $8
            "#,
        )
        .bind(&filter.aggregate_type)
        .bind(filter.aggregate_id)
        .bind(&filter.event_type)
        .bind(filter.correlation_id)
        .bind(filter.since)
        .bind(filter.until)
        .bind(filter.after_sequence)
        .bind(filter.limit.unwrap_or(1000))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_event).collect()
    }

    /// All events at or before a given moment in time, across the
    /// whole log, sequence-ordered (used by point-in-time rehydration
    /// and Merkle drift checks).
    pub async fn get_events_at(
        &self,
        as_of: DateTime<Utc>,
        after_sequence: i64,
    ) -> Result<Vec<Event>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, sequence, aggregate_type, aggregate_id, aggregate_version,
                   event_type, timestamp, payload, actor, causation,
                   previous_hash, hash, signature, signer_id
            FROM events
            WHERE timestamp <= $1 AND sequence > $2
            ORDER BY sequence ASC
            "#,
        )
        .bind(as_of)
        .bind(after_sequence)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_event).collect()
    }

    /// Walk the whole chain (or one aggregate's slice of it) in
    /// sequence order, verifying each event's `previous_hash` linkage
    /// and content hash (spec I7). Mirrors the teacher's
    /// `verify_hash_chain`, generalized from a fixed audit-log schema
    /// to the full event model.
    pub async fn verify_chain(
        &self,
        aggregate_id: Option<Uuid>,
    ) -> Result<ChainVerification, EventStoreError> {
        let rows = match aggregate_id {
            Some(id) => {
                sqlx::query(
                    r#"
                    SELECT id, sequence, aggregate_type, aggregate_id, aggregate_version,
                           event_type, timestamp, payload, actor, causation,
                           previous_hash, hash, signature, signer_id
                    FROM events
                    WHERE aggregate_id = $1
                    ORDER BY aggregate_version ASC
                    "#,
                )
                .bind(id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT id, sequence, aggregate_type, aggregate_id, aggregate_version,
                           event_type, timestamp, payload, actor, causation,
                           previous_hash, hash, signature, signer_id
                    FROM events
                    ORDER BY sequence ASC
                    "#,
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut expected_previous = GENESIS_HASH.to_string();
        let mut checked = 0u64;

        for row in &rows {
            let event = row_to_event(row)?;

            // Linkage is a property of the global chain: consecutive
            // events within one aggregate are not adjacent in it, so
            // an aggregate-scoped walk only recomputes content hashes.
            if aggregate_id.is_none() && event.previous_hash != expected_previous {
                return Ok(ChainVerification {
                    is_valid: false,
                    events_checked: checked,
                    first_broken_event: Some(event.id),
                    broken_at_sequence: Some(event.sequence),
                    detail: Some(format!(
                        "previous_hash mismatch at sequence {}: expected {}, found {}",
                        event.sequence, expected_previous, event.previous_hash
                    )),
                });
            }

            if !event.verify_hash()? {
                return Ok(ChainVerification {
                    is_valid: false,
                    events_checked: checked,
                    first_broken_event: Some(event.id),
                    broken_at_sequence: Some(event.sequence),
                    detail: Some("stored hash does not match recomputed content hash".into()),
                });
            }

            expected_previous = event.hash.clone();
            checked += 1;
        }

        Ok(ChainVerification {
            is_valid: true,
            events_checked: checked,
            first_broken_event: None,
            broken_at_sequence: None,
            detail: None,
        })
    }
}

/// Result of a hash-chain walk.
#[derive(Debug, Clone)]
pub struct ChainVerification {
    pub is_valid: bool,
    pub events_checked: u64,
    pub first_broken_event: Option<Uuid>,
    pub broken_at_sequence: Option<i64>,
    pub detail: Option<String>,
}

async fn insert_event(
    tx: &mut Transaction<'_, Postgres>,
    event: &Event,
) -> Result<(), EventStoreError> {
    let actor_json = serde_json::to_value(&event.actor)?;
    let causation_json = event
        .causation
        .as_ref()
        .map(serde_json::to_value)
        .transpose()?;

    sqlx::query(
        r#"
        INSERT INTO events (
            id, sequence, aggregate_type, aggregate_id, aggregate_version,
            event_type, timestamp, payload, actor, causation,
            previous_hash, hash, signature, signer_id
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        "#,
    )
    .bind(event.id)
    .bind(event.sequence)
    .bind(&event.aggregate_type)
    .bind(event.aggregate_id)
    .bind(event.aggregate_version)
    .bind(&event.event_type)
    .bind(event.timestamp)
    .bind(&event.payload)
    .bind(actor_json)
    .bind(causation_json)
    .bind(&event.previous_hash)
    .bind(&event.hash)
    .bind(&event.signature)
    .bind(&event.signer_id)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

pub(crate) fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<Event, EventStoreError> {
    let actor_json: Value = row.try_get("actor")?;
    let actor: Actor = serde_json::from_value(actor_json)?;

    let causation_json: Option<Value> = row.try_get("causation")?;
    let causation: Option<Causation> = causation_json.map(serde_json::from_value).transpose()?;

    Ok(Event {
        id: row.try_get("id")?,
        sequence: row.try_get("sequence")?,
        aggregate_type: row.try_get("aggregate_type")?,
        aggregate_id: row.try_get("aggregate_id")?,
        aggregate_version: row.try_get("aggregate_version")?,
        event_type: row.try_get("event_type")?,
        timestamp: row.try_get("timestamp")?,
        payload: row.try_get("payload")?,
        actor,
        causation,
        previous_hash: row.try_get("previous_hash")?,
        hash: row.try_get("hash")?,
        signature: row.try_get("signature")?,
        signer_id: row.try_get("signer_id")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_verification_reports_validity() {
        let ok = ChainVerification {
            is_valid: true,
            events_checked: 10,
            first_broken_event: None,
            broken_at_sequence: None,
            detail: None,
        };
        assert!(ok.is_valid);
        assert_eq!(ok.events_checked, 10);
    }
}
