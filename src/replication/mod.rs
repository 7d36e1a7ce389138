//! Federated Replicator
//!
//! Maintains eventual convergence across replicas keyed by a self
//! identifier: outbound sync requests, inbound conflict detection and
//! resolution, per-peer vector clocks, and Merkle-root drift
//! detection. The sync protocol and vector-clock merge logic are
//! grounded on the TAO example's `ReplicationManager`/`VectorClock`;
//! the transactional per-event apply follows the same
//! transaction-per-unit-of-work shape as the teacher's
//! `EventStore::try_append_atomic`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::event_store::{row_to_event, EventStore, EventStoreError};
use crate::model::{
    ConflictRecord, ConflictResolution, ConflictStrategy, Event, FederatedEvent, VectorClock,
    Winner,
};

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("event store error: {0}")]
    EventStore(#[from] EventStoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("peer {0} unreachable")]
    PeerUnreachable(String),
}

/// Outbound request for a peer's events after `from_version`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub id: Uuid,
    pub source_realm: String,
    pub target_realm: String,
    pub from_version: VectorClock,
    pub requested_at: DateTime<Utc>,
}

/// A peer's answer to a `SyncRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub request_id: Uuid,
    pub events: Vec<FederatedEvent>,
    pub new_version: VectorClock,
    pub has_more: bool,
    pub merkle_root: String,
}

/// A peer's current reachability, tracked so a timed-out sync doesn't
/// retry tighter than `sync_interval` allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Reachable,
    Unreachable,
}

impl PeerStatus {
    fn as_str(self) -> &'static str {
        match self {
            PeerStatus::Reachable => "reachable",
            PeerStatus::Unreachable => "unreachable",
        }
    }
}

#[derive(Clone)]
pub struct Replicator {
    pool: PgPool,
    event_store: Arc<EventStore>,
    self_id: String,
    strategy: ConflictStrategy,
    max_batch_size: i64,
}

impl Replicator {
    pub fn new(
        pool: PgPool,
        event_store: Arc<EventStore>,
        self_id: impl Into<String>,
        strategy: ConflictStrategy,
        max_batch_size: i64,
    ) -> Self {
        Self {
            pool,
            event_store,
            self_id: self_id.into(),
            strategy,
            max_batch_size,
        }
    }

    /// Build the outbound request to ask `peer` for everything past
    /// its last-known clock.
    pub async fn create_sync_request(&self, peer: &str) -> Result<SyncRequest, ReplicationError> {
        let from_version = self.peer_clock(peer).await?;
        Ok(SyncRequest {
            id: Uuid::new_v4(),
            source_realm: self.self_id.clone(),
            target_realm: peer.to_string(),
            from_version,
            requested_at: Utc::now(),
        })
    }

    /// Serve an inbound `SyncRequest` from this replica's own log:
    /// every event whose vector clock is strictly greater than
    /// `from_version` on at least one coordinate, bounded by
    /// `max_batch_size`.
    pub async fn serve_sync_request(
        &self,
        request: &SyncRequest,
    ) -> Result<SyncResponse, ReplicationError> {
        self.advance_local_clock().await?;

        let rows = sqlx::query(
            r#"
            SELECT e.id, e.sequence, e.aggregate_type, e.aggregate_id, e.aggregate_version,
                   e.event_type, e.timestamp, e.payload, e.actor, e.causation,
                   e.previous_hash, e.hash, e.signature, e.signer_id, lvc.vector_clock
            FROM events e
            JOIN local_vector_clocks lvc ON lvc.sequence = e.sequence
            ORDER BY e.sequence ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut pending: Vec<(Event, VectorClock)> = Vec::new();
        for row in &rows {
            let clock_value: Value = row.try_get("vector_clock")?;
            let clock: VectorClock = serde_json::from_value(clock_value)?;
            if clock.exceeds_on_any_coordinate(&request.from_version) {
                pending.push((row_to_event(row)?, clock));
            }
        }

        let has_more = pending.len() as i64 > self.max_batch_size;
        pending.truncate(self.max_batch_size as usize);

        let current_clock = self.latest_local_clock().await?;

        let federated_events: Vec<FederatedEvent> = pending
            .into_iter()
            .map(|(event, clock)| FederatedEvent {
                event,
                source_realm: self.self_id.clone(),
                federated_at: Utc::now(),
                vector_clock: clock,
                signature: None,
            })
            .collect();

        let merkle_root = merkle_root_of(federated_events.iter().map(|f| f.event.hash.as_str()));

        Ok(SyncResponse {
            request_id: request.id,
            events: federated_events,
            new_version: current_clock,
            has_more,
            merkle_root,
        })
    }

    /// Apply every event in a `SyncResponse` from `peer`, per spec
    /// §4.6's inbound algorithm: detect concurrency, resolve by the
    /// configured strategy, merge clocks, update peer state.
    pub async fn apply_sync_response(
        &self,
        peer: &str,
        response: &SyncResponse,
    ) -> Result<Vec<ConflictRecord>, ReplicationError> {
        let mut conflicts = Vec::new();

        for federated in &response.events {
            if self
                .already_applied(&federated.source_realm, federated.event.id)
                .await?
            {
                continue;
            }

            let local_conflict = self
                .find_concurrent_local_event(federated.event.aggregate_id, &federated.vector_clock)
                .await?;

            match local_conflict {
                Some(local_event) => {
                    let mut record =
                        ConflictRecord::new(local_event.clone(), federated.event.clone());
                    let resolution = self.resolve(&local_event, federated);
                    record.resolution = resolution.clone();

                    self.store_conflict(&record).await?;

                    if let Some(resolution) = &resolution {
                        if resolution.winner != Winner::Local {
                            self.record_remote_event(federated).await?;
                            self.merge_remote_clock(&federated.vector_clock).await?;
                        }
                    }

                    conflicts.push(record);
                }
                None => {
                    self.record_remote_event(federated).await?;
                    self.merge_remote_clock(&federated.vector_clock).await?;
                }
            }
        }

        self.update_peer_state(peer, &response.new_version, &response.merkle_root)
            .await?;

        Ok(conflicts)
    }

    /// Resolve a detected conflict by the replicator's configured
    /// strategy. `Manual` returns `None`: the conflict is recorded but
    /// left unresolved until a human calls `resolve_manually`.
    fn resolve(&self, local: &Event, remote: &FederatedEvent) -> Option<ConflictResolution> {
        let winner = match self.strategy {
            ConflictStrategy::LastWriteWins => {
                if remote.federated_at > local.timestamp {
                    Winner::Remote
                } else if remote.federated_at < local.timestamp {
                    Winner::Local
                } else {
                    tie_break_by_realm(&remote.source_realm, &self.self_id)
                }
            }
            ConflictStrategy::FirstWriteWins => {
                if remote.federated_at < local.timestamp {
                    Winner::Remote
                } else if remote.federated_at > local.timestamp {
                    Winner::Local
                } else {
                    tie_break_by_realm(&remote.source_realm, &self.self_id)
                }
            }
            ConflictStrategy::SourcePriority => Winner::Local,
            ConflictStrategy::Manual => return None,
        };

        Some(ConflictResolution {
            strategy: self.strategy,
            winner,
            resolved_at: Utc::now(),
            merged_event: None,
        })
    }

    /// Record a human's resolution of a `Manual`-strategy conflict.
    pub async fn resolve_manually(
        &self,
        conflict_id: Uuid,
        winner: Winner,
    ) -> Result<(), ReplicationError> {
        sqlx::query(
            r#"
            UPDATE conflict_records
            SET resolution_winner = $2, resolution_strategy = 'manual', resolved_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(conflict_id)
        .bind(winner_as_str(winner))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn already_applied(
        &self,
        source_realm: &str,
        event_id: Uuid,
    ) -> Result<bool, ReplicationError> {
        let row: Option<(bool,)> = sqlx::query_as(
            r#"
            SELECT TRUE FROM federated_event_log
            WHERE source_realm = $1 AND event_id = $2
            "#,
        )
        .bind(source_realm)
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// An incoming event concurrently modifies an aggregate if a
    /// local event exists for the same `aggregate_id` whose clock is
    /// neither ≤ nor ≥ the remote's.
    async fn find_concurrent_local_event(
        &self,
        aggregate_id: Uuid,
        remote_clock: &VectorClock,
    ) -> Result<Option<Event>, ReplicationError> {
        let rows = sqlx::query(
            r#"
            SELECT e.id, e.sequence, e.aggregate_type, e.aggregate_id, e.aggregate_version,
                   e.event_type, e.timestamp, e.payload, e.actor, e.causation,
                   e.previous_hash, e.hash, e.signature, e.signer_id, lvc.vector_clock
            FROM events e
            JOIN local_vector_clocks lvc ON lvc.sequence = e.sequence
            WHERE e.aggregate_id = $1
            "#,
        )
        .bind(aggregate_id)
        .fetch_all(&self.pool)
        .await?;

        for row in &rows {
            let clock_value: Value = row.try_get("vector_clock")?;
            let clock: VectorClock = serde_json::from_value(clock_value)?;
            if clock.concurrent(remote_clock) {
                return Ok(Some(row_to_event(row)?));
            }
        }
        Ok(None)
    }

    async fn record_remote_event(&self, federated: &FederatedEvent) -> Result<(), ReplicationError> {
        sqlx::query(
            r#"
            INSERT INTO federated_event_log (source_realm, event_id, federated_at, vector_clock)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (source_realm, event_id) DO NOTHING
            "#,
        )
        .bind(&federated.source_realm)
        .bind(federated.event.id)
        .bind(federated.federated_at)
        .bind(serde_json::to_value(&federated.vector_clock)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn store_conflict(&self, record: &ConflictRecord) -> Result<(), ReplicationError> {
        let resolution_winner = record.resolution.as_ref().map(|r| winner_as_str(r.winner));
        let resolution_strategy = record
            .resolution
            .as_ref()
            .map(|r| strategy_as_str(r.strategy));

        sqlx::query(
            r#"
            INSERT INTO conflict_records (
                id, local_event_id, remote_event_id, detected_at,
                resolution_winner, resolution_strategy, resolved_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.id)
        .bind(record.local_event.id)
        .bind(record.remote_event.id)
        .bind(record.detected_at)
        .bind(resolution_winner)
        .bind(resolution_strategy)
        .bind(record.resolution.as_ref().map(|r| r.resolved_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn peer_clock(&self, peer: &str) -> Result<VectorClock, ReplicationError> {
        let row: Option<(Value,)> =
            sqlx::query_as("SELECT last_known_clock FROM replication_peers WHERE peer_id = $1")
                .bind(peer)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((value,)) => Ok(serde_json::from_value(value)?),
            None => Ok(VectorClock::new()),
        }
    }

    async fn update_peer_state(
        &self,
        peer: &str,
        clock: &VectorClock,
        merkle_root: &str,
    ) -> Result<(), ReplicationError> {
        sqlx::query(
            r#"
            INSERT INTO replication_peers (peer_id, last_known_clock, last_known_merkle_root, last_synced_at, status)
            VALUES ($1, $2, $3, NOW(), $4)
            ON CONFLICT (peer_id)
            DO UPDATE SET last_known_clock = $2, last_known_merkle_root = $3, last_synced_at = NOW(), status = $4
            "#,
        )
        .bind(peer)
        .bind(serde_json::to_value(clock)?)
        .bind(merkle_root)
        .bind(PeerStatus::Reachable.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_peer_unreachable(&self, peer: &str) -> Result<(), ReplicationError> {
        sqlx::query("UPDATE replication_peers SET status = $2 WHERE peer_id = $1")
            .bind(peer)
            .bind(PeerStatus::Unreachable.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Assign a vector-clock entry to every local event committed
    /// since the last call, incrementing this replica's own
    /// coordinate once per event (spec §4.6: "on local append,
    /// increment V[self]"). Idempotent: events already recorded are
    /// skipped via the sequence-keyed table.
    async fn advance_local_clock(&self) -> Result<VectorClock, ReplicationError> {
        let mut clock = self.latest_local_clock().await?;
        let caught_up_to = self.latest_local_clock_sequence().await?;

        let new_events = self
            .event_store
            .get_events_at(Utc::now(), caught_up_to)
            .await?;

        for event in &new_events {
            clock.increment(&self.self_id);
            sqlx::query(
                r#"
                INSERT INTO local_vector_clocks (sequence, vector_clock)
                VALUES ($1, $2)
                ON CONFLICT (sequence) DO NOTHING
                "#,
            )
            .bind(event.sequence)
            .bind(serde_json::to_value(&clock)?)
            .execute(&self.pool)
            .await?;
        }

        Ok(clock)
    }

    /// Merge an accepted remote event's clock into this replica's own
    /// vector clock (spec §4.6 step 3: "insert into the local view,
    /// merge V with the remote event's clock"), so subsequent
    /// `happens_before`/`concurrent` checks against further remote
    /// events see the causality this replica has already learned.
    /// Persisted by upserting onto the latest `local_vector_clocks`
    /// row rather than a new one, since the merge doesn't correspond
    /// to a local append advancing `sequence`.
    async fn merge_remote_clock(&self, remote_clock: &VectorClock) -> Result<(), ReplicationError> {
        let current = self.latest_local_clock().await?;
        let merged = current.merge(remote_clock);
        let sequence = self.latest_local_clock_sequence().await?;

        sqlx::query(
            r#"
            INSERT INTO local_vector_clocks (sequence, vector_clock)
            VALUES ($1, $2)
            ON CONFLICT (sequence) DO UPDATE SET vector_clock = $2
            "#,
        )
        .bind(sequence)
        .bind(serde_json::to_value(&merged)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_local_clock(&self) -> Result<VectorClock, ReplicationError> {
        let row: Option<(Value,)> = sqlx::query_as(
            r#"
            SELECT vector_clock FROM local_vector_clocks
            ORDER BY sequence DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((value,)) => Ok(serde_json::from_value(value)?),
            None => Ok(VectorClock::new()),
        }
    }

    async fn latest_local_clock_sequence(&self) -> Result<i64, ReplicationError> {
        let seq: Option<i64> =
            sqlx::query_scalar("SELECT MAX(sequence) FROM local_vector_clocks")
                .fetch_one(&self.pool)
                .await?;
        Ok(seq.unwrap_or(0))
    }

    /// Bounded drift-localization: given a Merkle mismatch against a
    /// peer over `[from_sequence, to_sequence)`, binary-search the
    /// range for the smallest window whose local Merkle root still
    /// disagrees with the peer's, halving the window each probe until
    /// it narrows to a single event or `max_probes` is exhausted.
    pub async fn localize_drift(
        &self,
        from_sequence: i64,
        to_sequence: i64,
        peer_merkle_root: &str,
        max_probes: u32,
    ) -> Result<(i64, i64), ReplicationError> {
        let mut lo = from_sequence;
        let mut hi = to_sequence;

        for _ in 0..max_probes {
            if hi - lo <= 1 {
                break;
            }
            let mid = lo + (hi - lo) / 2;

            let lower_half = self.local_merkle_root(lo, mid).await?;
            if lower_half == peer_merkle_root {
                lo = mid;
            } else {
                hi = mid;
            }
        }

        Ok((lo, hi))
    }

    async fn local_merkle_root(&self, from: i64, to: i64) -> Result<String, ReplicationError> {
        let rows = sqlx::query(
            "SELECT hash FROM events WHERE sequence >= $1 AND sequence < $2 ORDER BY sequence ASC",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        let hashes: Result<Vec<String>, sqlx::Error> =
            rows.into_iter().map(|r| r.try_get("hash")).collect();
        let hashes = hashes?;
        Ok(merkle_root_of(hashes.iter().map(|h| h.as_str())))
    }
}

fn tie_break_by_realm(remote_realm: &str, local_realm: &str) -> Winner {
    if remote_realm < local_realm {
        Winner::Remote
    } else {
        Winner::Local
    }
}

fn winner_as_str(winner: Winner) -> &'static str {
    match winner {
        Winner::Local => "local",
        Winner::Remote => "remote",
        Winner::Merged => "merged",
    }
}

fn strategy_as_str(strategy: ConflictStrategy) -> &'static str {
    match strategy {
        ConflictStrategy::LastWriteWins => "last_write_wins",
        ConflictStrategy::FirstWriteWins => "first_write_wins",
        ConflictStrategy::SourcePriority => "source_priority",
        ConflictStrategy::Manual => "manual",
    }
}

/// Pairwise SHA-256 Merkle root over a commit-ordered sequence of hex
/// hashes, duplicating the odd tail at each level.
fn merkle_root_of<'a>(leaves: impl Iterator<Item = &'a str>) -> String {
    let mut level: Vec<String> = leaves.map(|s| s.to_string()).collect();

    if level.is_empty() {
        return crate::model::canonical::GENESIS_HASH.to_string();
    }

    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(level.last().unwrap().clone());
        }
        level = level
            .chunks(2)
            .map(|pair| {
                let mut hasher = Sha256::new();
                hasher.update(pair[0].as_bytes());
                hasher.update(pair[1].as_bytes());
                hex::encode(hasher.finalize())
            })
            .collect();
    }

    level.into_iter().next().unwrap()
}

/// How long to wait before retrying a replica marked `Unreachable`.
pub fn unreachable_backoff(sync_interval: Duration) -> Duration {
    sync_interval.saturating_mul(2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn merkle_root_is_stable_for_same_input() {
        let leaves = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let root1 = merkle_root_of(leaves.iter().map(|s| s.as_str()));
        let root2 = merkle_root_of(leaves.iter().map(|s| s.as_str()));
        assert_eq!(root1, root2);
    }

    #[test]
    fn merkle_root_duplicates_odd_tail() {
        let two = merkle_root_of(["a", "b"].into_iter());
        let three_with_explicit_dup = merkle_root_of(["a", "b", "b"].into_iter());
        let three_odd = merkle_root_of(["a", "b", "c"].into_iter());
        assert_ne!(two, three_with_explicit_dup);
        assert_ne!(three_with_explicit_dup, three_odd);
    }

    #[test]
    fn merkle_root_of_empty_is_genesis_sentinel() {
        let root = merkle_root_of(std::iter::empty());
        assert_eq!(root, crate::model::canonical::GENESIS_HASH);
    }

    #[test]
    fn tie_break_prefers_lexicographically_smaller_realm() {
        assert_eq!(tie_break_by_realm("alpha", "beta"), Winner::Remote);
        assert_eq!(tie_break_by_realm("zeta", "beta"), Winner::Local);
    }

    #[test]
    fn peer_status_round_trips_through_string() {
        assert_eq!(PeerStatus::Reachable.as_str(), "reachable");
        assert_eq!(PeerStatus::Unreachable.as_str(), "unreachable");
    }

    proptest! {
        #[test]
        fn merkle_root_is_deterministic_on_leaf_order(
            leaves in proptest::collection::vec("[a-z]{1,8}", 1..12)
        ) {
            let root1 = merkle_root_of(leaves.iter().map(|s| s.as_str()));
            let root2 = merkle_root_of(leaves.iter().map(|s| s.as_str()));
            prop_assert_eq!(root1, root2);
        }

        #[test]
        fn merkle_root_changes_when_any_leaf_changes(
            leaves in proptest::collection::vec("[a-z]{1,8}", 2..12),
            index in 0usize..11,
            replacement in "[a-z]{1,8}"
        ) {
            let index = index % leaves.len();
            prop_assume!(leaves[index] != replacement);

            let original = merkle_root_of(leaves.iter().map(|s| s.as_str()));

            let mut mutated = leaves.clone();
            mutated[index] = replacement;
            let changed = merkle_root_of(mutated.iter().map(|s| s.as_str()));

            prop_assert_ne!(original, changed);
        }
    }
}
