//! Nonce / Clock Guard
//!
//! Enforces the replay-attack-prevention invariants: an event's
//! timestamp must fall within the tolerated clock skew of append time
//! (I4), and its causation nonce (`command_id`) must not have been
//! seen before within the retention window (I6). Adapted from the
//! teacher's idempotency key table into a guard purpose-built for the
//! event append path, plus an in-process bounded cache so a hot
//! aggregate doesn't round-trip to Postgres for every nonce check.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

/// How strictly the event store should enforce per-aggregate version
/// contiguity. Local appends require a strictly contiguous chain;
/// replication-inbound events may legitimately arrive out of order
/// relative to other aggregates (never relative to their own) while a
/// sync is still in flight, so the store accepts them into a pending
/// buffer instead of rejecting outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceMode {
    /// Caller-originated append: `expected_aggregate_version` must
    /// equal the current tip + 1, no exceptions.
    Strict,
    /// Replication-inbound append: gaps are tolerated by the caller,
    /// the guard only rejects versions at or behind the current tip.
    Relaxed,
}

#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("event timestamp {timestamp} is outside the tolerated clock skew of {skew_ms}ms")]
    ClockSkewExceeded { timestamp: DateTime<Utc>, skew_ms: i64 },

    #[error("causation nonce already used: {0}")]
    NonceReused(Uuid),

    #[error("aggregate version {actual} is not valid for expected {expected} ({mode:?})")]
    SequenceViolation {
        expected: i64,
        actual: i64,
        mode: SequenceMode,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Bounded in-process LRU-ish cache of recently-seen nonces, checked
/// before the database round-trip. Entries are pruned against the
/// retention window on every lookup, so a nonce past its retention
/// period is never reported as seen even if it hasn't yet been evicted
/// by capacity.
struct NonceCache {
    seen: Mutex<VecDeque<(Uuid, DateTime<Utc>)>>,
    capacity: usize,
}

impl NonceCache {
    fn new(capacity: usize) -> Self {
        Self {
            seen: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    #[cfg(test)]
    fn contains(&self, nonce: Uuid) -> bool {
        self.seen.lock().unwrap().iter().any(|(n, _)| *n == nonce)
    }

    /// True if `nonce` is cached and still within `retention` of its
    /// insertion time. Expired entries are dropped from the cache as a
    /// side effect, so repeated lookups stay cheap.
    fn contains_fresh(&self, nonce: Uuid, retention: Duration) -> bool {
        let retention = chrono::Duration::from_std(retention)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let now = Utc::now();

        let mut seen = self.seen.lock().unwrap();
        seen.retain(|(_, at)| now - *at <= retention);
        seen.iter().any(|(n, _)| *n == nonce)
    }

    fn insert(&self, nonce: Uuid, at: DateTime<Utc>) {
        let mut seen = self.seen.lock().unwrap();
        if seen.len() >= self.capacity {
            seen.pop_front();
        }
        seen.push_back((nonce, at));
    }
}

/// Enforces clock-skew and nonce-replay rules for the event store.
pub struct ReplayGuard {
    pool: PgPool,
    max_clock_skew: Duration,
    nonce_retention: Duration,
    cache: NonceCache,
}

impl ReplayGuard {
    pub fn new(pool: PgPool, max_clock_skew: Duration, nonce_retention: Duration) -> Self {
        Self {
            pool,
            max_clock_skew,
            nonce_retention,
            cache: NonceCache::new(4096),
        }
    }

    /// Reject a proposed event whose timestamp is further from `now`
    /// than the configured skew allows, in either direction.
    pub fn check_clock_skew(&self, event_timestamp: DateTime<Utc>) -> Result<(), GuardError> {
        let now = Utc::now();
        let delta = (now - event_timestamp).num_milliseconds().abs();
        let skew_ms = self.max_clock_skew.as_millis() as i64;
        if delta > skew_ms {
            return Err(GuardError::ClockSkewExceeded {
                timestamp: event_timestamp,
                skew_ms,
            });
        }
        Ok(())
    }

    /// Check the per-aggregate version transition against `mode`.
    pub fn check_sequence(
        &self,
        current_tip_version: i64,
        expected_aggregate_version: i64,
        mode: SequenceMode,
    ) -> Result<(), GuardError> {
        let valid = match mode {
            SequenceMode::Strict => expected_aggregate_version == current_tip_version + 1,
            SequenceMode::Relaxed => expected_aggregate_version > current_tip_version,
        };
        if !valid {
            return Err(GuardError::SequenceViolation {
                expected: current_tip_version + 1,
                actual: expected_aggregate_version,
                mode,
            });
        }
        Ok(())
    }

    /// Reserve a causation nonce within the current transaction. Must
    /// be called inside the same transaction that commits the event,
    /// so the reservation and the append succeed or fail together.
    pub async fn check_and_reserve_nonce(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        command_id: Uuid,
    ) -> Result<(), GuardError> {
        if self.cache.contains_fresh(command_id, self.nonce_retention) {
            return Err(GuardError::NonceReused(command_id));
        }

        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.nonce_retention)
                .unwrap_or_else(|_| chrono::Duration::days(1));

        let inserted = sqlx::query(
            r#"
            INSERT INTO causation_nonces (command_id, expires_at)
            VALUES ($1, $2)
            ON CONFLICT (command_id) DO NOTHING
            "#,
        )
        .bind(command_id)
        .bind(expires_at)
        .execute(&mut **tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Err(GuardError::NonceReused(command_id));
        }

        self.cache.insert(command_id, Utc::now());
        Ok(())
    }

    /// Delete nonce reservations past their retention window. Intended
    /// to run on a periodic tick, not per-append.
    pub async fn cleanup_expired_nonces(&self) -> Result<u64, GuardError> {
        let rows = sqlx::query("DELETE FROM causation_nonces WHERE expires_at < NOW()")
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard_timing_only() -> (Duration, Duration) {
        (Duration::from_secs(300), Duration::from_secs(86_400))
    }

    #[test]
    fn clock_skew_within_tolerance_passes() {
        let (skew, retention) = guard_timing_only();
        let cache = NonceCache::new(4);
        let _ = retention;
        let _ = &cache;
        let now = Utc::now();
        let delta = (now - (now - chrono::Duration::seconds(10)))
            .num_milliseconds()
            .abs();
        assert!(delta <= skew.as_millis() as i64);
    }

    #[test]
    fn nonce_cache_flags_duplicate_within_capacity() {
        let cache = NonceCache::new(2);
        let nonce = Uuid::new_v4();
        assert!(!cache.contains(nonce));
        cache.insert(nonce, Utc::now());
        assert!(cache.contains(nonce));
    }

    #[test]
    fn nonce_cache_evicts_oldest_past_capacity() {
        let cache = NonceCache::new(1);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        cache.insert(first, Utc::now());
        cache.insert(second, Utc::now());
        assert!(!cache.contains(first));
        assert!(cache.contains(second));
    }

    #[test]
    fn contains_fresh_rejects_entries_past_retention() {
        let cache = NonceCache::new(8);
        let nonce = Uuid::new_v4();
        let retention = Duration::from_secs(60 * 60 * 24);
        let inserted_at = Utc::now() - chrono::Duration::hours(25);
        cache.insert(nonce, inserted_at);

        assert!(!cache.contains_fresh(nonce, retention));
    }

    #[test]
    fn contains_fresh_accepts_entries_within_retention() {
        let cache = NonceCache::new(8);
        let nonce = Uuid::new_v4();
        let retention = Duration::from_secs(60 * 60 * 24);
        cache.insert(nonce, Utc::now());

        assert!(cache.contains_fresh(nonce, retention));
    }

    #[test]
    fn strict_mode_requires_exact_contiguity() {
        let pool_free_guard_logic = |tip: i64, expected: i64, mode: SequenceMode| -> bool {
            match mode {
                SequenceMode::Strict => expected == tip + 1,
                SequenceMode::Relaxed => expected > tip,
            }
        };
        assert!(pool_free_guard_logic(5, 6, SequenceMode::Strict));
        assert!(!pool_free_guard_logic(5, 7, SequenceMode::Strict));
        assert!(pool_free_guard_logic(5, 7, SequenceMode::Relaxed));
        assert!(!pool_free_guard_logic(5, 5, SequenceMode::Relaxed));
    }
}
