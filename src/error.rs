//! Crate-wide error type
//!
//! Each component keeps its own narrow error enum; `LedgerError` is the
//! boundary type for callers that cross component lines (the CLI,
//! integration tests, a future service layer), the way the teacher's
//! `AppError` wraps `DomainError`/`ConfigError` without every module
//! depending on it directly.

use crate::config::ConfigError;
use crate::event_store::EventStoreError;
use crate::guard::GuardError;
use crate::projection::ProjectionError;
use crate::rehydrate::RehydrateError;
use crate::replication::ReplicationError;
use crate::snapshot::SnapshotError;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error(transparent)]
    EventStore(#[from] EventStoreError),

    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Rehydrate(#[from] RehydrateError),

    #[error(transparent)]
    Projection(#[from] ProjectionError),

    #[error(transparent)]
    Replication(#[from] ReplicationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    /// Caller should retry without operator intervention (spec §7's
    /// transient class: contention, timeouts, unreachable peers).
    pub fn is_retryable(&self) -> bool {
        match self {
            LedgerError::EventStore(e) => e.is_retryable(),
            LedgerError::Replication(ReplicationError::PeerUnreachable(_)) => true,
            _ => false,
        }
    }

    /// Chain corruption or storage unavailability: halt writes until an
    /// operator intervenes (spec §7's fatal class).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LedgerError::EventStore(EventStoreError::ChainBroken { .. })
                | LedgerError::EventStore(EventStoreError::TamperedEvent { .. })
                | LedgerError::Snapshot(SnapshotError::TamperedState { .. })
        )
    }

    /// The process exit code this error maps to on the CLI (spec §6).
    pub fn exit_code(&self) -> i32 {
        if self.is_fatal() {
            2
        } else if self.is_retryable() {
            3
        } else if matches!(self, LedgerError::Config(_)) {
            4
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn chain_corruption_is_fatal_and_exits_2() {
        let err = LedgerError::EventStore(EventStoreError::ChainBroken {
            sequence: 5,
            expected: "a".into(),
            actual: "b".into(),
        });
        assert!(err.is_fatal());
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn peer_unreachable_is_retryable_and_exits_3() {
        let err = LedgerError::Replication(ReplicationError::PeerUnreachable("peer-b".into()));
        assert!(err.is_retryable());
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn config_error_exits_4() {
        let err = LedgerError::Config(ConfigError::MissingEnv("DATABASE_URL"));
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn concurrency_conflict_is_retryable() {
        let err = LedgerError::EventStore(EventStoreError::ConcurrencyConflict {
            aggregate_id: Uuid::nil(),
            expected: 2,
            actual: 3,
        });
        assert!(err.is_retryable());
        assert_eq!(err.exit_code(), 3);
    }
}
