//! Configuration
//!
//! Loads the operator surface named in spec §6 from environment
//! variables, the way the teacher's `Config::from_env` does: read,
//! fall back to a documented default, then parse.

use std::env;
use std::time::Duration;

use crate::model::ConflictStrategy;

/// Ledger-wide tunables.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub database_url: String,
    pub database_max_connections: u32,

    /// Maximum tolerated skew between `now` and an event's timestamp.
    pub max_clock_skew: Duration,
    /// How long a causation nonce is remembered before it may be reused.
    pub nonce_retention: Duration,

    pub snapshot_event_threshold: u64,
    pub snapshot_time_threshold: Duration,
    pub max_snapshots_per_aggregate: u32,

    pub sync_interval: Duration,
    pub sync_max_batch: usize,
    pub conflict_strategy: ConflictStrategy,

    pub replica_id: String,
}

impl LedgerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| ConfigError::MissingEnv("DATABASE_URL"))?;

        let database_max_connections = parse_env_or("DATABASE_MAX_CONNECTIONS", 10)?;

        let max_clock_skew =
            Duration::from_millis(parse_env_or("MAX_CLOCK_SKEW_MS", 5 * 60 * 1000)?);
        let nonce_retention =
            Duration::from_millis(parse_env_or("NONCE_RETENTION_MS", 24 * 60 * 60 * 1000)?);

        let snapshot_event_threshold = parse_env_or("SNAPSHOT_EVENT_THRESHOLD", 1000)?;
        let snapshot_time_threshold =
            Duration::from_millis(parse_env_or("SNAPSHOT_TIME_THRESHOLD_MS", 24 * 60 * 60 * 1000)?);
        let max_snapshots_per_aggregate = parse_env_or("MAX_SNAPSHOTS_PER_AGG", 3)?;

        let sync_interval = Duration::from_millis(parse_env_or("SYNC_INTERVAL_MS", 30_000)?);
        let sync_max_batch = parse_env_or("SYNC_MAX_BATCH", 1000)?;

        let conflict_strategy = match env::var("CONFLICT_STRATEGY")
            .unwrap_or_else(|_| "LastWriteWins".to_string())
            .as_str()
        {
            "LastWriteWins" => ConflictStrategy::LastWriteWins,
            "FirstWriteWins" => ConflictStrategy::FirstWriteWins,
            "SourcePriority" => ConflictStrategy::SourcePriority,
            "Manual" => ConflictStrategy::Manual,
            _ => return Err(ConfigError::InvalidValue("CONFLICT_STRATEGY")),
        };

        let replica_id = env::var("REPLICA_ID").map_err(|_| ConfigError::MissingEnv("REPLICA_ID"))?;

        Ok(Self {
            database_url,
            database_max_connections,
            max_clock_skew,
            nonce_retention,
            snapshot_event_threshold,
            snapshot_time_threshold,
            max_snapshots_per_aggregate,
            sync_interval,
            sync_max_batch,
            conflict_strategy,
            replica_id,
        })
    }
}

fn parse_env_or<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + ToString,
{
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue(key)),
        Err(_) => Ok(default),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_env_or_falls_back_to_default() {
        std::env::remove_var("LEDGER_CORE_TEST_UNSET");
        let value: u32 = parse_env_or("LEDGER_CORE_TEST_UNSET", 42).unwrap();
        assert_eq!(value, 42);
    }
}
