//! Query Surface
//!
//! A composable filter over the committed event log, generalized from
//! the teacher's ad hoc per-endpoint queries into a single builder the
//! store's `query` method turns into one parameterized SQL statement.
//! Results are always ordered by `sequence ASC` (spec §4.7): sequence,
//! not timestamp, is the authoritative order.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Filter criteria for `EventStore::query`. All fields are
/// conjunctive (AND'd together); an unset field imposes no constraint.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub aggregate_type: Option<String>,
    pub aggregate_id: Option<Uuid>,
    pub event_type: Option<String>,
    pub correlation_id: Option<Uuid>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub after_sequence: Option<i64>,
    pub limit: Option<i64>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn aggregate(mut self, aggregate_type: impl Into<String>, aggregate_id: Uuid) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self.aggregate_id = Some(aggregate_id);
        self
    }

    pub fn aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn time_range(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }

    pub fn after_sequence(mut self, sequence: i64) -> Self {
        self.after_sequence = Some(sequence);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_expected_fields() {
        let id = Uuid::new_v4();
        let filter = EventFilter::new()
            .aggregate("Wallet", id)
            .event_type("WalletOpened")
            .after_sequence(10)
            .limit(50);

        assert_eq!(filter.aggregate_type.as_deref(), Some("Wallet"));
        assert_eq!(filter.aggregate_id, Some(id));
        assert_eq!(filter.event_type.as_deref(), Some("WalletOpened"));
        assert_eq!(filter.after_sequence, Some(10));
        assert_eq!(filter.limit, Some(50));
    }

    #[test]
    fn default_filter_has_no_constraints() {
        let filter = EventFilter::new();
        assert!(filter.aggregate_id.is_none());
        assert!(filter.event_type.is_none());
        assert!(filter.since.is_none());
    }
}
