//! Federation data model: federated events and conflict records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::event::Event;
use super::vector_clock::VectorClock;

/// An event as seen by another replica: the wrapped `Event` plus the
/// metadata needed to merge it into this replica's view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederatedEvent {
    pub event: Event,
    pub source_realm: String,
    pub federated_at: DateTime<Utc>,
    pub vector_clock: VectorClock,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// The strategy used to resolve a detected write conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    LastWriteWins,
    FirstWriteWins,
    SourcePriority,
    Manual,
}

/// Which side of a conflict was kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    Local,
    Remote,
    Merged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub strategy: ConflictStrategy,
    pub winner: Winner,
    pub resolved_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged_event: Option<Event>,
}

/// A detected concurrent write on the same aggregate, created by the
/// replicator. Terminal once `resolution` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: Uuid,
    pub local_event: Event,
    pub remote_event: Event,
    pub detected_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ConflictResolution>,
}

impl ConflictRecord {
    pub fn new(local_event: Event, remote_event: Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            local_event,
            remote_event,
            detected_at: Utc::now(),
            resolution: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}
