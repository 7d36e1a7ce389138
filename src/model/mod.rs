//! Core data model: events, actors, causation, vector clocks,
//! snapshots, checkpoints, federation, and the canonical hashing and
//! signing primitives they all build on.

pub mod actor;
pub mod canonical;
pub mod causation;
pub mod checkpoint;
pub mod error;
pub mod event;
pub mod federated;
pub mod signing;
pub mod snapshot;
pub mod vector_clock;

pub use actor::Actor;
pub use causation::Causation;
pub use checkpoint::{ProjectionCheckpoint, ProjectionStatus};
pub use error::CanonicalizeError;
pub use event::{Event, ProposedEvent};
pub use federated::{ConflictRecord, ConflictResolution, ConflictStrategy, FederatedEvent, Winner};
pub use signing::{Ed25519Signer, KeyRegistry, NoneSigner, Signer, SigningError};
pub use snapshot::Snapshot;
pub use vector_clock::{ClockOrdering, VectorClock};
