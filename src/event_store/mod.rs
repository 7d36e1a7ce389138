//! Event Store module
//!
//! The append-only persistence layer: atomic per-aggregate appends
//! under optimistic concurrency control, hash-chain verification, and
//! the query surface the rest of the crate reads through.

mod error;
mod query;
mod repository;

pub use error::EventStoreError;
pub use query::EventFilter;
pub use repository::{row_to_event, ChainVerification, EventStore};
