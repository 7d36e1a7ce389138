//! ledger-core
//!
//! An append-only, hash-chained event ledger with derived aggregate
//! state, snapshotting, replay-attack prevention, and federated
//! replication across replicas.
//!
//! - [`event_store`] — L1, the append-only log and its query surface.
//! - [`guard`] — L2, clock-skew and nonce-replay rejection.
//! - [`rehydrate`] and [`snapshot`] — L3, aggregate reconstruction.
//! - [`replication`] — L4, cross-replica sync and conflict resolution.

pub mod config;
pub mod db;
pub mod error;
pub mod event_store;
pub mod guard;
pub mod model;
pub mod projection;
pub mod rehydrate;
pub mod replication;
pub mod snapshot;

pub use config::LedgerConfig;
pub use error::{LedgerError, LedgerResult};

/// Initialize tracing the way the teacher's `init_tracing` does:
/// `RUST_LOG`-driven env filter, falling back to a crate-scoped default.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ledger_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
