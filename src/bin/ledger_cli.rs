//! Thin operational CLI over the ledger library (spec §6). Not a
//! product surface — a demonstration of `append`/`query`/
//! `verify-chain`/`snapshot-now`/`rebuild-projection`/`sync-now`
//! against a live database, the way the teacher's `src/bin/load_test.rs`
//! exercises its API directly rather than through HTTP.

use std::process::ExitCode;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use ledger_core::error::{LedgerError, LedgerResult};
use ledger_core::event_store::{EventFilter, EventStore};
use ledger_core::guard::{ReplayGuard, SequenceMode};
use ledger_core::model::{Actor, Causation, Event, ProposedEvent};
use ledger_core::projection::{Projection, ProjectionError, ProjectionRunner};
use ledger_core::rehydrate::{Reducer, Rehydrator};
use ledger_core::replication::Replicator;
use ledger_core::snapshot::{SnapshotManager, SnapshotPolicy, SnapshotStore};
use ledger_core::LedgerConfig;

#[derive(Parser)]
#[command(name = "ledger-cli", about = "Thin operational CLI over ledger-core")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Append a single event.
    Append {
        #[arg(long)]
        aggregate_type: String,
        #[arg(long)]
        aggregate_id: Uuid,
        #[arg(long)]
        expected_version: i64,
        #[arg(long)]
        event_type: String,
        /// JSON payload, e.g. '{"amount": 10}'.
        #[arg(long)]
        payload: String,
        #[arg(long)]
        command_id: Option<Uuid>,
    },
    /// Query the log by aggregate, type, or time range.
    Query {
        #[arg(long)]
        aggregate_id: Option<Uuid>,
        #[arg(long)]
        aggregate_type: Option<String>,
        #[arg(long)]
        event_type: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },
    /// Walk the hash chain and report whether it's intact.
    VerifyChain {
        #[arg(long)]
        aggregate_id: Option<Uuid>,
    },
    /// Snapshot the demo generic reducer's state for one aggregate.
    SnapshotNow {
        #[arg(long)]
        aggregate_id: Uuid,
    },
    /// Rebuild the demo journal-mirror projection from sequence zero.
    RebuildProjection,
    /// Run one local sync round against a named peer.
    SyncNow {
        #[arg(long)]
        peer: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    ledger_core::init_tracing();
    dotenvy::dotenv().ok();

    match run().await {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            eprintln!("{e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run() -> LedgerResult<()> {
    let cli = Cli::parse();
    let config = LedgerConfig::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;

    if !ledger_core::db::check_schema(&pool).await? {
        eprintln!("database schema incomplete; run the migrations under migrations/ first");
        return Err(LedgerError::Config(ledger_core::config::ConfigError::InvalidValue(
            "DATABASE_URL",
        )));
    }

    let guard = Arc::new(ReplayGuard::new(
        pool.clone(),
        config.max_clock_skew,
        config.nonce_retention,
    ));
    let store = Arc::new(EventStore::new(pool.clone(), guard));

    match cli.command {
        Command::Append {
            aggregate_type,
            aggregate_id,
            expected_version,
            event_type,
            payload,
            command_id,
        } => append(&store, aggregate_type, aggregate_id, expected_version, event_type, payload, command_id).await,
        Command::Query {
            aggregate_id,
            aggregate_type,
            event_type,
            limit,
        } => query(&store, aggregate_id, aggregate_type, event_type, limit).await,
        Command::VerifyChain { aggregate_id } => verify_chain(&store, aggregate_id).await,
        Command::SnapshotNow { aggregate_id } => snapshot_now(&store, &pool, &config, aggregate_id).await,
        Command::RebuildProjection => rebuild_projection(pool, store).await,
        Command::SyncNow { peer } => sync_now(pool, store, &config, peer).await,
    }
}

async fn append(
    store: &EventStore,
    aggregate_type: String,
    aggregate_id: Uuid,
    expected_version: i64,
    event_type: String,
    payload: String,
    command_id: Option<Uuid>,
) -> LedgerResult<()> {
    let payload: Value = serde_json::from_str(&payload)?;

    let mut proposed = ProposedEvent::new(
        event_type,
        aggregate_type,
        aggregate_id,
        expected_version,
        payload,
        Actor::System { id: "ledger-cli".into() },
    );
    if let Some(command_id) = command_id {
        proposed = proposed.with_causation(Causation::new().with_command_id(command_id));
    }

    let event = store.append(proposed, SequenceMode::Strict).await?;
    println!(
        "appended event {} (sequence {}, version {})",
        event.id, event.sequence, event.aggregate_version
    );
    Ok(())
}

async fn query(
    store: &EventStore,
    aggregate_id: Option<Uuid>,
    aggregate_type: Option<String>,
    event_type: Option<String>,
    limit: i64,
) -> LedgerResult<()> {
    let mut filter = EventFilter::new().limit(limit);
    filter.aggregate_id = aggregate_id;
    if let Some(t) = aggregate_type {
        filter = filter.aggregate_type(t);
    }
    if let Some(t) = event_type {
        filter = filter.event_type(t);
    }

    let events = store.query(&filter).await?;
    for event in &events {
        println!(
            "{}\t{}\t{}/{}\tv{}\t{}",
            event.sequence, event.event_type, event.aggregate_type, event.aggregate_id,
            event.aggregate_version, event.timestamp
        );
    }
    println!("{} event(s)", events.len());
    Ok(())
}

async fn verify_chain(store: &EventStore, aggregate_id: Option<Uuid>) -> LedgerResult<()> {
    let result = store.verify_chain(aggregate_id).await?;
    println!(
        "valid={} checked={} broken_at_sequence={:?} reason={:?}",
        result.is_valid, result.events_checked, result.broken_at_sequence, result.detail
    );
    if !result.is_valid {
        return Err(LedgerError::EventStore(
            ledger_core::event_store::EventStoreError::ChainBroken {
                sequence: result.broken_at_sequence.unwrap_or(result.events_checked as i64),
                expected: result.detail.clone().unwrap_or_default(),
                actual: String::new(),
            },
        ));
    }
    Ok(())
}

/// A demo reducer that keeps only the most recent event's payload,
/// standing in for a caller-supplied domain reducer so `snapshot-now`
/// has something concrete to exercise.
#[derive(Default, Serialize, Deserialize)]
struct LatestPayload {
    payload: Value,
}

impl Reducer for LatestPayload {
    fn aggregate_type() -> &'static str {
        "generic"
    }

    fn apply(mut self, event: &Event) -> Self {
        self.payload = event.payload.clone();
        self
    }
}

async fn snapshot_now(
    store: &EventStore,
    pool: &sqlx::PgPool,
    config: &LedgerConfig,
    aggregate_id: Uuid,
) -> LedgerResult<()> {
    let snapshots = SnapshotStore::new(pool.clone());
    let rehydrator = Rehydrator::new(store, &snapshots);

    let rehydrated = rehydrator.load::<LatestPayload>(aggregate_id).await?;
    let Some(rehydrated) = rehydrated else {
        println!("no events for aggregate {aggregate_id}");
        return Ok(());
    };

    let manager = SnapshotManager::new(
        snapshots,
        SnapshotPolicy {
            event_threshold: config.snapshot_event_threshold,
            time_threshold: config.snapshot_time_threshold,
            max_per_aggregate: config.max_snapshots_per_aggregate,
        },
    );

    manager
        .maybe_snapshot(
            aggregate_id,
            &rehydrated.state,
            rehydrated.version,
            rehydrated.sequence,
            rehydrated.events_since_snapshot,
            rehydrated.snapshot_age,
        )
        .await?;

    println!(
        "snapshotted aggregate {aggregate_id} at version {}",
        rehydrated.version
    );
    Ok(())
}

/// Demo projection: mirrors every event's identifying fields into
/// `projection_journal`, so `rebuild-projection` has a concrete table
/// to truncate and refill.
struct JournalProjection;

#[async_trait]
impl Projection for JournalProjection {
    fn name(&self) -> &str {
        "journal_mirror"
    }

    async fn apply(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &Event,
    ) -> Result<(), ProjectionError> {
        sqlx::query(
            r#"
            INSERT INTO projection_journal (event_id, sequence, aggregate_type, aggregate_id, event_type)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event.id)
        .bind(event.sequence)
        .bind(&event.aggregate_type)
        .bind(event.aggregate_id)
        .bind(&event.event_type)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn reset(&self, tx: &mut Transaction<'_, Postgres>) -> Result<(), ProjectionError> {
        sqlx::query("TRUNCATE projection_journal")
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

async fn rebuild_projection(pool: sqlx::PgPool, store: Arc<EventStore>) -> LedgerResult<()> {
    let mut runner = ProjectionRunner::new(pool, store);
    let projection = Arc::new(JournalProjection);
    runner.register(projection.clone());
    runner.rebuild(projection.as_ref()).await?;
    runner.run_once().await?;
    println!("rebuilt projection journal_mirror");
    Ok(())
}

async fn sync_now(
    pool: sqlx::PgPool,
    store: Arc<EventStore>,
    config: &LedgerConfig,
    peer: String,
) -> LedgerResult<()> {
    let replicator = Replicator::new(
        pool,
        store,
        config.replica_id.clone(),
        config.conflict_strategy,
        config.sync_max_batch as i64,
    );

    let request = replicator.create_sync_request(&peer).await?;
    let response = replicator.serve_sync_request(&request).await?;
    let conflicts = replicator.apply_sync_response(&peer, &response).await?;

    println!(
        "synced with {peer}: {} event(s), {} conflict(s), has_more={}",
        response.events.len(),
        conflicts.len(),
        response.has_more
    );
    Ok(())
}
