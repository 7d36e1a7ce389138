//! Common test utilities
//!
//! Integration tests need a live Postgres with migrations applied.
//! `setup_test_db` returns `None` when `DATABASE_URL` isn't set so
//! these tests are skippable in environments without one, rather than
//! panicking the whole suite.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub async fn setup_test_db() -> Option<PgPool> {
    dotenvy::dotenv().ok();
    let database_url = std::env::var("DATABASE_URL").ok()?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("failed to connect to test database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("failed to run migrations");

    sqlx::query(
        "TRUNCATE TABLE events, snapshots, projection_checkpoints, causation_nonces, \
         replication_peers, conflict_records, federated_event_log, local_vector_clocks, \
         projection_journal CASCADE",
    )
    .execute(&pool)
    .await
    .expect("failed to truncate tables");

    Some(pool)
}
