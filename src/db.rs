//! Database utilities
//!
//! Connection verification and schema presence checks, the way the
//! teacher's `db::check_schema` guards startup before serving traffic.

use sqlx::PgPool;

pub async fn verify_connection(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Check that every table the ledger depends on exists, so a missing
/// migration fails fast at startup instead of on the first query.
pub async fn check_schema(pool: &PgPool) -> Result<bool, sqlx::Error> {
    let required_tables = [
        "events",
        "snapshots",
        "projection_checkpoints",
        "causation_nonces",
        "replication_peers",
        "conflict_records",
        "federated_event_log",
        "local_vector_clocks",
    ];

    for table in required_tables {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = 'public' AND table_name = $1
            )
            "#,
        )
        .bind(table)
        .fetch_one(pool)
        .await?;

        if !exists {
            tracing::error!(table, "required table does not exist");
            return Ok(false);
        }
    }

    Ok(true)
}
