//! Projection Runner
//!
//! Drives registered read-model projections forward from the event
//! log, checkpointing after each event so a crash mid-batch resumes
//! exactly where it left off rather than re-applying or skipping an
//! event. Generalizes the teacher's `ProjectionService`, which wrote a
//! single fixed set of tables (`account_balances`, `ledger_entries`)
//! inline with its event handlers, into a `Projection` trait so
//! arbitrary read models can be registered without the runner knowing
//! their schema.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::event_store::{EventFilter, EventStore, EventStoreError};
use crate::model::{Event, ProjectionCheckpoint, ProjectionStatus};

#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("event store error: {0}")]
    EventStore(#[from] EventStoreError),

    #[error("projection handler failed: {0}")]
    Handler(String),
}

/// A registered read-model handler. `apply` runs inside the same
/// transaction as the checkpoint advance, so a handler's writes and
/// its checkpoint commit atomically — replaying the same event twice
/// after a crash is therefore impossible, not just discouraged.
#[async_trait]
pub trait Projection: Send + Sync {
    fn name(&self) -> &str;

    async fn apply(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &Event,
    ) -> Result<(), ProjectionError>;

    /// Drop this projection's read-model state so it can be rebuilt
    /// from sequence zero. Default is a no-op; projections backed by
    /// their own tables should `TRUNCATE` them here.
    async fn reset(&self, _tx: &mut Transaction<'_, Postgres>) -> Result<(), ProjectionError> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct ProjectionRunner {
    pool: PgPool,
    event_store: Arc<EventStore>,
    projections: Vec<Arc<dyn Projection>>,
    batch_size: i64,
}

impl ProjectionRunner {
    pub fn new(pool: PgPool, event_store: Arc<EventStore>) -> Self {
        Self {
            pool,
            event_store,
            projections: Vec::new(),
            batch_size: 500,
        }
    }

    pub fn register(&mut self, projection: Arc<dyn Projection>) {
        self.projections.push(projection);
    }

    /// Advance every registered projection by one batch of events
    /// past its checkpoint. A handler failure marks that projection
    /// `Error` and moves on to the others (per-projection failure
    /// isolation) rather than aborting the whole run.
    pub async fn run_once(&self) -> Result<(), ProjectionError> {
        for projection in &self.projections {
            if let Err(e) = self.advance(projection.as_ref()).await {
                tracing::error!(
                    projection = projection.name(),
                    error = %e,
                    "projection failed, marking Error and continuing"
                );
                self.mark_error(projection.name(), &e.to_string()).await?;
            }
        }
        Ok(())
    }

    async fn advance(&self, projection: &dyn Projection) -> Result<(), ProjectionError> {
        let checkpoint = self.load_or_create_checkpoint(projection.name()).await?;
        if checkpoint.status == ProjectionStatus::Paused {
            return Ok(());
        }

        let filter = EventFilter::new()
            .after_sequence(checkpoint.last_sequence)
            .limit(self.batch_size);
        let events = self.event_store.query(&filter).await?;

        for event in &events {
            let mut tx = self.pool.begin().await?;
            projection
                .apply(&mut tx, event)
                .await
                .map_err(|e| ProjectionError::Handler(e.to_string()))?;
            self.advance_checkpoint(&mut tx, projection.name(), event.sequence)
                .await?;
            tx.commit().await?;
        }

        Ok(())
    }

    /// Truncate a projection's state and reset its checkpoint to zero,
    /// so the next `run_once` rebuilds it from the start of the log.
    pub async fn rebuild(&self, projection: &dyn Projection) -> Result<(), ProjectionError> {
        let mut tx = self.pool.begin().await?;
        projection.reset(&mut tx).await?;
        sqlx::query(
            r#"
            INSERT INTO projection_checkpoints (projection_name, last_sequence, status, error_message)
            VALUES ($1, 0, 'rebuilding', NULL)
            ON CONFLICT (projection_name)
            DO UPDATE SET last_sequence = 0, status = 'rebuilding', error_message = NULL
            "#,
        )
        .bind(projection.name())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn load_or_create_checkpoint(
        &self,
        name: &str,
    ) -> Result<ProjectionCheckpoint, ProjectionError> {
        let row = sqlx::query(
            r#"
            SELECT projection_name, last_sequence, status, error_message
            FROM projection_checkpoints
            WHERE projection_name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            let status: String = row.try_get("status")?;
            return Ok(ProjectionCheckpoint {
                projection_name: row.try_get("projection_name")?,
                last_sequence: row.try_get("last_sequence")?,
                status: ProjectionStatus::from(status.as_str()),
                error_message: row.try_get("error_message")?,
            });
        }

        let checkpoint = ProjectionCheckpoint::new(name);
        sqlx::query(
            r#"
            INSERT INTO projection_checkpoints (projection_name, last_sequence, status)
            VALUES ($1, 0, 'running')
            ON CONFLICT (projection_name) DO NOTHING
            "#,
        )
        .bind(name)
        .execute(&self.pool)
        .await?;

        Ok(checkpoint)
    }

    async fn advance_checkpoint(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        name: &str,
        sequence: i64,
    ) -> Result<(), ProjectionError> {
        sqlx::query(
            r#"
            UPDATE projection_checkpoints
            SET last_sequence = $2, status = 'running', error_message = NULL
            WHERE projection_name = $1
            "#,
        )
        .bind(name)
        .bind(sequence)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn mark_error(&self, name: &str, message: &str) -> Result<(), ProjectionError> {
        sqlx::query(
            r#"
            UPDATE projection_checkpoints
            SET status = 'error', error_message = $2
            WHERE projection_name = $1
            "#,
        )
        .bind(name)
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopProjection;

    #[async_trait]
    impl Projection for NoopProjection {
        fn name(&self) -> &str {
            "noop"
        }

        async fn apply(
            &self,
            _tx: &mut Transaction<'_, Postgres>,
            _event: &Event,
        ) -> Result<(), ProjectionError> {
            Ok(())
        }
    }

    #[test]
    fn projection_name_is_stable() {
        let projection = NoopProjection;
        assert_eq!(projection.name(), "noop");
    }
}
