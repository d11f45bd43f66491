//! Postgres-backed change log client.
//!
//! Expected schema (owned by the change-producing side, reproduced here for
//! reference):
//!
//! ```sql
//! CREATE TABLE event_log (
//!     event_id       bigint PRIMARY KEY,          -- sequence-assigned, commit order
//!     event_type     text NOT NULL,
//!     target_system  text NOT NULL,
//!     subject_entity bigint NOT NULL,
//!     dest_entity    bigint,
//!     change_params  jsonb,
//!     tstamp         timestamptz NOT NULL DEFAULT now(),
//!     taken_time     timestamptz,
//!     failed         integer NOT NULL DEFAULT 0
//! );
//! ```
//!
//! The producing side fires a `NOTIFY <target_system>, '<event_id>'` per row
//! on commit; the live path is served by [`crate::notify::PgNotificationSource`].
//!
//! Ordinary lookups and bookkeeping go through the connection pool (each
//! statement is autocommit, so the query path is never left idle in a
//! transaction). The backfill sweep deliberately does **not** use the pool:
//! every call to [`get_unprocessed_events`](ChangeLog::get_unprocessed_events)
//! opens a brand-new connection so each sweep observes freshly committed
//! state rather than any session-level cache.

use serde_json::Value as JsonValue;
use sqlx::postgres::{PgConnection, PgPool, PgRow};
use sqlx::{Connection, Row};
use tracing::instrument;

use async_trait::async_trait;

use campusidm_core::{EntityId, EventId, TargetSystem};
use campusidm_events::{EligibilityWindow, Event};

use super::store::{ChangeLog, ChangeLogError, StuckEvent, TargetStats};

const EVENT_COLUMNS: &str =
    "event_id, event_type, target_system, subject_entity, dest_entity, change_params, tstamp";

/// Postgres-backed [`ChangeLog`] client.
#[derive(Debug, Clone)]
pub struct PostgresChangeLog {
    pool: PgPool,
    /// Used to open the dedicated per-sweep connections.
    database_url: String,
}

impl PostgresChangeLog {
    pub fn new(pool: PgPool, database_url: impl Into<String>) -> Self {
        Self {
            pool,
            database_url: database_url.into(),
        }
    }
}

#[async_trait]
impl ChangeLog for PostgresChangeLog {
    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn get_event(&self, id: EventId) -> Result<Event, ChangeLogError> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM event_log WHERE event_id = $1"
        ))
        .bind(id.as_i64())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_event", e))?;

        match row {
            Some(row) => row_to_event(&row),
            None => Err(ChangeLogError::NotFound(id)),
        }
    }

    #[instrument(skip(self, window), fields(target_system = %target), err)]
    async fn get_unprocessed_events(
        &self,
        target: &TargetSystem,
        window: &EligibilityWindow,
        include_taken: bool,
    ) -> Result<Vec<Event>, ChangeLogError> {
        // Fresh connection per cycle; never reused, never from the pool.
        let mut conn = PgConnection::connect(&self.database_url)
            .await
            .map_err(|e| map_sqlx_error("sweep_connect", e))?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM event_log
            WHERE target_system = $1
              AND failed < $2
              AND (taken_time < now() - make_interval(secs => $3)
                   OR tstamp < now() - make_interval(secs => $4))
              AND ($5 OR taken_time IS NULL)
            ORDER BY event_id
            "#
        ))
        .bind(target.as_str())
        .bind(i64::from(window.fail_limit))
        .bind(window.failed_delay.as_secs_f64())
        .bind(window.unpropagated_delay.as_secs_f64())
        .bind(include_taken)
        .fetch_all(&mut conn)
        .await
        .map_err(|e| map_sqlx_error("get_unprocessed_events", e));

        let _ = conn.close().await;

        rows?.iter().map(row_to_event).collect()
    }

    #[instrument(skip(self), fields(event_id = %id, target_system = %target), err)]
    async fn lock_event(&self, id: EventId, target: &TargetSystem) -> Result<bool, ChangeLogError> {
        let row = sqlx::query(
            r#"
            UPDATE event_log
            SET taken_time = now()
            WHERE event_id = $1 AND target_system = $2 AND taken_time IS NULL
            RETURNING event_id
            "#,
        )
        .bind(id.as_i64())
        .bind(target.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("lock_event", e))?;

        Ok(row.is_some())
    }

    #[instrument(skip(self), fields(event_id = %id, target_system = %target), err)]
    async fn release_event(
        &self,
        id: EventId,
        target: &TargetSystem,
        increment: bool,
    ) -> Result<(), ChangeLogError> {
        let row = sqlx::query(
            r#"
            UPDATE event_log
            SET taken_time = NULL,
                failed = failed + CASE WHEN $3 THEN 1 ELSE 0 END
            WHERE event_id = $1 AND target_system = $2
            RETURNING event_id
            "#,
        )
        .bind(id.as_i64())
        .bind(target.as_str())
        .bind(increment)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_event", e))?;

        row.map(|_| ()).ok_or(ChangeLogError::NotFound(id))
    }

    #[instrument(skip(self), fields(event_id = %id, target_system = %target), err)]
    async fn remove_event(
        &self,
        id: EventId,
        target: &TargetSystem,
    ) -> Result<(), ChangeLogError> {
        let row = sqlx::query(
            "DELETE FROM event_log WHERE event_id = $1 AND target_system = $2 RETURNING event_id",
        )
        .bind(id.as_i64())
        .bind(target.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("remove_event", e))?;

        row.map(|_| ()).ok_or(ChangeLogError::NotFound(id))
    }

    #[instrument(skip(self), fields(target_system = %target), err)]
    async fn target_stats(
        &self,
        target: &TargetSystem,
        fail_limit: u32,
    ) -> Result<TargetStats, ChangeLogError> {
        let locked: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM event_log WHERE taken_time IS NOT NULL AND target_system = $1",
        )
        .bind(target.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("target_stats", e))?;

        let failed: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM event_log WHERE failed >= $2 AND target_system = $1",
        )
        .bind(target.as_str())
        .bind(i64::from(fail_limit))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("target_stats", e))?;

        let total: i64 =
            sqlx::query_scalar("SELECT count(*) FROM event_log WHERE target_system = $1")
                .bind(target.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("target_stats", e))?;

        Ok(TargetStats {
            locked,
            failed,
            total,
        })
    }

    #[instrument(skip(self), fields(target_system = %target), err)]
    async fn failed_and_locked_events(
        &self,
        target: &TargetSystem,
        fail_limit: u32,
    ) -> Result<Vec<StuckEvent>, ChangeLogError> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, event_type, taken_time, failed
            FROM event_log
            WHERE target_system = $1
              AND (failed >= $2 OR taken_time IS NOT NULL)
            ORDER BY event_id
            "#,
        )
        .bind(target.as_str())
        .bind(i64::from(fail_limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("failed_and_locked_events", e))?;

        rows.iter()
            .map(|row| {
                let decode = |e: sqlx::Error| ChangeLogError::Malformed(e.to_string());
                Ok(StuckEvent {
                    event_id: EventId::new(row.try_get::<i64, _>("event_id").map_err(decode)?),
                    event_type: row.try_get("event_type").map_err(decode)?,
                    taken_time: row.try_get("taken_time").map_err(decode)?,
                    failed: u32::try_from(row.try_get::<i32, _>("failed").map_err(decode)?)
                        .unwrap_or(0),
                })
            })
            .collect()
    }

    #[instrument(skip(self), fields(event_id = %id, target_system = %target), err)]
    async fn decrement_failed_count(
        &self,
        id: EventId,
        target: &TargetSystem,
    ) -> Result<(), ChangeLogError> {
        let row = sqlx::query(
            r#"
            UPDATE event_log
            SET failed = failed - 1
            WHERE event_id = $1 AND target_system = $2 AND failed > 0
            RETURNING event_id
            "#,
        )
        .bind(id.as_i64())
        .bind(target.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("decrement_failed_count", e))?;

        row.map(|_| ()).ok_or(ChangeLogError::NotFound(id))
    }
}

fn row_to_event(row: &PgRow) -> Result<Event, ChangeLogError> {
    let decode = |e: sqlx::Error| ChangeLogError::Malformed(e.to_string());

    Ok(Event {
        id: EventId::new(row.try_get::<i64, _>("event_id").map_err(decode)?),
        event_type: row.try_get::<String, _>("event_type").map_err(decode)?,
        subject_entity: EntityId::new(row.try_get::<i64, _>("subject_entity").map_err(decode)?),
        dest_entity: row
            .try_get::<Option<i64>, _>("dest_entity")
            .map_err(decode)?
            .map(EntityId::new),
        occurred_at: row.try_get("tstamp").map_err(decode)?,
        params: row
            .try_get::<Option<JsonValue>, _>("change_params")
            .map_err(decode)?
            .unwrap_or(JsonValue::Null),
    })
}

fn map_sqlx_error(operation: &str, error: sqlx::Error) -> ChangeLogError {
    match error {
        sqlx::Error::Io(e) => ChangeLogError::Connectivity(format!("{operation}: {e}")),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            ChangeLogError::Connectivity(format!("{operation}: pool unavailable"))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            ChangeLogError::Malformed(format!("{operation}: {error}"))
        }
        other => ChangeLogError::Storage(format!("{operation}: {other}")),
    }
}
