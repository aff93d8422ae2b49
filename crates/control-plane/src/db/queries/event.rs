//! Event log queries.
//!
//! The append path is a compare-and-set on `(execution_id, seq)`: the caller
//! names the seq it expects to write, and a unique-key violation means
//! another writer appended first. That violation is returned as
//! [`AppendOutcome::Conflict`], never as an error.

use chrono::{DateTime, Utc};

use crate::db::models::event::{AppendOutcome, Event, NewEvent};
use crate::db::DbPool;
use crate::error::AppResult;

/// Postgres error code for unique-key violations.
const UNIQUE_VIOLATION: &str = "23505";

/// Append an event at `expected_seq`.
pub async fn append(
    pool: &DbPool,
    execution_id: i64,
    expected_seq: i64,
    event: &NewEvent,
) -> AppResult<AppendOutcome> {
    let result = sqlx::query(
        r#"
        INSERT INTO noetl.event (
            execution_id, seq, kind, step_name, attempt, loop_index, payload, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(execution_id)
    .bind(expected_seq)
    .bind(event.kind.as_str())
    .bind(&event.step_name)
    .bind(event.attempt)
    .bind(event.loop_index)
    .bind(&event.payload)
    .bind(Utc::now())
    .execute(pool)
    .await;

    match result {
        Ok(_) => Ok(AppendOutcome::Ok { seq: expected_seq }),
        Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) => {
            let current_seq = last_seq(pool, execution_id).await?;
            Ok(AppendOutcome::Conflict { current_seq })
        }
        Err(e) => Err(e.into()),
    }
}

/// Highest seq written for an execution, or -1 when the log is empty.
pub async fn last_seq(pool: &DbPool, execution_id: i64) -> AppResult<i64> {
    let row: (Option<i64>,) =
        sqlx::query_as("SELECT MAX(seq) FROM noetl.event WHERE execution_id = $1")
            .bind(execution_id)
            .fetch_one(pool)
            .await?;

    Ok(row.0.unwrap_or(-1))
}

/// Read events for an execution from `from_seq` onward, in seq order.
pub async fn read_since(pool: &DbPool, execution_id: i64, from_seq: i64) -> AppResult<Vec<Event>> {
    let events = sqlx::query_as::<_, Event>(
        r#"
        SELECT execution_id, seq, kind, step_name, attempt, loop_index, payload, created_at
        FROM noetl.event
        WHERE execution_id = $1 AND seq >= $2
        ORDER BY seq ASC
        "#,
    )
    .bind(execution_id)
    .bind(from_seq)
    .fetch_all(pool)
    .await?;

    Ok(events)
}

/// Read the full log for an execution.
pub async fn read_all(pool: &DbPool, execution_id: i64) -> AppResult<Vec<Event>> {
    read_since(pool, execution_id, 0).await
}

/// Executions with no terminal event.
pub async fn list_live_executions(pool: &DbPool) -> AppResult<Vec<i64>> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        r#"
        SELECT DISTINCT e.execution_id
        FROM noetl.event e
        WHERE NOT EXISTS (
            SELECT 1 FROM noetl.event t
            WHERE t.execution_id = e.execution_id
              AND t.kind IN ('execution_completed', 'execution_failed', 'execution_cancelled')
        )
        ORDER BY e.execution_id
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Executions started from a playbook path, newest first.
pub async fn list_executions_by_path(
    pool: &DbPool,
    path: Option<&str>,
    limit: i64,
) -> AppResult<Vec<(i64, DateTime<Utc>)>> {
    let rows: Vec<(i64, DateTime<Utc>)> = sqlx::query_as(
        r#"
        SELECT execution_id, created_at
        FROM noetl.event
        WHERE kind = 'execution_started'
          AND ($1::TEXT IS NULL OR payload->>'path' = $1)
        ORDER BY created_at DESC
        LIMIT $2
        "#,
    )
    .bind(path)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Whether an execution has any events at all.
pub async fn exists(pool: &DbPool, execution_id: i64) -> AppResult<bool> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT 1 FROM noetl.event WHERE execution_id = $1 LIMIT 1")
            .bind(execution_id)
            .fetch_optional(pool)
            .await?;

    Ok(row.is_some())
}

/// Generate a snowflake ID for a new execution.
pub async fn next_execution_id(pool: &DbPool) -> AppResult<i64> {
    let row: (i64,) = sqlx::query_as("SELECT noetl.snowflake_id()")
        .fetch_one(pool)
        .await?;

    Ok(row.0)
}
