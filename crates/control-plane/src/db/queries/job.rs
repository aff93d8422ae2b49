//! Job queue queries.
//!
//! The queue is a Postgres table leased with `FOR UPDATE SKIP LOCKED`;
//! delivery is at-least-once and the job key is the idempotency guard.

use chrono::{DateTime, Duration, Utc};

use crate::db::models::job::{Job, JobKey};
use crate::db::DbPool;
use crate::error::AppResult;

const JOB_COLUMNS: &str = "execution_id, step_name, attempt, loop_index, capability_tag, \
     tool_kind, tool_spec, context, save, timeout_seconds, not_before, \
     status, leased_by, lease_deadline, created_at";

/// Fields of a job to enqueue, everything template-expanded.
#[derive(Debug, Clone)]
pub struct EnqueueJob {
    pub key: JobKey,
    pub capability_tag: String,
    pub tool_kind: String,
    pub tool_spec: serde_json::Value,
    pub context: serde_json::Value,
    pub save: Option<serde_json::Value>,
    pub timeout_seconds: Option<i64>,
    pub not_before: Option<DateTime<Utc>>,
}

/// Enqueue a job. Returns false when the key already exists (no-op).
pub async fn enqueue(pool: &DbPool, job: &EnqueueJob) -> AppResult<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO noetl.job (
            execution_id, step_name, attempt, loop_index, capability_tag,
            tool_kind, tool_spec, context, save, timeout_seconds, not_before
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (execution_id, step_name, attempt, loop_index) DO NOTHING
        "#,
    )
    .bind(job.key.execution_id)
    .bind(&job.key.step_name)
    .bind(job.key.attempt)
    .bind(job.key.loop_index_sql())
    .bind(&job.capability_tag)
    .bind(&job.tool_kind)
    .bind(&job.tool_spec)
    .bind(&job.context)
    .bind(&job.save)
    .bind(job.timeout_seconds)
    .bind(job.not_before)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Lease the oldest leasable job for a capability tag.
///
/// Exclusive for `duration`; at-least-once overall. `not_before` gates
/// retry backoff.
pub async fn lease(
    pool: &DbPool,
    capability_tag: &str,
    worker: &str,
    duration: Duration,
) -> AppResult<Option<Job>> {
    let deadline = Utc::now() + duration;

    let job = sqlx::query_as::<_, Job>(&format!(
        r#"
        UPDATE noetl.job SET status = 'leased', leased_by = $1, lease_deadline = $2
        WHERE (execution_id, step_name, attempt, loop_index) IN (
            SELECT execution_id, step_name, attempt, loop_index
            FROM noetl.job
            WHERE capability_tag = $3
              AND status = 'queued'
              AND (not_before IS NULL OR not_before <= now())
            ORDER BY created_at ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(worker)
    .bind(deadline)
    .bind(capability_tag)
    .fetch_optional(pool)
    .await?;

    Ok(job)
}

/// Extend a lease held by `worker`.
pub async fn extend(
    pool: &DbPool,
    key: &JobKey,
    worker: &str,
    duration: Duration,
) -> AppResult<bool> {
    let deadline = Utc::now() + duration;

    let result = sqlx::query(
        r#"
        UPDATE noetl.job SET lease_deadline = $1
        WHERE execution_id = $2 AND step_name = $3 AND attempt = $4 AND loop_index = $5
          AND status = 'leased' AND leased_by = $6
        "#,
    )
    .bind(deadline)
    .bind(key.execution_id)
    .bind(&key.step_name)
    .bind(key.attempt)
    .bind(key.loop_index_sql())
    .bind(worker)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Acknowledge (delete) a job after its terminal event is in the log.
pub async fn ack(pool: &DbPool, key: &JobKey, worker: &str) -> AppResult<bool> {
    let result = sqlx::query(
        r#"
        DELETE FROM noetl.job
        WHERE execution_id = $1 AND step_name = $2 AND attempt = $3 AND loop_index = $4
          AND leased_by = $5
        "#,
    )
    .bind(key.execution_id)
    .bind(&key.step_name)
    .bind(key.attempt)
    .bind(key.loop_index_sql())
    .bind(worker)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Return a leased job to the queue.
pub async fn nack(pool: &DbPool, key: &JobKey, worker: &str) -> AppResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE noetl.job SET status = 'queued', leased_by = NULL, lease_deadline = NULL
        WHERE execution_id = $1 AND step_name = $2 AND attempt = $3 AND loop_index = $4
          AND status = 'leased' AND leased_by = $5
        "#,
    )
    .bind(key.execution_id)
    .bind(&key.step_name)
    .bind(key.attempt)
    .bind(key.loop_index_sql())
    .bind(worker)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Jobs whose lease deadline has passed without an ack.
pub async fn expired_leases(pool: &DbPool) -> AppResult<Vec<Job>> {
    let jobs = sqlx::query_as::<_, Job>(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM noetl.job
        WHERE status = 'leased' AND lease_deadline < now()
        ORDER BY lease_deadline ASC
        "#
    ))
    .fetch_all(pool)
    .await?;

    Ok(jobs)
}

/// Delete a job by key regardless of lease state (lease-expiry path).
pub async fn remove(pool: &DbPool, key: &JobKey) -> AppResult<bool> {
    let result = sqlx::query(
        r#"
        DELETE FROM noetl.job
        WHERE execution_id = $1 AND step_name = $2 AND attempt = $3 AND loop_index = $4
        "#,
    )
    .bind(key.execution_id)
    .bind(&key.step_name)
    .bind(key.attempt)
    .bind(key.loop_index_sql())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Queued depth for a capability tag (backpressure input).
pub async fn depth(pool: &DbPool, capability_tag: &str) -> AppResult<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM noetl.job WHERE capability_tag = $1 AND status = 'queued'",
    )
    .bind(capability_tag)
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

/// Revoke all queued jobs for a cancelled execution. Leased jobs are left
/// to their workers, which check the cancellation marker before publishing.
pub async fn revoke_queued(pool: &DbPool, execution_id: i64) -> AppResult<u64> {
    let result =
        sqlx::query("DELETE FROM noetl.job WHERE execution_id = $1 AND status = 'queued'")
            .bind(execution_id)
            .execute(pool)
            .await?;

    Ok(result.rows_affected())
}
