//! Worker registry queries.

use chrono::Duration;

use crate::db::models::worker::WorkerRecord;
use crate::db::DbPool;
use crate::error::AppResult;

/// Register or refresh a worker. Re-registration updates capabilities.
pub async fn register(
    pool: &DbPool,
    name: &str,
    capability_tags: &serde_json::Value,
    max_concurrency: i32,
    hostname: Option<&str>,
) -> AppResult<WorkerRecord> {
    let record = sqlx::query_as::<_, WorkerRecord>(
        r#"
        INSERT INTO noetl.worker (name, capability_tags, max_concurrency, hostname)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (name) DO UPDATE SET
            capability_tags = EXCLUDED.capability_tags,
            max_concurrency = EXCLUDED.max_concurrency,
            hostname = EXCLUDED.hostname,
            status = 'online',
            heartbeat = now()
        RETURNING name, capability_tags, max_concurrency, hostname, status, heartbeat, registered_at
        "#,
    )
    .bind(name)
    .bind(capability_tags)
    .bind(max_concurrency)
    .bind(hostname)
    .fetch_one(pool)
    .await?;

    Ok(record)
}

/// Record a heartbeat. Returns false for unknown workers.
pub async fn heartbeat(pool: &DbPool, name: &str) -> AppResult<bool> {
    let result =
        sqlx::query("UPDATE noetl.worker SET heartbeat = now(), status = 'online' WHERE name = $1")
            .bind(name)
            .execute(pool)
            .await?;

    Ok(result.rows_affected() > 0)
}

/// Remove a worker from the registry.
pub async fn deregister(pool: &DbPool, name: &str) -> AppResult<bool> {
    let result = sqlx::query("DELETE FROM noetl.worker WHERE name = $1")
        .bind(name)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// List all registered workers.
pub async fn list(pool: &DbPool) -> AppResult<Vec<WorkerRecord>> {
    let workers = sqlx::query_as::<_, WorkerRecord>(
        r#"
        SELECT name, capability_tags, max_concurrency, hostname, status, heartbeat, registered_at
        FROM noetl.worker
        ORDER BY name
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(workers)
}

/// Mark workers offline when their heartbeat is older than the threshold.
/// Returns the names that flipped.
pub async fn sweep_stale(pool: &DbPool, stale_after: Duration) -> AppResult<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        UPDATE noetl.worker SET status = 'offline'
        WHERE status = 'online' AND heartbeat < now() - $1::INTERVAL
        RETURNING name
        "#,
    )
    .bind(format!("{} seconds", stale_after.num_seconds()))
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(name,)| name).collect())
}
