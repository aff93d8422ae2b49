//! Schema bootstrap for the `noetl` schema.
//!
//! Applied at startup; every statement is idempotent so multiple server
//! instances can race on boot.

use crate::db::DbPool;
use crate::error::AppResult;

/// DDL statements for the execution-plane schema.
///
/// The unique index on `(execution_id, seq)` is the compare-and-append
/// guard; the unique index on the job key is the enqueue idempotency guard.
const DDL: &[&str] = &[
    "CREATE SCHEMA IF NOT EXISTS noetl",
    r#"
    CREATE SEQUENCE IF NOT EXISTS noetl.snowflake_seq
    "#,
    r#"
    CREATE OR REPLACE FUNCTION noetl.snowflake_id() RETURNS BIGINT AS $$
        SELECT (
            (FLOOR(EXTRACT(EPOCH FROM clock_timestamp()) * 1000)::BIGINT - 1704067200000) << 22
        ) | (nextval('noetl.snowflake_seq') % 4194304)
    $$ LANGUAGE SQL
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS noetl.catalog (
        catalog_id   BIGINT PRIMARY KEY,
        path         TEXT NOT NULL,
        version      INT NOT NULL,
        content      TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        created_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (path, version)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS noetl.event (
        execution_id BIGINT NOT NULL,
        seq          BIGINT NOT NULL,
        kind         TEXT NOT NULL,
        step_name    TEXT,
        attempt      INT NOT NULL DEFAULT 1,
        loop_index   INT,
        payload      JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (execution_id, seq)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS event_kind_idx ON noetl.event (execution_id, kind)",
    r#"
    CREATE TABLE IF NOT EXISTS noetl.job (
        execution_id   BIGINT NOT NULL,
        step_name      TEXT NOT NULL,
        attempt        INT NOT NULL,
        loop_index     INT NOT NULL DEFAULT -1,
        capability_tag TEXT NOT NULL,
        tool_kind      TEXT NOT NULL,
        tool_spec      JSONB NOT NULL,
        context        JSONB NOT NULL DEFAULT '{}'::jsonb,
        save           JSONB,
        timeout_seconds BIGINT,
        not_before     TIMESTAMPTZ,
        status         TEXT NOT NULL DEFAULT 'queued',
        leased_by      TEXT,
        lease_deadline TIMESTAMPTZ,
        created_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (execution_id, step_name, attempt, loop_index)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS job_tag_idx ON noetl.job (capability_tag, status)",
    r#"
    CREATE TABLE IF NOT EXISTS noetl.worker (
        name            TEXT PRIMARY KEY,
        capability_tags JSONB NOT NULL DEFAULT '[]'::jsonb,
        max_concurrency INT NOT NULL DEFAULT 4,
        hostname        TEXT,
        status          TEXT NOT NULL DEFAULT 'online',
        heartbeat       TIMESTAMPTZ NOT NULL DEFAULT now(),
        registered_at   TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
];

/// Apply the schema DDL.
pub async fn init_schema(pool: &DbPool) -> AppResult<()> {
    for statement in DDL {
        sqlx::query(statement).execute(pool).await?;
    }

    tracing::info!("Database schema initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ddl_is_idempotent_sql() {
        // Every statement must tolerate re-execution on a warm database.
        for statement in DDL {
            let upper = statement.to_uppercase();
            assert!(
                upper.contains("IF NOT EXISTS") || upper.contains("OR REPLACE"),
                "non-idempotent DDL: {}",
                statement
            );
        }
    }
}
