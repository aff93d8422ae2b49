//! Catalog queries.

use crate::db::models::catalog::{CatalogEntry, CatalogSummary};
use crate::db::DbPool;
use crate::error::AppResult;

/// Insert a new catalog entry.
pub async fn insert(
    pool: &DbPool,
    catalog_id: i64,
    path: &str,
    version: i32,
    content: &str,
    content_hash: &str,
) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO noetl.catalog (catalog_id, path, version, content, content_hash)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(catalog_id)
    .bind(path)
    .bind(version)
    .bind(content)
    .bind(content_hash)
    .execute(pool)
    .await?;

    Ok(())
}

/// Latest version number registered for a path, if any.
pub async fn latest_version(pool: &DbPool, path: &str) -> AppResult<Option<i32>> {
    let row: (Option<i32>,) =
        sqlx::query_as("SELECT MAX(version) FROM noetl.catalog WHERE path = $1")
            .bind(path)
            .fetch_one(pool)
            .await?;

    Ok(row.0)
}

/// Fetch an entry by path, either a pinned version or the latest.
pub async fn get_by_path(
    pool: &DbPool,
    path: &str,
    version: Option<i32>,
) -> AppResult<Option<CatalogEntry>> {
    let entry = sqlx::query_as::<_, CatalogEntry>(
        r#"
        SELECT catalog_id, path, version, content, content_hash, created_at
        FROM noetl.catalog
        WHERE path = $1 AND ($2::INT IS NULL OR version = $2)
        ORDER BY version DESC
        LIMIT 1
        "#,
    )
    .bind(path)
    .bind(version)
    .fetch_optional(pool)
    .await?;

    Ok(entry)
}

/// Fetch an entry by catalog_id.
pub async fn get_by_id(pool: &DbPool, catalog_id: i64) -> AppResult<Option<CatalogEntry>> {
    let entry = sqlx::query_as::<_, CatalogEntry>(
        r#"
        SELECT catalog_id, path, version, content, content_hash, created_at
        FROM noetl.catalog
        WHERE catalog_id = $1
        "#,
    )
    .bind(catalog_id)
    .fetch_optional(pool)
    .await?;

    Ok(entry)
}

/// Existing entry for a path with identical content, if any.
pub async fn find_by_hash(
    pool: &DbPool,
    path: &str,
    content_hash: &str,
) -> AppResult<Option<CatalogEntry>> {
    let entry = sqlx::query_as::<_, CatalogEntry>(
        r#"
        SELECT catalog_id, path, version, content, content_hash, created_at
        FROM noetl.catalog
        WHERE path = $1 AND content_hash = $2
        ORDER BY version DESC
        LIMIT 1
        "#,
    )
    .bind(path)
    .bind(content_hash)
    .fetch_optional(pool)
    .await?;

    Ok(entry)
}

/// List registered playbooks, newest first.
pub async fn list(pool: &DbPool, path_filter: Option<&str>) -> AppResult<Vec<CatalogSummary>> {
    let rows = sqlx::query_as::<_, CatalogSummary>(
        r#"
        SELECT catalog_id, path, version, content_hash, created_at
        FROM noetl.catalog
        WHERE ($1::TEXT IS NULL OR path LIKE $1)
        ORDER BY path ASC, version DESC
        "#,
    )
    .bind(path_filter.map(|p| format!("%{}%", p)))
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
