//! Catalog service: register and resolve playbooks.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::db::models::catalog::{CatalogEntry, CatalogSummary};
use crate::db::queries::{catalog as queries, event as event_queries};
use crate::db::DbPool;
use crate::error::{AppError, AppResult};
use crate::playbook::{parse_playbook, Playbook};

/// Response for a catalog registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub catalog_id: String,
    pub path: String,
    pub version: i32,
    pub content_hash: String,
    /// True when the content was already registered at this path.
    pub unchanged: bool,
}

/// Service for catalog operations.
#[derive(Clone)]
pub struct CatalogService {
    pool: DbPool,
}

impl CatalogService {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Register playbook YAML. The path comes from `metadata.path` (or
    /// `metadata.name` as a fallback); re-registering identical content is
    /// a no-op returning the existing entry.
    pub async fn register(&self, content: &str) -> AppResult<RegisterResponse> {
        let playbook = parse_playbook(content)?;
        let path = playbook
            .path()
            .unwrap_or(playbook.name())
            .to_string();

        let content_hash = hash_content(content);

        if let Some(existing) = queries::find_by_hash(&self.pool, &path, &content_hash).await? {
            return Ok(RegisterResponse {
                catalog_id: existing.catalog_id.to_string(),
                path: existing.path,
                version: existing.version,
                content_hash: existing.content_hash,
                unchanged: true,
            });
        }

        let version = queries::latest_version(&self.pool, &path).await?.unwrap_or(0) + 1;
        let catalog_id = event_queries::next_execution_id(&self.pool).await?;

        queries::insert(&self.pool, catalog_id, &path, version, content, &content_hash).await?;

        tracing::info!(path = %path, version, catalog_id, "Playbook registered");

        Ok(RegisterResponse {
            catalog_id: catalog_id.to_string(),
            path,
            version,
            content_hash,
            unchanged: false,
        })
    }

    /// Fetch and parse a playbook by path, pinned or latest version.
    pub async fn load(&self, path: &str, version: Option<i32>) -> AppResult<(CatalogEntry, Playbook)> {
        let entry = queries::get_by_path(&self.pool, path, version)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Playbook not found: {}", path)))?;

        let playbook = parse_playbook(&entry.content)?;
        Ok((entry, playbook))
    }

    /// Fetch and parse a playbook by catalog id.
    pub async fn load_by_id(&self, catalog_id: i64) -> AppResult<(CatalogEntry, Playbook)> {
        let entry = queries::get_by_id(&self.pool, catalog_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Catalog entry not found: {}", catalog_id))
            })?;

        let playbook = parse_playbook(&entry.content)?;
        Ok((entry, playbook))
    }

    /// List registered playbooks.
    pub async fn list(&self, path_filter: Option<&str>) -> AppResult<Vec<CatalogSummary>> {
        queries::list(&self.pool, path_filter).await
    }
}

/// Hex SHA-256 of the raw content.
fn hash_content(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable_and_hex() {
        let a = hash_content("apiVersion: noetl.io/v2");
        let b = hash_content("apiVersion: noetl.io/v2");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

        let c = hash_content("apiVersion: noetl.io/v3");
        assert_ne!(a, c);
    }
}
