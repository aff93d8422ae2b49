//! Catalog model: versioned, content-addressed playbook registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A registered playbook version. Immutable once written.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Catalog entry ID (snowflake).
    pub catalog_id: i64,

    /// Resource path, e.g. "workflows/etl-pipeline".
    pub path: String,

    /// Version, monotonically increasing per path.
    pub version: i32,

    /// Raw playbook YAML.
    pub content: String,

    /// Hex-encoded SHA-256 of the content.
    pub content_hash: String,

    /// When the entry was registered.
    pub created_at: DateTime<Utc>,
}

/// Summary returned by catalog listings (content omitted).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CatalogSummary {
    pub catalog_id: i64,
    pub path: String,
    pub version: i32,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_entry_serialization() {
        let entry = CatalogEntry {
            catalog_id: 1,
            path: "workflows/demo".to_string(),
            version: 3,
            content: "apiVersion: noetl.io/v2".to_string(),
            content_hash: "abc".to_string(),
            created_at: Utc::now(),
        };

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("workflows/demo"));
        assert!(json.contains("\"version\":3"));
    }
}
