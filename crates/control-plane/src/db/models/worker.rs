//! Worker registry model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A registered worker.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WorkerRecord {
    /// Self-chosen worker name (primary key).
    pub name: String,

    /// Capability tags the worker can lease, as a JSON array of strings.
    pub capability_tags: serde_json::Value,

    /// Maximum concurrent lease slots.
    pub max_concurrency: i32,

    /// Hostname reported at registration.
    pub hostname: Option<String>,

    /// "online" or "offline" (stale heartbeat).
    pub status: String,

    /// Last heartbeat time.
    pub heartbeat: DateTime<Utc>,

    /// First registration time.
    pub registered_at: DateTime<Utc>,
}

impl WorkerRecord {
    /// Capability tags as a string vector.
    pub fn tags(&self) -> Vec<String> {
        self.capability_tags
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_extraction() {
        let record = WorkerRecord {
            name: "w1".to_string(),
            capability_tags: serde_json::json!(["cpu", "gpu"]),
            max_concurrency: 4,
            hostname: None,
            status: "online".to_string(),
            heartbeat: Utc::now(),
            registered_at: Utc::now(),
        };

        assert_eq!(record.tags(), vec!["cpu", "gpu"]);
    }
}
