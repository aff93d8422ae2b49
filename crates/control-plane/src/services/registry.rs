//! Worker pool registry service.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::db::models::worker::WorkerRecord;
use crate::db::queries::worker as queries;
use crate::db::DbPool;
use crate::error::{AppError, AppResult};

/// Request to register a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterWorkerRequest {
    /// Self-chosen worker name.
    pub name: String,

    /// Capability tags the worker serves.
    #[serde(default = "default_tags")]
    pub capability_tags: Vec<String>,

    /// Parallel lease slots.
    #[serde(default = "default_concurrency")]
    pub max_concurrency: i32,

    /// Hostname for operators.
    #[serde(default)]
    pub hostname: Option<String>,
}

fn default_tags() -> Vec<String> {
    vec!["cpu".to_string()]
}

fn default_concurrency() -> i32 {
    4
}

/// Service for worker registry operations.
#[derive(Clone)]
pub struct WorkerRegistryService {
    pool: DbPool,
}

impl WorkerRegistryService {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Register (or re-register) a worker.
    pub async fn register(&self, request: &RegisterWorkerRequest) -> AppResult<WorkerRecord> {
        if request.name.is_empty() {
            return Err(AppError::Validation("Worker name must not be empty".to_string()));
        }
        if request.capability_tags.is_empty() {
            return Err(AppError::Validation(
                "Worker must declare at least one capability tag".to_string(),
            ));
        }

        let tags = serde_json::to_value(&request.capability_tags)?;
        let record = queries::register(
            &self.pool,
            &request.name,
            &tags,
            request.max_concurrency,
            request.hostname.as_deref(),
        )
        .await?;

        tracing::info!(
            worker = %record.name,
            tags = ?request.capability_tags,
            max_concurrency = request.max_concurrency,
            "Worker registered"
        );

        Ok(record)
    }

    /// Record a heartbeat.
    pub async fn heartbeat(&self, name: &str) -> AppResult<()> {
        if !queries::heartbeat(&self.pool, name).await? {
            return Err(AppError::NotFound(format!("Worker not registered: {}", name)));
        }
        Ok(())
    }

    /// Remove a worker.
    pub async fn deregister(&self, name: &str) -> AppResult<()> {
        if !queries::deregister(&self.pool, name).await? {
            return Err(AppError::NotFound(format!("Worker not registered: {}", name)));
        }
        tracing::info!(worker = %name, "Worker deregistered");
        Ok(())
    }

    /// List registered workers.
    pub async fn list(&self) -> AppResult<Vec<WorkerRecord>> {
        queries::list(&self.pool).await
    }

    /// Flip workers with stale heartbeats to offline. Their outstanding
    /// leases lapse through the normal lease-expiry sweep.
    pub async fn sweep_stale(&self, stale_after_seconds: u64) -> AppResult<Vec<String>> {
        let flipped =
            queries::sweep_stale(&self.pool, Duration::seconds(stale_after_seconds as i64)).await?;
        for name in &flipped {
            tracing::warn!(worker = %name, "Worker marked offline, heartbeat stale");
        }
        Ok(flipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_request_defaults() {
        let json = r#"{"name": "worker-1"}"#;
        let request: RegisterWorkerRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.capability_tags, vec!["cpu"]);
        assert_eq!(request.max_concurrency, 4);
    }
}
