//! Worker configuration.

use anyhow::Result;
use std::time::Duration;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Self-chosen worker name.
    pub name: String,

    /// Capability tags this worker leases.
    pub capability_tags: Vec<String>,

    /// Control plane server URL.
    pub server_url: String,

    /// NATS server URL (optional wake-up channel).
    pub nats_url: Option<String>,

    /// Heartbeat interval.
    pub heartbeat_interval: Duration,

    /// Maximum concurrent lease slots.
    pub max_concurrency: usize,

    /// Lease duration requested per job.
    pub lease_seconds: u64,

    /// Poll interval when no wake-ups arrive.
    pub poll_interval: Duration,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let name = std::env::var("NOETL_WORKER_NAME")
            .unwrap_or_else(|_| format!("worker-{}", uuid::Uuid::new_v4()));

        let capability_tags: Vec<String> = std::env::var("NOETL_WORKER_TAGS")
            .unwrap_or_else(|_| "cpu".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let server_url = std::env::var("NOETL_SERVER_URL")
            .unwrap_or_else(|_| "http://localhost:8082".to_string());

        let nats_url = std::env::var("NATS_URL").ok();

        let heartbeat_secs: u64 = std::env::var("NOETL_WORKER_HEARTBEAT_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(15);

        let max_concurrency: usize = std::env::var("NOETL_WORKER_MAX_CONCURRENT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(4);

        let lease_seconds: u64 = std::env::var("NOETL_WORKER_LEASE_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);

        let poll_secs: u64 = std::env::var("NOETL_WORKER_POLL_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        Ok(Self {
            name,
            capability_tags,
            server_url,
            nats_url,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            max_concurrency,
            lease_seconds,
            poll_interval: Duration::from_secs(poll_secs),
        })
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: format!("worker-{}", uuid::Uuid::new_v4()),
            capability_tags: vec!["cpu".to_string()],
            server_url: "http://localhost:8082".to_string(),
            nats_url: None,
            heartbeat_interval: Duration::from_secs(15),
            max_concurrency: 4,
            lease_seconds: 60,
            poll_interval: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.capability_tags, vec!["cpu"]);
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.lease_seconds, 60);
        assert!(config.name.starts_with("worker-"));
    }
}
