//! Application configuration for the NoETL Control Plane server.

use serde::Deserialize;

/// Application configuration loaded from environment variables.
///
/// Environment variables are prefixed with `NOETL_`:
/// - `NOETL_HOST`: Server bind address (default: "0.0.0.0")
/// - `NOETL_PORT`: Server port (default: 8082)
/// - `NOETL_NATS_URL`: NATS server URL (optional, wake-up channels only)
/// - `NOETL_BROKER_TICK_MS`: Broker sweep interval in milliseconds
/// - `NOETL_QUEUE_HIGH_WATER`: Per-tag queue depth ceiling for backpressure
/// - `NOETL_WORKER_STALE_SECONDS`: Heartbeat age before a worker is OFFLINE
/// - `NOETL_MAX_SUBPLAYBOOK_DEPTH`: Recursion guard for nested playbooks
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Enable debug mode
    #[serde(default)]
    pub debug: bool,

    /// Server name for identification
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// NATS URL (optional)
    #[serde(default)]
    pub nats_url: Option<String>,

    /// Broker tick interval in milliseconds
    #[serde(default = "default_broker_tick_ms")]
    pub broker_tick_ms: u64,

    /// Maximum executions advanced concurrently per tick
    #[serde(default = "default_broker_parallelism")]
    pub broker_parallelism: usize,

    /// Queue depth ceiling per capability tag before enqueues are deferred
    #[serde(default = "default_queue_high_water")]
    pub queue_high_water: i64,

    /// Default job lease duration in seconds
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,

    /// Heartbeat age in seconds before a worker is marked offline
    #[serde(default = "default_worker_stale_seconds")]
    pub worker_stale_seconds: u64,

    /// Maximum nesting depth for sub-playbook executions
    #[serde(default = "default_max_subplaybook_depth")]
    pub max_subplaybook_depth: u32,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8082
}

fn default_server_name() -> String {
    "noetl-control-plane".to_string()
}

fn default_broker_tick_ms() -> u64 {
    500
}

fn default_broker_parallelism() -> usize {
    16
}

fn default_queue_high_water() -> i64 {
    1000
}

fn default_lease_seconds() -> u64 {
    60
}

fn default_worker_stale_seconds() -> u64 {
    60
}

fn default_max_subplaybook_depth() -> u32 {
    8
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables are prefixed with `NOETL_`.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("NOETL_").from_env::<AppConfig>()
    }

    /// Get the server bind address as a string suitable for `TcpListener::bind`.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            debug: false,
            server_name: default_server_name(),
            nats_url: None,
            broker_tick_ms: default_broker_tick_ms(),
            broker_parallelism: default_broker_parallelism(),
            queue_high_water: default_queue_high_water(),
            lease_seconds: default_lease_seconds(),
            worker_stale_seconds: default_worker_stale_seconds(),
            max_subplaybook_depth: default_max_subplaybook_depth(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8082);
        assert_eq!(config.queue_high_water, 1000);
        assert_eq!(config.max_subplaybook_depth, 8);
    }

    #[test]
    fn test_bind_address() {
        let config = AppConfig::default();
        assert_eq!(config.bind_address(), "0.0.0.0:8082");
    }
}
