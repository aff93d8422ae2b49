//! Job model: one work item on the durable queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Content address of a job.
///
/// Enqueuing the same key twice is a no-op; this is the idempotency guard
/// that makes at-least-once delivery safe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub execution_id: i64,
    pub step_name: String,
    pub attempt: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_index: Option<i32>,
}

impl JobKey {
    pub fn new(
        execution_id: i64,
        step_name: impl Into<String>,
        attempt: i32,
        loop_index: Option<i32>,
    ) -> Self {
        Self {
            execution_id,
            step_name: step_name.into(),
            attempt,
            loop_index,
        }
    }

    /// SQL sentinel: null loop_index is stored as -1 so it can participate
    /// in the primary key.
    pub fn loop_index_sql(&self) -> i32 {
        self.loop_index.unwrap_or(-1)
    }

    /// Render as the path form used by the job API:
    /// `executionId:step:attempt:loopIndex`.
    pub fn encode(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.execution_id,
            self.step_name,
            self.attempt,
            self.loop_index_sql()
        )
    }

    /// Parse the path form back into a key.
    pub fn decode(s: &str) -> Option<Self> {
        let mut parts = s.splitn(4, ':');
        let execution_id = parts.next()?.parse().ok()?;
        let step_name = parts.next()?.to_string();
        let attempt = parts.next()?.parse().ok()?;
        let loop_index: i32 = parts.next()?.parse().ok()?;
        Some(Self {
            execution_id,
            step_name,
            attempt,
            loop_index: (loop_index >= 0).then_some(loop_index),
        })
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// A queued or leased job.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Job {
    pub execution_id: i64,
    pub step_name: String,
    pub attempt: i32,
    /// -1 sentinel in SQL; use [`Job::key`] for the Option form.
    pub loop_index: i32,
    pub capability_tag: String,
    pub tool_kind: String,
    /// Tool spec with templates already expanded (secret refs excepted).
    pub tool_spec: serde_json::Value,
    /// Context snapshot: the minimum scope the worker needs.
    pub context: serde_json::Value,
    /// Optional result-persistence descriptor.
    pub save: Option<serde_json::Value>,
    /// Per-step timeout carried to the worker.
    pub timeout_seconds: Option<i64>,
    /// Earliest lease time (retry backoff).
    pub not_before: Option<DateTime<Utc>>,
    pub status: String,
    pub leased_by: Option<String>,
    pub lease_deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn key(&self) -> JobKey {
        JobKey {
            execution_id: self.execution_id,
            step_name: self.step_name.clone(),
            attempt: self.attempt,
            loop_index: (self.loop_index >= 0).then_some(self.loop_index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_encode_decode() {
        let key = JobKey::new(42, "fetch", 2, Some(3));
        assert_eq!(key.encode(), "42:fetch:2:3");
        assert_eq!(JobKey::decode("42:fetch:2:3"), Some(key));

        let key = JobKey::new(42, "fetch", 1, None);
        assert_eq!(key.encode(), "42:fetch:1:-1");
        assert_eq!(JobKey::decode("42:fetch:1:-1"), Some(key));
    }

    #[test]
    fn test_key_decode_rejects_garbage() {
        assert_eq!(JobKey::decode("nope"), None);
        assert_eq!(JobKey::decode("1:step"), None);
        assert_eq!(JobKey::decode("x:step:1:0"), None);
    }

    #[test]
    fn test_loop_index_sentinel() {
        assert_eq!(JobKey::new(1, "s", 1, None).loop_index_sql(), -1);
        assert_eq!(JobKey::new(1, "s", 1, Some(0)).loop_index_sql(), 0);
    }
}
