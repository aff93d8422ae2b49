//! Control plane HTTP client.

use anyhow::Result;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A job leased from the control plane queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeasedJob {
    /// Execution ID.
    pub execution_id: i64,

    /// Step name.
    pub step_name: String,

    /// Attempt number.
    pub attempt: i32,

    /// Loop index; -1 encodes none.
    pub loop_index: i32,

    /// Capability tag the job was queued under.
    pub capability_tag: String,

    /// Tool kind.
    pub tool_kind: String,

    /// Resolved tool spec (secret placeholders excepted).
    pub tool_spec: serde_json::Value,

    /// Context snapshot: args, iterator bindings, credential handles.
    pub context: serde_json::Value,

    /// Result-persistence descriptor.
    #[serde(default)]
    pub save: Option<serde_json::Value>,

    /// Per-step timeout.
    #[serde(default)]
    pub timeout_seconds: Option<i64>,
}

impl LeasedJob {
    /// The job key in API path form.
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.execution_id, self.step_name, self.attempt, self.loop_index
        )
    }

    /// Loop index as an option.
    pub fn loop_index(&self) -> Option<i32> {
        (self.loop_index >= 0).then_some(self.loop_index)
    }
}

/// Event published to the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerEvent {
    pub execution_id: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    pub attempt: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_index: Option<i32>,
    pub payload: serde_json::Value,
    pub worker: String,
}

/// Outcome of publishing an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishResult {
    /// Event appended to the log.
    Accepted,
    /// The idempotency guard rejected a duplicate for this attempt key.
    Duplicate,
    /// The execution is terminal (completed/failed/cancelled).
    ExecutionClosed,
}

/// HTTP client for the control plane API.
#[derive(Clone)]
pub struct ControlPlaneClient {
    client: reqwest::Client,
    server_url: String,
}

impl ControlPlaneClient {
    /// Create a new control plane client.
    pub fn new(server_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            client,
            server_url: server_url.trim_end_matches('/').to_string(),
        }
    }

    /// Lease the next job for a capability tag. None when the queue is dry.
    pub async fn lease(
        &self,
        tag: &str,
        worker: &str,
        seconds: u64,
    ) -> Result<Option<LeasedJob>> {
        let response = self
            .client
            .get(format!("{}/api/jobs/lease", self.server_url))
            .query(&[
                ("tag", tag),
                ("worker", worker),
                ("seconds", &seconds.to_string()),
            ])
            .send()
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            status if status.is_success() => {
                let job: Option<LeasedJob> = response.json().await?;
                Ok(job)
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!("lease failed: {} {}", status, body)
            }
        }
    }

    /// Publish a step event through the guarded append.
    pub async fn publish_event(&self, event: &WorkerEvent) -> Result<PublishResult> {
        let response = self
            .client
            .post(format!("{}/api/events", self.server_url))
            .json(event)
            .send()
            .await?;

        match response.status() {
            StatusCode::CREATED | StatusCode::OK => Ok(PublishResult::Accepted),
            StatusCode::CONFLICT => {
                let body: serde_json::Value = response.json().await.unwrap_or_default();
                let outcome = body
                    .get("outcome")
                    .and_then(|o| o.get("outcome"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("duplicate");
                if outcome == "execution_closed" {
                    Ok(PublishResult::ExecutionClosed)
                } else {
                    Ok(PublishResult::Duplicate)
                }
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!("event publish failed: {} {}", status, body)
            }
        }
    }

    /// Publish with exponential-backoff retry on transport failures.
    ///
    /// Order matters for crash safety: the terminal event must be durable
    /// before the queue message is acked, so transport errors keep
    /// retrying rather than giving up.
    pub async fn publish_event_with_retry(
        &self,
        event: &WorkerEvent,
        max_retries: u32,
    ) -> Result<PublishResult> {
        let mut delay = Duration::from_millis(500);

        for attempt in 0..=max_retries {
            match self.publish_event(event).await {
                Ok(result) => return Ok(result),
                Err(e) if attempt < max_retries => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries,
                        kind = %event.kind,
                        error = %e,
                        "Event publish failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, Duration::from_secs(10));
                }
                Err(e) => return Err(e),
            }
        }

        unreachable!("loop returns on the final attempt")
    }

    /// Acknowledge a finished job.
    pub async fn ack(&self, key: &str, worker: &str) -> Result<()> {
        self.lease_op(key, "ack", &serde_json::json!({"worker": worker}))
            .await
    }

    /// Return a job to the queue.
    pub async fn nack(&self, key: &str, worker: &str, reason: &str) -> Result<()> {
        self.lease_op(
            key,
            "nack",
            &serde_json::json!({"worker": worker, "reason": reason}),
        )
        .await
    }

    /// Extend a held lease.
    pub async fn extend(&self, key: &str, worker: &str, seconds: u64) -> Result<()> {
        self.lease_op(
            key,
            "extend",
            &serde_json::json!({"worker": worker, "seconds": seconds}),
        )
        .await
    }

    async fn lease_op(&self, key: &str, op: &str, body: &serde_json::Value) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/api/jobs/{}/{}", self.server_url, key, op))
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("{} failed: {} {}", op, status, body)
        }
        Ok(())
    }

    /// Whether the execution carries a cancellation marker.
    pub async fn cancellation_check(&self, execution_id: i64) -> Result<bool> {
        let response = self
            .client
            .get(format!(
                "{}/api/executions/{}/cancellation-check",
                self.server_url, execution_id
            ))
            .send()
            .await?;

        if !response.status().is_success() {
            return Ok(false);
        }

        let body: serde_json::Value = response.json().await?;
        Ok(body
            .get("cancelled")
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    /// Register this worker.
    pub async fn register_worker(
        &self,
        name: &str,
        capability_tags: &[String],
        max_concurrency: usize,
        hostname: &str,
    ) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/api/workers/register", self.server_url))
            .json(&serde_json::json!({
                "name": name,
                "capability_tags": capability_tags,
                "max_concurrency": max_concurrency,
                "hostname": hostname,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("worker registration failed: {}", body)
        }
        Ok(())
    }

    /// Send a heartbeat.
    pub async fn heartbeat(&self, name: &str) -> Result<()> {
        let response = self
            .client
            .post(format!(
                "{}/api/workers/{}/heartbeat",
                self.server_url, name
            ))
            .send()
            .await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!("Heartbeat failed: {}", body);
        }
        Ok(())
    }

    /// Deregister this worker.
    pub async fn deregister_worker(&self, name: &str) -> Result<()> {
        let response = self
            .client
            .delete(format!("{}/api/workers/{}", self.server_url, name))
            .send()
            .await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!("Deregister failed: {}", body);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leased_job_key() {
        let job = LeasedJob {
            execution_id: 42,
            step_name: "fetch".to_string(),
            attempt: 2,
            loop_index: -1,
            capability_tag: "cpu".to_string(),
            tool_kind: "http".to_string(),
            tool_spec: serde_json::json!({}),
            context: serde_json::json!({}),
            save: None,
            timeout_seconds: None,
        };

        assert_eq!(job.key(), "42:fetch:2:-1");
        assert_eq!(job.loop_index(), None);
    }

    #[test]
    fn test_leased_job_deserialization() {
        let json = serde_json::json!({
            "execution_id": 7,
            "step_name": "ping",
            "attempt": 1,
            "loop_index": 2,
            "capability_tag": "cpu",
            "tool_kind": "http",
            "tool_spec": {"kind": "http", "url": "https://x"},
            "context": {"args": {}},
            "status": "leased",
            "created_at": "2025-01-01T00:00:00Z"
        });

        let job: LeasedJob = serde_json::from_value(json).unwrap();
        assert_eq!(job.loop_index(), Some(2));
        assert_eq!(job.tool_kind, "http");
    }

    #[test]
    fn test_client_url_normalization() {
        let client = ControlPlaneClient::new("http://localhost:8082/");
        assert_eq!(client.server_url, "http://localhost:8082");
    }

    #[test]
    fn test_worker_event_serialization() {
        let event = WorkerEvent {
            execution_id: "42".to_string(),
            kind: "step_completed".to_string(),
            step_name: Some("fetch".to_string()),
            attempt: 1,
            loop_index: None,
            payload: serde_json::json!({"data": {"ok": true}}),
            worker: "w1".to_string(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("step_completed"));
        assert!(!json.contains("loop_index"));
    }
}
