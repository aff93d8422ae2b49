//! One leased job, end to end.
//!
//! The sequence is fixed for crash safety: publish `step_started`, execute,
//! publish the terminal event, then ack the queue message. If the process
//! dies between publish and ack, redelivery finds the event already present
//! and the duplicate publication comes back 409; the job is acked without
//! side effects.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use noetl_tools::registry::{ToolRegistry, ToolSpec};
use noetl_tools::{ToolContext, ToolError, ToolResult, ToolStatus};

use crate::client::{ControlPlaneClient, LeasedJob, PublishResult, WorkerEvent};
use crate::secrets::SecretStore;

/// Executes leased jobs against the tool registry.
pub struct JobRunner {
    client: ControlPlaneClient,
    registry: Arc<ToolRegistry>,
    secrets: SecretStore,
    worker_name: String,
    lease_seconds: u64,
}

impl JobRunner {
    pub fn new(
        client: ControlPlaneClient,
        registry: Arc<ToolRegistry>,
        secrets: SecretStore,
        worker_name: String,
        lease_seconds: u64,
    ) -> Self {
        Self {
            client,
            registry,
            secrets,
            worker_name,
            lease_seconds,
        }
    }

    /// Run one job to its terminal state and ack it.
    pub async fn run(&self, job: LeasedJob) -> Result<()> {
        let key = job.key();

        // Cancellation check before any publication.
        if self.client.cancellation_check(job.execution_id).await? {
            tracing::info!(key = %key, "Execution cancelled, releasing job");
            self.client.ack(&key, &self.worker_name).await?;
            return Ok(());
        }

        match self
            .publish(&job, "step_started", serde_json::json!({}))
            .await?
        {
            PublishResult::Accepted => {}
            PublishResult::Duplicate | PublishResult::ExecutionClosed => {
                // Redelivery of work that already ran, or a closed
                // execution: drop without side effects.
                tracing::info!(key = %key, "Duplicate or closed, acking without execution");
                self.client.ack(&key, &self.worker_name).await?;
                return Ok(());
            }
        }

        let outcome = self.execute(&job).await;

        // A cancellation that arrived mid-flight wins over the result.
        if self.client.cancellation_check(job.execution_id).await? {
            tracing::info!(key = %key, "Execution cancelled mid-flight, releasing without publishing");
            self.client.ack(&key, &self.worker_name).await?;
            return Ok(());
        }

        let (kind, payload) = match outcome {
            Ok(result) if result.status == ToolStatus::Timeout => (
                "step_failed",
                serde_json::json!({
                    "reason": "timeout",
                    "detail": result.error.unwrap_or_else(|| "tool timed out".into()),
                }),
            ),
            Ok(result) if result.is_success() => {
                self.persist_result(&job, &result).await;
                (
                    "step_completed",
                    serde_json::json!({
                        "data": result.data,
                        "duration_ms": result.duration_ms,
                    }),
                )
            }
            Ok(result) => (
                "step_failed",
                serde_json::json!({
                    "reason": "tool_error",
                    "detail": result.error.unwrap_or_else(|| "tool reported failure".into()),
                }),
            ),
            Err(ToolError::Cancelled) => {
                self.client.ack(&key, &self.worker_name).await?;
                return Ok(());
            }
            Err(e) => (
                "step_failed",
                serde_json::json!({
                    "reason": failure_reason(&e),
                    "detail": e.to_string(),
                }),
            ),
        };

        // Publish-then-ack; the terminal must be durable first.
        self.publish_with_retry(&job, kind, payload).await?;
        self.client.ack(&key, &self.worker_name).await?;

        Ok(())
    }

    /// Execute the tool with lease keep-alive, progress forwarding, and
    /// timeout enforcement.
    async fn execute(&self, job: &LeasedJob) -> Result<ToolResult, ToolError> {
        let ctx = self.build_context(job)?;

        let spec: ToolSpec = serde_json::from_value(job.tool_spec.clone())
            .map_err(|e| ToolError::Configuration(format!("invalid tool spec: {}", e)))?;
        let spec = ToolSpec {
            timeout: spec.timeout.or(job.timeout_seconds.map(|t| t as u64)),
            ..spec
        };

        let cancel = CancellationToken::new();
        let (progress_tx, mut progress_rx) = mpsc::channel::<serde_json::Value>(16);

        // Forward progress payloads as step_progress events; best effort.
        let progress_client = self.client.clone();
        let progress_event = self.event_template(job, "step_progress");
        let progress_task = tokio::spawn(async move {
            while let Some(data) = progress_rx.recv().await {
                let event = WorkerEvent {
                    payload: serde_json::json!({"data": data}),
                    ..progress_event.clone()
                };
                if let Err(e) = progress_client.publish_event(&event).await {
                    tracing::debug!(error = %e, "Progress publish failed");
                }
            }
        });

        // Keep the lease alive at half its duration while the tool runs.
        let extend_client = self.client.clone();
        let extend_key = job.key();
        let extend_worker = self.worker_name.clone();
        let lease_seconds = self.lease_seconds;
        let extender = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs((lease_seconds / 2).max(1)));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = extend_client
                    .extend(&extend_key, &extend_worker, lease_seconds)
                    .await
                {
                    tracing::warn!(key = %extend_key, error = %e, "Lease extension failed");
                }
            }
        });

        tracing::debug!(
            key = %job.key(),
            tool = %spec.kind,
            "Executing tool"
        );

        let result = self
            .registry
            .execute(&spec, &ctx, cancel.clone(), progress_tx)
            .await;

        extender.abort();
        progress_task.abort();

        result
    }

    /// Build the tool context from the job's snapshot, resolving secrets.
    fn build_context(&self, job: &LeasedJob) -> Result<ToolContext, ToolError> {
        let mut ctx = ToolContext::new(job.execution_id, &job.step_name, job.attempt)
            .with_loop_index(job.loop_index())
            .with_worker(&self.worker_name);

        if let Some(args) = job.context.get("args").and_then(|v| v.as_object()) {
            ctx.args = args
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
        }
        ctx.item = job.context.get("item").cloned();

        let credentials: HashMap<String, String> = job
            .context
            .get("credentials")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        if !credentials.is_empty() {
            let (resolved, missing) = self.secrets.resolve_bindings(&credentials);
            // Only fail on bindings this spec actually references.
            for name in missing {
                let marker = format!("secret.{}", name);
                if job.tool_spec.to_string().contains(&marker) {
                    return Err(ToolError::MissingSecret(name));
                }
            }
            for (name, value) in resolved {
                ctx.set_secret(name, value);
            }
        }

        Ok(ctx)
    }

    /// Write the result per the step's save descriptor. Storage backends
    /// beyond local files belong to their own adapters.
    async fn persist_result(&self, job: &LeasedJob, result: &ToolResult) {
        let Some(save) = &job.save else { return };
        let storage = save.get("storage").and_then(|v| v.as_str());

        match storage {
            Some("file") => {
                let Some(path) = save.get("path").and_then(|v| v.as_str()) else {
                    tracing::warn!(key = %job.key(), "save.storage=file without path");
                    return;
                };
                let body = serde_json::to_vec_pretty(&result.data).unwrap_or_default();
                if let Err(e) = tokio::fs::write(path, body).await {
                    tracing::warn!(key = %job.key(), path, error = %e, "Result save failed");
                }
            }
            Some(other) => {
                tracing::warn!(key = %job.key(), storage = other, "Unsupported save storage");
            }
            None => {}
        }
    }

    fn event_template(&self, job: &LeasedJob, kind: &str) -> WorkerEvent {
        WorkerEvent {
            execution_id: job.execution_id.to_string(),
            kind: kind.to_string(),
            step_name: Some(job.step_name.clone()),
            attempt: job.attempt,
            loop_index: job.loop_index(),
            payload: serde_json::Value::Null,
            worker: self.worker_name.clone(),
        }
    }

    async fn publish(
        &self,
        job: &LeasedJob,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<PublishResult> {
        let event = WorkerEvent {
            payload,
            ..self.event_template(job, kind)
        };
        self.client.publish_event(&event).await
    }

    async fn publish_with_retry(
        &self,
        job: &LeasedJob,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<PublishResult> {
        let event = WorkerEvent {
            payload,
            ..self.event_template(job, kind)
        };
        self.client.publish_event_with_retry(&event, 5).await
    }
}

/// Map a tool error onto the failure taxonomy the broker retries by.
fn failure_reason(error: &ToolError) -> &'static str {
    match error {
        ToolError::Timeout(_) => "timeout",
        ToolError::Configuration(_) | ToolError::Template(_) | ToolError::NotFound(_) => {
            "unresolved_reference"
        }
        ToolError::MissingSecret(_) => "missing_secret",
        ToolError::Http(_) | ToolError::Io(_) | ToolError::Process(_) => "transient_error",
        _ => "tool_error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_mapping() {
        assert_eq!(failure_reason(&ToolError::Timeout(30)), "timeout");
        assert_eq!(
            failure_reason(&ToolError::Configuration("x".into())),
            "unresolved_reference"
        );
        assert_eq!(
            failure_reason(&ToolError::Http("reset".into())),
            "transient_error"
        );
        assert_eq!(
            failure_reason(&ToolError::ExecutionFailed("x".into())),
            "tool_error"
        );
    }
}
