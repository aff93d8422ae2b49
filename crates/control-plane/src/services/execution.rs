//! Execution management service.
//!
//! Starting, inspecting, and cancelling executions. Everything here is a
//! view over (or an append to) the event log; there is no execution table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::event::{EventKind, NewEvent};
use crate::db::queries::event as event_queries;
use crate::db::DbPool;
use crate::engine::projector::{project, ExecStatus, ParentRef};
use crate::error::{AppError, AppResult};
use crate::services::catalog::CatalogService;
use crate::services::event::{EventService, PublishOutcome};
use crate::services::queue::JobQueueService;

/// Request to start an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartExecutionRequest {
    /// Playbook catalog path.
    #[serde(default)]
    pub path: Option<String>,

    /// Catalog ID (alternative to path).
    #[serde(default)]
    pub catalog_id: Option<i64>,

    /// Pinned version for path lookups.
    #[serde(default)]
    pub version: Option<i32>,

    /// Caller payload merged over the playbook's workload defaults.
    #[serde(default)]
    pub payload: serde_json::Value,

    /// Deep-merge payload into the defaults instead of a shallow override.
    #[serde(default)]
    pub merge: bool,
}

/// Response after starting an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartExecutionResponse {
    pub execution_id: String,
    pub path: String,
    pub version: i32,
}

/// Execution status projected from the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStatusResponse {
    pub execution_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    pub completed_steps: Vec<String>,
    pub failed: bool,
    pub completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Workload plus finished step results.
    pub variables: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// One row of an execution listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// Service for execution lifecycle operations.
#[derive(Clone)]
pub struct ExecutionService {
    pool: DbPool,
    events: EventService,
    catalog: CatalogService,
    queue: JobQueueService,
}

impl ExecutionService {
    pub fn new(
        pool: DbPool,
        events: EventService,
        catalog: CatalogService,
        queue: JobQueueService,
    ) -> Self {
        Self {
            pool,
            events,
            catalog,
            queue,
        }
    }

    /// Start a root execution.
    pub async fn start(&self, request: &StartExecutionRequest) -> AppResult<StartExecutionResponse> {
        let (entry, playbook) = match (&request.path, request.catalog_id) {
            (_, Some(catalog_id)) => self.catalog.load_by_id(catalog_id).await?,
            (Some(path), None) => self.catalog.load(path, request.version).await?,
            (None, None) => {
                return Err(AppError::Validation(
                    "Either 'path' or 'catalog_id' must be provided".to_string(),
                ))
            }
        };

        let workload = merged_workload(
            playbook.workload.clone().unwrap_or_else(empty_object),
            request.payload.clone(),
            request.merge,
        );

        let execution_id = event_queries::next_execution_id(&self.pool).await?;
        self.create(execution_id, &entry.path, entry.version, entry.catalog_id, workload, None, &[])
            .await?;

        tracing::info!(
            execution_id,
            path = %entry.path,
            version = entry.version,
            "Execution started"
        );

        Ok(StartExecutionResponse {
            execution_id: execution_id.to_string(),
            path: entry.path,
            version: entry.version,
        })
    }

    /// Open a log with its `execution_started` event. Used for roots and
    /// for sub-playbook children (with a parent reference).
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        execution_id: i64,
        path: &str,
        version: i32,
        catalog_id: i64,
        workload: serde_json::Value,
        parent: Option<ParentRef>,
        ancestors: &[String],
    ) -> AppResult<()> {
        let mut payload = serde_json::json!({
            "path": path,
            "version": version,
            "catalog_id": catalog_id,
            "workload": workload,
            "ancestors": ancestors,
        });
        if let Some(parent) = parent {
            payload["parent"] = serde_json::to_value(parent)?;
        }

        self.events
            .open_log(
                execution_id,
                NewEvent::execution(EventKind::ExecutionStarted, payload),
            )
            .await?;

        Ok(())
    }

    /// Status view per the control API contract.
    pub async fn status(&self, execution_id: i64) -> AppResult<ExecutionStatusResponse> {
        let events = self.events.read_log(execution_id).await?;
        let projection = project(&events).ok_or_else(|| {
            AppError::NotFound(format!("Execution not found: {}", execution_id))
        })?;

        let current_step = projection
            .steps
            .iter()
            .filter(|(_, s)| s.status.is_in_flight())
            .map(|(name, _)| name.clone())
            .next();

        let mut variables = serde_json::Map::new();
        if let Some(workload) = projection.workload.as_object() {
            for (k, v) in workload {
                variables.insert(k.clone(), v.clone());
            }
        }
        for (name, step) in &projection.steps {
            if let Some(result) = &step.last_result {
                variables.insert(name.clone(), result.clone());
            }
        }

        let error = projection.error.clone().or_else(|| {
            projection
                .first_failure()
                .map(|(step, error)| format!("{}: {}", step, error))
        });

        Ok(ExecutionStatusResponse {
            execution_id: execution_id.to_string(),
            status: projection.status.to_string(),
            current_step,
            completed_steps: projection
                .completed_steps()
                .into_iter()
                .map(String::from)
                .collect(),
            failed: projection.status == ExecStatus::Failed,
            completed: projection.status == ExecStatus::Completed,
            error,
            variables: serde_json::Value::Object(variables),
            started_at: projection.started_at,
            finished_at: projection.finished_at,
        })
    }

    /// Cancel an execution: append the terminal marker and revoke queued
    /// jobs. Leased jobs are the workers' problem; they check the marker
    /// before publishing.
    pub async fn cancel(&self, execution_id: i64) -> AppResult<()> {
        let outcome = self
            .events
            .publish(
                execution_id,
                NewEvent::execution(EventKind::ExecutionCancelled, serde_json::json!({})),
            )
            .await?;

        match outcome {
            PublishOutcome::Appended { .. } => {
                let revoked = self.queue.revoke_queued(execution_id).await?;
                tracing::info!(execution_id, revoked, "Execution cancelled");
                Ok(())
            }
            PublishOutcome::ExecutionClosed => Err(AppError::Conflict(format!(
                "Execution {} is already terminal",
                execution_id
            ))),
            PublishOutcome::Duplicate => Ok(()),
        }
    }

    /// Whether the execution carries a cancellation (or any terminal)
    /// marker. Workers poll this before publishing results.
    pub async fn is_cancelled(&self, execution_id: i64) -> AppResult<bool> {
        let events = self.events.read_log(execution_id).await?;
        Ok(project(&events)
            .map(|p| p.status == ExecStatus::Cancelled)
            .unwrap_or(false))
    }

    /// List executions, optionally filtered by playbook path.
    pub async fn list(&self, path: Option<&str>, limit: i64) -> AppResult<Vec<ExecutionSummary>> {
        let rows = event_queries::list_executions_by_path(&self.pool, path, limit).await?;

        let mut summaries = Vec::with_capacity(rows.len());
        for (execution_id, started_at) in rows {
            let events = self.events.read_log(execution_id).await?;
            if let Some(projection) = project(&events) {
                summaries.push(ExecutionSummary {
                    execution_id: execution_id.to_string(),
                    status: projection.status.to_string(),
                    path: projection.path,
                    started_at,
                });
            }
        }

        Ok(summaries)
    }
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

/// Merge the caller payload over workload defaults.
fn merged_workload(
    defaults: serde_json::Value,
    payload: serde_json::Value,
    deep: bool,
) -> serde_json::Value {
    if payload.is_null() {
        return defaults;
    }
    if deep {
        return deep_merge(defaults, payload);
    }

    match (defaults, payload) {
        (serde_json::Value::Object(mut base), serde_json::Value::Object(over)) => {
            for (k, v) in over {
                base.insert(k, v);
            }
            serde_json::Value::Object(base)
        }
        (_, payload) => payload,
    }
}

/// Recursive merge: objects merge key-wise, everything else is replaced.
fn deep_merge(base: serde_json::Value, over: serde_json::Value) -> serde_json::Value {
    match (base, over) {
        (serde_json::Value::Object(mut base), serde_json::Value::Object(over)) => {
            for (k, v) in over {
                let merged = match base.remove(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => v,
                };
                base.insert(k, merged);
            }
            serde_json::Value::Object(base)
        }
        (_, over) => over,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shallow_merge_overrides_keys() {
        let merged = merged_workload(
            serde_json::json!({"env": "dev", "db": {"host": "a", "port": 5432}}),
            serde_json::json!({"db": {"host": "b"}}),
            false,
        );
        assert_eq!(merged["env"], "dev");
        // Shallow: the whole db object is replaced.
        assert_eq!(merged["db"], serde_json::json!({"host": "b"}));
    }

    #[test]
    fn test_deep_merge_preserves_siblings() {
        let merged = merged_workload(
            serde_json::json!({"db": {"host": "a", "port": 5432}}),
            serde_json::json!({"db": {"host": "b"}}),
            true,
        );
        assert_eq!(merged["db"]["host"], "b");
        assert_eq!(merged["db"]["port"], 5432);
    }

    #[test]
    fn test_null_payload_keeps_defaults() {
        let merged = merged_workload(
            serde_json::json!({"env": "dev"}),
            serde_json::Value::Null,
            false,
        );
        assert_eq!(merged["env"], "dev");
    }
}
