//! Event log service.
//!
//! Owns the guarded append every writer goes through: the compare-and-set
//! on `(execution_id, seq)` plus the idempotency rules that give the system
//! exactly-once progression under at-least-once delivery.

use serde::{Deserialize, Serialize};

use crate::db::models::event::{AppendOutcome, Event, EventKind, NewEvent};
use crate::db::queries::event as queries;
use crate::db::DbPool;
use crate::engine::projector::project;
use crate::error::{AppError, AppResult};
use crate::nats::Notifier;
use crate::sanitize::sanitize_sensitive_data;

/// How many CAS rounds a publish attempts before giving up.
const MAX_PUBLISH_ROUNDS: usize = 16;

/// Result of publishing an event through the guarded path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum PublishOutcome {
    /// Appended at `seq`.
    Appended { seq: i64 },
    /// The same step/attempt/loop_index already has this class of event.
    /// The publication is a duplicate; the caller should treat its work as
    /// already done.
    Duplicate,
    /// The execution has a terminal event; nothing may follow. Workers
    /// release without publishing.
    ExecutionClosed,
}

/// Service for event log operations.
#[derive(Clone)]
pub struct EventService {
    pool: DbPool,
    notifier: Notifier,
}

impl EventService {
    pub fn new(pool: DbPool, notifier: Notifier) -> Self {
        Self { pool, notifier }
    }

    /// Publish one event with the full guard set: terminal executions
    /// reject everything, duplicate `step_started` and duplicate step
    /// terminals short-circuit, and seq conflicts re-fold and retry.
    pub async fn publish(
        &self,
        execution_id: i64,
        event: NewEvent,
    ) -> AppResult<PublishOutcome> {
        let event = NewEvent {
            payload: sanitize_sensitive_data(&event.payload),
            ..event
        };

        for _ in 0..MAX_PUBLISH_ROUNDS {
            let events = queries::read_all(&self.pool, execution_id).await?;
            if events.is_empty() {
                return Err(AppError::NotFound(format!(
                    "Execution not found: {}",
                    execution_id
                )));
            }

            let projection = project(&events).expect("non-empty log always projects");

            if projection.status.is_terminal() {
                return Ok(PublishOutcome::ExecutionClosed);
            }

            if let Some(step) = event.step_name.as_deref() {
                let duplicate = match event.kind {
                    EventKind::StepStarted => {
                        projection.has_started(step, event.attempt, event.loop_index)
                    }
                    EventKind::StepCompleted | EventKind::StepFailed => {
                        projection.has_terminal(step, event.attempt, event.loop_index)
                    }
                    _ => false,
                };
                if duplicate {
                    return Ok(PublishOutcome::Duplicate);
                }
            }

            match queries::append(&self.pool, execution_id, projection.next_seq, &event).await? {
                AppendOutcome::Ok { seq } => {
                    self.notifier.execution_changed(execution_id).await;
                    return Ok(PublishOutcome::Appended { seq });
                }
                AppendOutcome::Conflict { .. } => continue,
            }
        }

        Err(AppError::Internal(format!(
            "append contention on execution {} exceeded {} rounds",
            execution_id, MAX_PUBLISH_ROUNDS
        )))
    }

    /// Strict compare-and-append at a known seq. Used by the broker when
    /// applying a planned action list; a conflict aborts the whole apply.
    pub async fn append_at(
        &self,
        execution_id: i64,
        expected_seq: i64,
        event: &NewEvent,
    ) -> AppResult<AppendOutcome> {
        let event = NewEvent {
            payload: sanitize_sensitive_data(&event.payload),
            ..event.clone()
        };
        let outcome = queries::append(&self.pool, execution_id, expected_seq, &event).await?;
        if matches!(outcome, AppendOutcome::Ok { .. }) {
            self.notifier.execution_changed(execution_id).await;
        }
        Ok(outcome)
    }

    /// Open a brand-new execution log with its `execution_started` event.
    pub async fn open_log(
        &self,
        execution_id: i64,
        started: NewEvent,
    ) -> AppResult<AppendOutcome> {
        debug_assert_eq!(started.kind, EventKind::ExecutionStarted);
        self.append_at(execution_id, 0, &started).await
    }

    /// Full ordered log for an execution.
    pub async fn read_log(&self, execution_id: i64) -> AppResult<Vec<Event>> {
        queries::read_all(&self.pool, execution_id).await
    }

    /// Events from a seq onward.
    pub async fn read_since(&self, execution_id: i64, from_seq: i64) -> AppResult<Vec<Event>> {
        queries::read_since(&self.pool, execution_id, from_seq).await
    }

    /// Executions with no terminal event.
    pub async fn list_live(&self) -> AppResult<Vec<i64>> {
        queries::list_live_executions(&self.pool).await
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_outcome_serialization() {
        let appended = PublishOutcome::Appended { seq: 4 };
        let json = serde_json::to_string(&appended).unwrap();
        assert!(json.contains("\"outcome\":\"appended\""));
        assert!(json.contains("\"seq\":4"));

        let closed = PublishOutcome::ExecutionClosed;
        let json = serde_json::to_string(&closed).unwrap();
        assert!(json.contains("execution_closed"));
    }
}
