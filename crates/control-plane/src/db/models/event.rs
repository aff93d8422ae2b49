//! Event model for execution event sourcing.
//!
//! All workflow state is derived from events in `noetl.event`. Events for
//! one execution form a gap-free sequence `0..n`; the primary key on
//! `(execution_id, seq)` is what turns an insert into compare-and-append.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Event kinds for workflow execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Execution created, workload bound
    ExecutionStarted,
    /// Job created for a step attempt
    StepEnqueued,
    /// Worker picked the job up and began executing
    StepStarted,
    /// Worker progress report for long-running tools
    StepProgress,
    /// Step attempt finished successfully
    StepCompleted,
    /// Step attempt failed
    StepFailed,
    /// Step unreachable, all incoming edges skipped
    StepSkipped,
    /// Routing decision recorded for a finished step
    BranchTaken,
    /// Iterator collection resolved into loop children
    IteratorExpanded,
    /// One loop child settled
    IteratorChildCompleted,
    /// Child execution created for a playbook step
    SubplaybookSpawned,
    /// Execution finished successfully (terminal)
    ExecutionCompleted,
    /// Execution failed (terminal)
    ExecutionFailed,
    /// Execution cancelled (terminal)
    ExecutionCancelled,
}

impl EventKind {
    /// Terminal kinds close the log: no events may follow.
    pub fn is_execution_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::ExecutionCompleted
                | EventKind::ExecutionFailed
                | EventKind::ExecutionCancelled
        )
    }

    /// Terminal kinds for one step attempt.
    pub fn is_step_terminal(&self) -> bool {
        matches!(self, EventKind::StepCompleted | EventKind::StepFailed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ExecutionStarted => "execution_started",
            EventKind::StepEnqueued => "step_enqueued",
            EventKind::StepStarted => "step_started",
            EventKind::StepProgress => "step_progress",
            EventKind::StepCompleted => "step_completed",
            EventKind::StepFailed => "step_failed",
            EventKind::StepSkipped => "step_skipped",
            EventKind::BranchTaken => "branch_taken",
            EventKind::IteratorExpanded => "iterator_expanded",
            EventKind::IteratorChildCompleted => "iterator_child_completed",
            EventKind::SubplaybookSpawned => "subplaybook_spawned",
            EventKind::ExecutionCompleted => "execution_completed",
            EventKind::ExecutionFailed => "execution_failed",
            EventKind::ExecutionCancelled => "execution_cancelled",
        }
    }

    /// Parse a kind from its wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "execution_started" => Some(EventKind::ExecutionStarted),
            "step_enqueued" => Some(EventKind::StepEnqueued),
            "step_started" => Some(EventKind::StepStarted),
            "step_progress" => Some(EventKind::StepProgress),
            "step_completed" => Some(EventKind::StepCompleted),
            "step_failed" => Some(EventKind::StepFailed),
            "step_skipped" => Some(EventKind::StepSkipped),
            "branch_taken" => Some(EventKind::BranchTaken),
            "iterator_expanded" => Some(EventKind::IteratorExpanded),
            "iterator_child_completed" => Some(EventKind::IteratorChildCompleted),
            "subplaybook_spawned" => Some(EventKind::SubplaybookSpawned),
            "execution_completed" => Some(EventKind::ExecutionCompleted),
            "execution_failed" => Some(EventKind::ExecutionFailed),
            "execution_cancelled" => Some(EventKind::ExecutionCancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Database event record.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Event {
    /// Execution identifier.
    pub execution_id: i64,

    /// Position in the execution's log, gap-free from 0.
    pub seq: i64,

    /// Event kind (wire name).
    pub kind: String,

    /// Step name, null for execution-level events.
    pub step_name: Option<String>,

    /// Attempt number (1-based).
    pub attempt: i32,

    /// Loop index for iterator children.
    pub loop_index: Option<i32>,

    /// Kind-specific structured payload.
    pub payload: serde_json::Value,

    /// When the event was appended.
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Typed kind, if recognized.
    pub fn kind(&self) -> Option<EventKind> {
        EventKind::parse(&self.kind)
    }
}

/// An event about to be appended; seq and timestamp are assigned by the log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewEvent {
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    pub attempt: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_index: Option<i32>,
    pub payload: serde_json::Value,
}

impl NewEvent {
    /// Execution-level event with no step attached.
    pub fn execution(kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            step_name: None,
            attempt: 1,
            loop_index: None,
            payload,
        }
    }

    /// Step-level event for attempt 1, no loop index.
    pub fn step(kind: EventKind, step_name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind,
            step_name: Some(step_name.into()),
            attempt: 1,
            loop_index: None,
            payload,
        }
    }

    pub fn with_attempt(mut self, attempt: i32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_loop_index(mut self, loop_index: Option<i32>) -> Self {
        self.loop_index = loop_index;
        self
    }
}

/// Outcome of a compare-and-append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Event written at the expected seq.
    Ok { seq: i64 },
    /// Another writer got there first; re-fold from `current_seq`.
    Conflict { current_seq: i64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            EventKind::ExecutionStarted,
            EventKind::StepEnqueued,
            EventKind::StepCompleted,
            EventKind::IteratorExpanded,
            EventKind::ExecutionCancelled,
        ] {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::parse("bogus"), None);
    }

    #[test]
    fn test_terminal_classification() {
        assert!(EventKind::ExecutionCompleted.is_execution_terminal());
        assert!(EventKind::ExecutionCancelled.is_execution_terminal());
        assert!(!EventKind::StepCompleted.is_execution_terminal());

        assert!(EventKind::StepCompleted.is_step_terminal());
        assert!(EventKind::StepFailed.is_step_terminal());
        assert!(!EventKind::StepStarted.is_step_terminal());
        assert!(!EventKind::StepSkipped.is_step_terminal());
    }

    #[test]
    fn test_new_event_builders() {
        let event = NewEvent::step(EventKind::StepEnqueued, "fetch", serde_json::json!({}))
            .with_attempt(2)
            .with_loop_index(Some(1));

        assert_eq!(event.step_name.as_deref(), Some("fetch"));
        assert_eq!(event.attempt, 2);
        assert_eq!(event.loop_index, Some(1));
    }
}
