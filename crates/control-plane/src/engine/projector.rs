//! Execution state reconstruction from events.
//!
//! `project` is a pure, deterministic fold from an event log prefix to the
//! execution's current state. All scheduling decisions derive from its
//! output; no other component assigns meaning to events.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::event::{Event, EventKind};

/// High-level execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecStatus::Running)
    }
}

impl std::fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Status of one step (or one loop child).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Enqueued,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, StepStatus::Enqueued | StepStatus::Running)
    }
}

/// One loop child of an iterator step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildSlot {
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// True once the broker recorded `iterator_child_completed`.
    pub settled: bool,
    /// Child execution spawned for this slot, when the iterator task is a
    /// sub-playbook.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_execution_id: Option<i64>,
}

/// Iterator bookkeeping for a step.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IteratorState {
    pub count: usize,
    /// Items resolved once at expansion time, replayed from the log.
    pub items: Vec<serde_json::Value>,
    pub children: BTreeMap<i32, ChildSlot>,
}

impl IteratorState {
    /// Children with a terminal status.
    pub fn terminal_children(&self) -> usize {
        self.children
            .values()
            .filter(|c| c.status.is_terminal())
            .count()
    }

    /// Children settled by `iterator_child_completed`.
    pub fn settled_children(&self) -> usize {
        self.children.values().filter(|c| c.settled).count()
    }

    /// Children currently enqueued or running.
    pub fn in_flight_children(&self) -> usize {
        self.children
            .values()
            .filter(|c| c.status.is_in_flight())
            .count()
    }
}

/// Projected state of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepProjection {
    pub status: StepStatus,
    /// Highest attempt observed.
    pub attempts: i32,
    /// Data payload of the latest completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Reason string of the latest failure, when provided.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// True once a `branch_taken` recorded this step's routing.
    pub routed: bool,
    /// Successor names the recorded routing selected.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selected: Vec<String>,
    /// Iterator bookkeeping when the step expanded a collection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterator: Option<IteratorState>,
    /// Child execution spawned for a playbook step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_execution_id: Option<i64>,
}

impl StepProjection {
    fn new(status: StepStatus) -> Self {
        Self {
            status,
            attempts: 0,
            last_result: None,
            last_error: None,
            failure_reason: None,
            started_at: None,
            finished_at: None,
            routed: false,
            selected: Vec::new(),
            iterator: None,
            child_execution_id: None,
        }
    }
}

/// Parent back-reference for sub-playbook executions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParentRef {
    pub execution_id: i64,
    pub step_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_index: Option<i32>,
}

/// Identity of one unit of in-flight work.
pub type AttemptKey = (String, i32, Option<i32>);

/// Complete projected state of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionProjection {
    pub execution_id: i64,
    pub status: ExecStatus,
    pub workload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentRef>,
    /// Playbook paths of this execution and its ancestors, root first.
    pub ancestors: Vec<String>,
    pub steps: BTreeMap<String, StepProjection>,
    /// Steps selected by routing but not yet touched, in selection order.
    pub pending_successors: Vec<String>,
    /// Extra args routing attached to selected successors.
    pub successor_args: BTreeMap<String, serde_json::Value>,
    /// Every successor selection in log order (dedup happens in
    /// `pending_successors`).
    routing_selected: Vec<String>,
    /// Attempts currently enqueued or running, loop children included.
    pub in_flight: BTreeSet<AttemptKey>,
    /// Attempt keys with a `step_started` in the log.
    started_keys: BTreeSet<AttemptKey>,
    /// Attempt keys with a terminal event in the log.
    terminal_keys: BTreeSet<AttemptKey>,
    /// Next seq for compare-and-append.
    pub next_seq: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Error message of a failed execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Aggregated output of a completed execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

impl ExecutionProjection {
    fn new(execution_id: i64) -> Self {
        Self {
            execution_id,
            status: ExecStatus::Running,
            workload: serde_json::Value::Object(Default::default()),
            path: None,
            version: None,
            catalog_id: None,
            parent: None,
            ancestors: Vec::new(),
            steps: BTreeMap::new(),
            pending_successors: Vec::new(),
            successor_args: BTreeMap::new(),
            routing_selected: Vec::new(),
            in_flight: BTreeSet::new(),
            started_keys: BTreeSet::new(),
            terminal_keys: BTreeSet::new(),
            next_seq: 0,
            started_at: None,
            finished_at: None,
            error: None,
            output: None,
        }
    }

    /// Whether `step_started` was already appended for this attempt key.
    pub fn has_started(&self, step: &str, attempt: i32, loop_index: Option<i32>) -> bool {
        self.started_keys
            .contains(&(step.to_string(), attempt, loop_index))
    }

    /// Whether a terminal event was already appended for this attempt key.
    pub fn has_terminal(&self, step: &str, attempt: i32, loop_index: Option<i32>) -> bool {
        self.terminal_keys
            .contains(&(step.to_string(), attempt, loop_index))
    }

    /// Steps currently enqueued or running (loop children count).
    pub fn has_work_in_flight(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// Names of successfully completed steps, in name order.
    pub fn completed_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|(_, s)| s.status == StepStatus::Completed)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// First failed step and its error, if any.
    pub fn first_failure(&self) -> Option<(&str, &str)> {
        self.steps
            .iter()
            .filter(|(_, s)| s.status == StepStatus::Failed)
            .map(|(name, s)| {
                (
                    name.as_str(),
                    s.last_error.as_deref().unwrap_or("step failed"),
                )
            })
            .next()
    }
}

/// Fold an ordered event log into the execution's projected state.
pub fn project(events: &[Event]) -> Option<ExecutionProjection> {
    let first = events.first()?;
    let mut state = ExecutionProjection::new(first.execution_id);

    for event in events {
        apply(&mut state, event);
        state.next_seq = event.seq + 1;
    }

    rebuild_derived(&mut state);
    Some(state)
}

/// Apply a single event.
fn apply(state: &mut ExecutionProjection, event: &Event) {
    let Some(kind) = event.kind() else {
        return;
    };

    match kind {
        EventKind::ExecutionStarted => {
            state.status = ExecStatus::Running;
            state.started_at = Some(event.created_at);
            if let Some(workload) = event.payload.get("workload") {
                state.workload = workload.clone();
            }
            state.path = event
                .payload
                .get("path")
                .and_then(|v| v.as_str())
                .map(String::from);
            state.version = event
                .payload
                .get("version")
                .and_then(|v| v.as_i64())
                .map(|v| v as i32);
            state.catalog_id = event.payload.get("catalog_id").and_then(|v| v.as_i64());
            state.parent = event
                .payload
                .get("parent")
                .and_then(|v| serde_json::from_value(v.clone()).ok());
            state.ancestors = event
                .payload
                .get("ancestors")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default();
        }
        EventKind::StepEnqueued => {
            let Some(name) = event.step_name.as_deref() else {
                return;
            };
            if let Some(loop_index) = event.loop_index {
                let step = entry(state, name);
                if let Some(iter) = step.iterator.as_mut() {
                    iter.children.insert(
                        loop_index,
                        ChildSlot {
                            status: StepStatus::Enqueued,
                            result: None,
                            error: None,
                            settled: false,
                            child_execution_id: None,
                        },
                    );
                }
            } else {
                let step = entry(state, name);
                step.status = StepStatus::Enqueued;
                step.attempts = step.attempts.max(event.attempt);
            }
        }
        EventKind::StepStarted => {
            let Some(name) = event.step_name.as_deref() else {
                return;
            };
            state
                .started_keys
                .insert((name.to_string(), event.attempt, event.loop_index));
            let created_at = event.created_at;
            let step = entry(state, name);
            if let Some(loop_index) = event.loop_index {
                if let Some(iter) = step.iterator.as_mut() {
                    if let Some(slot) = iter.children.get_mut(&loop_index) {
                        slot.status = StepStatus::Running;
                    }
                }
            } else {
                step.status = StepStatus::Running;
                step.started_at = Some(created_at);
            }
        }
        EventKind::StepProgress => {}
        EventKind::StepCompleted => {
            let Some(name) = event.step_name.as_deref() else {
                return;
            };
            state
                .terminal_keys
                .insert((name.to_string(), event.attempt, event.loop_index));
            let data = unwrap_data(&event.payload);
            let created_at = event.created_at;
            let step = entry(state, name);
            if let Some(loop_index) = event.loop_index {
                if let Some(iter) = step.iterator.as_mut() {
                    let prior = iter.children.get(&loop_index);
                    iter.children.insert(
                        loop_index,
                        ChildSlot {
                            status: StepStatus::Completed,
                            result: Some(data),
                            error: None,
                            settled: prior.map(|c| c.settled).unwrap_or(false),
                            child_execution_id: prior.and_then(|c| c.child_execution_id),
                        },
                    );
                }
            } else {
                step.status = StepStatus::Completed;
                step.last_result = Some(data);
                step.finished_at = Some(created_at);
            }
        }
        EventKind::StepFailed => {
            let Some(name) = event.step_name.as_deref() else {
                return;
            };
            state
                .terminal_keys
                .insert((name.to_string(), event.attempt, event.loop_index));
            let error = failure_message(&event.payload);
            let reason = event
                .payload
                .get("reason")
                .and_then(|v| v.as_str())
                .map(String::from);
            let created_at = event.created_at;
            let step = entry(state, name);
            if let Some(loop_index) = event.loop_index {
                if let Some(iter) = step.iterator.as_mut() {
                    let prior = iter.children.get(&loop_index);
                    iter.children.insert(
                        loop_index,
                        ChildSlot {
                            status: StepStatus::Failed,
                            result: None,
                            error: Some(error),
                            settled: prior.map(|c| c.settled).unwrap_or(false),
                            child_execution_id: prior.and_then(|c| c.child_execution_id),
                        },
                    );
                }
            } else {
                step.status = StepStatus::Failed;
                step.last_error = Some(error);
                step.failure_reason = reason;
                step.finished_at = Some(created_at);
            }
        }
        EventKind::StepSkipped => {
            let Some(name) = event.step_name.as_deref() else {
                return;
            };
            let step = state
                .steps
                .entry(name.to_string())
                .or_insert_with(|| StepProjection::new(StepStatus::Skipped));
            step.status = StepStatus::Skipped;
        }
        EventKind::BranchTaken => {
            let Some(name) = event.step_name.as_deref() else {
                return;
            };
            let mut selected_names = Vec::new();
            if let Some(selected) = event.payload.get("selected").and_then(|v| v.as_array()) {
                for target in selected {
                    let Some(target_name) = target.get("step").and_then(|v| v.as_str()) else {
                        continue;
                    };
                    selected_names.push(target_name.to_string());
                    state.routing_selected.push(target_name.to_string());
                    if let Some(args) = target.get("args").filter(|a| a.is_object()) {
                        state
                            .successor_args
                            .insert(target_name.to_string(), args.clone());
                    }
                }
            }
            let step = entry(state, name);
            step.routed = true;
            step.selected = selected_names;
        }
        EventKind::IteratorExpanded => {
            let Some(name) = event.step_name.as_deref() else {
                return;
            };
            let count = event
                .payload
                .get("count")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as usize;
            let items: Vec<serde_json::Value> = event
                .payload
                .get("items")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            let step = entry(state, name);
            step.status = StepStatus::Running;
            step.attempts = step.attempts.max(event.attempt);
            step.iterator = Some(IteratorState {
                count,
                items,
                children: BTreeMap::new(),
            });
        }
        EventKind::IteratorChildCompleted => {
            let Some(name) = event.step_name.as_deref() else {
                return;
            };
            let Some(loop_index) = event.loop_index else {
                return;
            };
            let step = entry(state, name);
            if let Some(iter) = step.iterator.as_mut() {
                if let Some(slot) = iter.children.get_mut(&loop_index) {
                    slot.settled = true;
                }
            }
        }
        EventKind::SubplaybookSpawned => {
            let Some(name) = event.step_name.as_deref() else {
                return;
            };
            let child = event
                .payload
                .get("child_execution_id")
                .and_then(|v| v.as_i64());
            let step = entry(state, name);
            step.attempts = step.attempts.max(event.attempt);
            if let Some(loop_index) = event.loop_index {
                // The iterator task is a sub-playbook: the spawn record is
                // the slot's enqueue equivalent.
                if let Some(iter) = step.iterator.as_mut() {
                    iter.children.insert(
                        loop_index,
                        ChildSlot {
                            status: StepStatus::Running,
                            result: None,
                            error: None,
                            settled: false,
                            child_execution_id: child,
                        },
                    );
                }
            } else {
                step.status = StepStatus::Running;
                step.child_execution_id = child;
            }
        }
        EventKind::ExecutionCompleted => {
            state.status = ExecStatus::Completed;
            state.finished_at = Some(event.created_at);
            state.output = event.payload.get("output").cloned();
        }
        EventKind::ExecutionFailed => {
            state.status = ExecStatus::Failed;
            state.finished_at = Some(event.created_at);
            state.error = event
                .payload
                .get("error")
                .and_then(|v| v.as_str())
                .map(String::from);
        }
        EventKind::ExecutionCancelled => {
            state.status = ExecStatus::Cancelled;
            state.finished_at = Some(event.created_at);
        }
    }
}

/// Recompute the in-flight set and pending successors after the fold.
fn rebuild_derived(state: &mut ExecutionProjection) {
    state.in_flight.clear();

    for (name, step) in &state.steps {
        if let Some(iter) = &step.iterator {
            for (idx, slot) in &iter.children {
                if slot.status.is_in_flight() {
                    state
                        .in_flight
                        .insert((name.clone(), step.attempts.max(1), Some(*idx)));
                }
            }
            // An expanded iterator stays in flight until its aggregate
            // terminal is recorded.
            if step.status.is_in_flight() || step.status == StepStatus::Running {
                state
                    .in_flight
                    .insert((name.clone(), step.attempts.max(1), None));
            }
        } else if step.status.is_in_flight() {
            state
                .in_flight
                .insert((name.clone(), step.attempts.max(1), None));
        }
    }

    state.pending_successors.clear();
    let mut seen = BTreeSet::new();
    for name in &state.routing_selected {
        if !state.steps.contains_key(name) && seen.insert(name.clone()) {
            state.pending_successors.push(name.clone());
        }
    }
}

fn entry<'a>(state: &'a mut ExecutionProjection, name: &str) -> &'a mut StepProjection {
    state
        .steps
        .entry(name.to_string())
        .or_insert_with(|| StepProjection::new(StepStatus::Enqueued))
}

/// Unwrap the worker result envelope: `{"data": ...}` yields the data
/// payload; anything else passes through.
fn unwrap_data(payload: &serde_json::Value) -> serde_json::Value {
    payload
        .get("data")
        .cloned()
        .unwrap_or_else(|| payload.clone())
}

fn failure_message(payload: &serde_json::Value) -> String {
    payload
        .get("detail")
        .or_else(|| payload.get("error"))
        .and_then(|v| v.as_str())
        .map(String::from)
        .unwrap_or_else(|| {
            payload
                .get("reason")
                .and_then(|v| v.as_str())
                .unwrap_or("step failed")
                .to_string()
        })
}

/// Check the gap-free seq invariant over an ordered log.
pub fn is_contiguous(events: &[Event]) -> bool {
    events
        .iter()
        .enumerate()
        .all(|(i, e)| e.seq == i as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::event::NewEvent;

    fn make_event(seq: i64, new: NewEvent) -> Event {
        Event {
            execution_id: 100,
            seq,
            kind: new.kind.as_str().to_string(),
            step_name: new.step_name,
            attempt: new.attempt,
            loop_index: new.loop_index,
            payload: new.payload,
            created_at: Utc::now(),
        }
    }

    fn started_event(seq: i64) -> Event {
        make_event(
            seq,
            NewEvent::execution(
                EventKind::ExecutionStarted,
                serde_json::json!({
                    "path": "ci/pipeline",
                    "version": 1,
                    "workload": {"env": "prod"},
                }),
            ),
        )
    }

    #[test]
    fn test_empty_log_projects_to_none() {
        assert!(project(&[]).is_none());
    }

    #[test]
    fn test_execution_started() {
        let state = project(&[started_event(0)]).unwrap();
        assert_eq!(state.status, ExecStatus::Running);
        assert_eq!(state.path.as_deref(), Some("ci/pipeline"));
        assert_eq!(state.workload["env"], "prod");
        assert_eq!(state.next_seq, 1);
    }

    #[test]
    fn test_step_lifecycle() {
        let events = vec![
            started_event(0),
            make_event(
                1,
                NewEvent::step(EventKind::StepEnqueued, "build", serde_json::json!({})),
            ),
            make_event(
                2,
                NewEvent::step(EventKind::StepStarted, "build", serde_json::json!({})),
            ),
            make_event(
                3,
                NewEvent::step(
                    EventKind::StepCompleted,
                    "build",
                    serde_json::json!({"data": {"artifact": "a.tar"}}),
                ),
            ),
        ];

        let state = project(&events).unwrap();
        let build = &state.steps["build"];
        assert_eq!(build.status, StepStatus::Completed);
        assert_eq!(build.last_result.as_ref().unwrap()["artifact"], "a.tar");
        assert!(state.has_started("build", 1, None));
        assert!(state.has_terminal("build", 1, None));
        assert!(!state.has_work_in_flight());
    }

    #[test]
    fn test_in_flight_tracking() {
        let events = vec![
            started_event(0),
            make_event(
                1,
                NewEvent::step(EventKind::StepEnqueued, "build", serde_json::json!({})),
            ),
            make_event(
                2,
                NewEvent::step(EventKind::StepStarted, "build", serde_json::json!({})),
            ),
        ];

        let state = project(&events).unwrap();
        assert!(state.has_work_in_flight());
        assert!(state
            .in_flight
            .contains(&("build".to_string(), 1, None)));
    }

    #[test]
    fn test_failure_projection() {
        let events = vec![
            started_event(0),
            make_event(
                1,
                NewEvent::step(EventKind::StepEnqueued, "build", serde_json::json!({})),
            ),
            make_event(
                2,
                NewEvent::step(EventKind::StepStarted, "build", serde_json::json!({})),
            ),
            make_event(
                3,
                NewEvent::step(
                    EventKind::StepFailed,
                    "build",
                    serde_json::json!({"reason": "tool_error", "detail": "exit 1"}),
                ),
            ),
        ];

        let state = project(&events).unwrap();
        let build = &state.steps["build"];
        assert_eq!(build.status, StepStatus::Failed);
        assert_eq!(build.last_error.as_deref(), Some("exit 1"));
        assert_eq!(build.failure_reason.as_deref(), Some("tool_error"));
        assert_eq!(state.first_failure(), Some(("build", "exit 1")));
    }

    #[test]
    fn test_retry_attempts_tracked() {
        let events = vec![
            started_event(0),
            make_event(
                1,
                NewEvent::step(EventKind::StepEnqueued, "flaky", serde_json::json!({})),
            ),
            make_event(
                2,
                NewEvent::step(EventKind::StepStarted, "flaky", serde_json::json!({})),
            ),
            make_event(
                3,
                NewEvent::step(
                    EventKind::StepFailed,
                    "flaky",
                    serde_json::json!({"reason": "tool_error"}),
                ),
            ),
            make_event(
                4,
                NewEvent::step(EventKind::StepEnqueued, "flaky", serde_json::json!({}))
                    .with_attempt(2),
            ),
            make_event(
                5,
                NewEvent::step(EventKind::StepStarted, "flaky", serde_json::json!({}))
                    .with_attempt(2),
            ),
            make_event(
                6,
                NewEvent::step(
                    EventKind::StepCompleted,
                    "flaky",
                    serde_json::json!({"data": {"ok": true}}),
                )
                .with_attempt(2),
            ),
        ];

        let state = project(&events).unwrap();
        let flaky = &state.steps["flaky"];
        assert_eq!(flaky.status, StepStatus::Completed);
        assert_eq!(flaky.attempts, 2);
        assert!(state.has_terminal("flaky", 1, None));
        assert!(state.has_terminal("flaky", 2, None));
    }

    #[test]
    fn test_iterator_projection() {
        let events = vec![
            started_event(0),
            make_event(
                1,
                NewEvent::step(
                    EventKind::IteratorExpanded,
                    "fanout",
                    serde_json::json!({"count": 2, "items": [{"id": 1}, {"id": 2}]}),
                ),
            ),
            make_event(
                2,
                NewEvent::step(EventKind::StepEnqueued, "fanout", serde_json::json!({}))
                    .with_loop_index(Some(0)),
            ),
            make_event(
                3,
                NewEvent::step(EventKind::StepEnqueued, "fanout", serde_json::json!({}))
                    .with_loop_index(Some(1)),
            ),
            make_event(
                4,
                NewEvent::step(
                    EventKind::StepCompleted,
                    "fanout",
                    serde_json::json!({"data": {"id": 2}}),
                )
                .with_loop_index(Some(1)),
            ),
        ];

        let state = project(&events).unwrap();
        let fanout = &state.steps["fanout"];
        let iter = fanout.iterator.as_ref().unwrap();
        assert_eq!(iter.count, 2);
        assert_eq!(iter.items.len(), 2);
        assert_eq!(iter.terminal_children(), 1);
        assert_eq!(iter.in_flight_children(), 1);
        assert_eq!(iter.children[&1].status, StepStatus::Completed);
        // Out-of-order completion recorded against the right slot.
        assert_eq!(iter.children[&1].result.as_ref().unwrap()["id"], 2);
    }

    #[test]
    fn test_subplaybook_children_per_loop_index() {
        let events = vec![
            started_event(0),
            make_event(
                1,
                NewEvent::step(
                    EventKind::IteratorExpanded,
                    "fanout",
                    serde_json::json!({"count": 2, "items": [{"id": 1}, {"id": 2}]}),
                ),
            ),
            make_event(
                2,
                NewEvent::step(
                    EventKind::SubplaybookSpawned,
                    "fanout",
                    serde_json::json!({"child_execution_id": 501, "path": "flows/child"}),
                )
                .with_loop_index(Some(0)),
            ),
            make_event(
                3,
                NewEvent::step(
                    EventKind::SubplaybookSpawned,
                    "fanout",
                    serde_json::json!({"child_execution_id": 502, "path": "flows/child"}),
                )
                .with_loop_index(Some(1)),
            ),
            make_event(
                4,
                NewEvent::step(
                    EventKind::StepCompleted,
                    "fanout",
                    serde_json::json!({"data": {"out": 2}}),
                )
                .with_loop_index(Some(1)),
            ),
        ];

        let state = project(&events).unwrap();
        let fanout = &state.steps["fanout"];
        // The step-level scalar is untouched by per-slot spawns.
        assert_eq!(fanout.child_execution_id, None);

        let iter = fanout.iterator.as_ref().unwrap();
        assert_eq!(iter.children[&0].child_execution_id, Some(501));
        assert_eq!(iter.children[&0].status, StepStatus::Running);
        // Settlement preserves the slot's child id.
        assert_eq!(iter.children[&1].child_execution_id, Some(502));
        assert_eq!(iter.children[&1].status, StepStatus::Completed);
        assert_eq!(iter.children[&1].result.as_ref().unwrap()["out"], 2);
    }

    #[test]
    fn test_terminal_execution_events() {
        let completed = project(&[
            started_event(0),
            make_event(
                1,
                NewEvent::execution(
                    EventKind::ExecutionCompleted,
                    serde_json::json!({"output": {"done": true}}),
                ),
            ),
        ])
        .unwrap();
        assert_eq!(completed.status, ExecStatus::Completed);
        assert_eq!(completed.output.as_ref().unwrap()["done"], true);

        let cancelled = project(&[
            started_event(0),
            make_event(
                1,
                NewEvent::execution(EventKind::ExecutionCancelled, serde_json::json!({})),
            ),
        ])
        .unwrap();
        assert_eq!(cancelled.status, ExecStatus::Cancelled);
        assert!(cancelled.status.is_terminal());
    }

    #[test]
    fn test_fold_is_idempotent() {
        let events = vec![
            started_event(0),
            make_event(
                1,
                NewEvent::step(EventKind::StepEnqueued, "a", serde_json::json!({})),
            ),
            make_event(
                2,
                NewEvent::step(
                    EventKind::StepCompleted,
                    "a",
                    serde_json::json!({"data": 1}),
                ),
            ),
        ];

        let first = serde_json::to_value(project(&events).unwrap()).unwrap();
        let second = serde_json::to_value(project(&events).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_fold_stable_under_independent_permutation() {
        // Events for disjoint steps may be observed in either interleaving;
        // the projection must agree.
        let a_then_b = vec![
            started_event(0),
            make_event(
                1,
                NewEvent::step(EventKind::StepEnqueued, "a", serde_json::json!({})),
            ),
            make_event(
                2,
                NewEvent::step(EventKind::StepEnqueued, "b", serde_json::json!({})),
            ),
            make_event(
                3,
                NewEvent::step(
                    EventKind::StepCompleted,
                    "a",
                    serde_json::json!({"data": "a"}),
                ),
            ),
            make_event(
                4,
                NewEvent::step(
                    EventKind::StepCompleted,
                    "b",
                    serde_json::json!({"data": "b"}),
                ),
            ),
        ];

        let b_then_a = vec![
            a_then_b[0].clone(),
            Event { seq: 1, ..a_then_b[2].clone() },
            Event { seq: 2, ..a_then_b[1].clone() },
            Event { seq: 3, ..a_then_b[4].clone() },
            Event { seq: 4, ..a_then_b[3].clone() },
        ];

        let left = project(&a_then_b).unwrap();
        let right = project(&b_then_a).unwrap();
        assert_eq!(
            serde_json::to_value(&left.steps).unwrap(),
            serde_json::to_value(&right.steps).unwrap()
        );
    }

    #[test]
    fn test_branch_taken_pending_successors() {
        let events = vec![
            started_event(0),
            make_event(
                1,
                NewEvent::step(
                    EventKind::StepCompleted,
                    "route",
                    serde_json::json!({"data": {}}),
                ),
            ),
            make_event(
                2,
                NewEvent::step(
                    EventKind::BranchTaken,
                    "route",
                    serde_json::json!({
                        "selected": [{"step": "prod_deploy", "args": {"region": "eu"}}],
                        "skipped": ["staging_deploy"],
                    }),
                ),
            ),
        ];

        let state = project(&events).unwrap();
        assert!(state.steps["route"].routed);
        assert_eq!(state.steps["route"].selected, vec!["prod_deploy"]);
        assert_eq!(state.pending_successors, vec!["prod_deploy"]);
        assert_eq!(state.successor_args["prod_deploy"]["region"], "eu");
    }

    #[test]
    fn test_contiguity_check() {
        let good = vec![started_event(0)];
        assert!(is_contiguous(&good));

        let bad = vec![started_event(1)];
        assert!(!is_contiguous(&bad));
    }
}
