//! In-memory execution harness for engine tests.
//!
//! Simulates the broker's apply loop and a worker pool against Vec-backed
//! logs, with a manually advanced clock so retry backoff and timeout
//! behavior are testable without sleeping.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};

use crate::db::models::event::{Event, EventKind, NewEvent};
use crate::db::queries::job::EnqueueJob;
use crate::engine::interpreter::{plan, Action, EngineSettings};
use crate::engine::projector::{project, ExecStatus, ExecutionProjection, ParentRef};
use crate::error::AppResult;
use crate::playbook::{parse_playbook, Playbook};
use crate::services::event::PublishOutcome;

pub struct Harness {
    pub logs: BTreeMap<i64, Vec<Event>>,
    pub jobs: Vec<EnqueueJob>,
    playbooks: HashMap<String, (i64, i32, Playbook)>,
    pub now: DateTime<Utc>,
    pub settings: EngineSettings,
    next_id: i64,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            logs: BTreeMap::new(),
            jobs: Vec::new(),
            playbooks: HashMap::new(),
            now: Utc::now(),
            settings: EngineSettings::default(),
            next_id: 1000,
        }
    }

    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn advance_clock(&mut self, seconds: i64) {
        self.now = self.now + Duration::seconds(seconds);
    }

    /// Register a playbook under its metadata.path.
    pub fn register(&mut self, yaml: &str) -> String {
        let playbook = parse_playbook(yaml).expect("harness playbook must parse");
        let path = playbook
            .path()
            .unwrap_or(playbook.name())
            .to_string();
        let catalog_id = self.next_id();
        self.playbooks.insert(path.clone(), (catalog_id, 1, playbook));
        path
    }

    fn playbook_for(&self, projection: &ExecutionProjection) -> Playbook {
        let path = projection.path.as_deref().expect("execution has a path");
        self.playbooks[path].2.clone()
    }

    /// Start an execution with a shallow payload-over-defaults merge.
    pub fn start(&mut self, path: &str, payload: serde_json::Value) -> i64 {
        let (catalog_id, version, playbook) = self.playbooks[path].clone();

        let mut workload = playbook
            .workload
            .clone()
            .unwrap_or_else(|| serde_json::json!({}));
        if let (Some(base), Some(over)) = (workload.as_object().cloned(), payload.as_object()) {
            let mut merged = base;
            for (k, v) in over {
                merged.insert(k.clone(), v.clone());
            }
            workload = serde_json::Value::Object(merged);
        }

        let execution_id = self.next_id();
        self.open_log(
            execution_id,
            path,
            version,
            catalog_id,
            workload,
            None,
            Vec::new(),
        );
        execution_id
    }

    #[allow(clippy::too_many_arguments)]
    fn open_log(
        &mut self,
        execution_id: i64,
        path: &str,
        version: i32,
        catalog_id: i64,
        workload: serde_json::Value,
        parent: Option<ParentRef>,
        ancestors: Vec<String>,
    ) {
        let mut payload = serde_json::json!({
            "path": path,
            "version": version,
            "catalog_id": catalog_id,
            "workload": workload,
            "ancestors": ancestors,
        });
        if let Some(parent) = parent {
            payload["parent"] = serde_json::to_value(parent).unwrap();
        }

        let event = self.materialize(
            execution_id,
            0,
            NewEvent::execution(EventKind::ExecutionStarted, payload),
        );
        self.logs.insert(execution_id, vec![event]);
    }

    fn materialize(&self, execution_id: i64, seq: i64, new: NewEvent) -> Event {
        Event {
            execution_id,
            seq,
            kind: new.kind.as_str().to_string(),
            step_name: new.step_name,
            attempt: new.attempt,
            loop_index: new.loop_index,
            payload: new.payload,
            created_at: self.now,
        }
    }

    pub fn events(&self, execution_id: i64) -> &[Event] {
        &self.logs[&execution_id]
    }

    pub fn kinds(&self, execution_id: i64) -> Vec<String> {
        self.events(execution_id)
            .iter()
            .map(|e| e.kind.clone())
            .collect()
    }

    pub fn projection(&self, execution_id: i64) -> ExecutionProjection {
        project(&self.logs[&execution_id]).expect("log is non-empty")
    }

    /// Guarded publish mirroring the event service: terminal logs reject,
    /// duplicate starts/terminals collapse.
    pub fn publish(&mut self, execution_id: i64, event: NewEvent) -> PublishOutcome {
        let projection = self.projection(execution_id);

        if projection.status.is_terminal() {
            return PublishOutcome::ExecutionClosed;
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
                return PublishOutcome::Duplicate;
            }
        }

        let seq = projection.next_seq;
        let event = self.materialize(execution_id, seq, event);
        self.logs.get_mut(&execution_id).unwrap().push(event);
        PublishOutcome::Appended { seq }
    }

    /// One interpreter tick for one execution; returns how many actions
    /// were applied.
    pub fn tick(&mut self, execution_id: i64) -> AppResult<usize> {
        let projection = self.projection(execution_id);
        if projection.status.is_terminal() {
            return Ok(0);
        }
        let playbook = self.playbook_for(&projection);
        let actions = plan(&projection, &playbook, &self.settings)?;
        let count = actions.len();
        self.apply(execution_id, projection.next_seq, actions);
        Ok(count)
    }

    fn apply(&mut self, execution_id: i64, mut seq: i64, actions: Vec<Action>) {
        let mut closed = false;
        for action in actions {
            match action {
                Action::Append(event) => {
                    if closed {
                        break;
                    }
                    let terminal = event.kind.is_execution_terminal();
                    let event = self.materialize(execution_id, seq, event);
                    self.logs.get_mut(&execution_id).unwrap().push(event);
                    seq += 1;
                    closed = terminal;
                }
                Action::Enqueue(job) => {
                    if closed {
                        continue;
                    }
                    self.jobs.push(job);
                }
                Action::Spawn(spec) => {
                    if closed {
                        continue;
                    }
                    let child_id = self.next_id();
                    let (catalog_id, version, _) = self.playbooks[&spec.path].clone();

                    let spawned = self.materialize(
                        execution_id,
                        seq,
                        NewEvent::step(
                            EventKind::SubplaybookSpawned,
                            &spec.parent_step,
                            serde_json::json!({
                                "child_execution_id": child_id,
                                "path": spec.path,
                                "version": version,
                                "catalog_id": catalog_id,
                                "workload": spec.workload.clone(),
                                "ancestors": spec.ancestors.clone(),
                            }),
                        )
                        .with_loop_index(spec.parent_loop_index),
                    );
                    self.logs.get_mut(&execution_id).unwrap().push(spawned);
                    seq += 1;

                    self.open_log(
                        child_id,
                        &spec.path,
                        version,
                        catalog_id,
                        spec.workload,
                        Some(ParentRef {
                            execution_id,
                            step_name: spec.parent_step,
                            loop_index: spec.parent_loop_index,
                        }),
                        spec.ancestors,
                    );
                }
            }
        }
    }

    /// Propagate finished children to their parents, broker-style.
    fn settle_parents(&mut self) -> bool {
        let mut settled = false;
        let ids: Vec<i64> = self.logs.keys().copied().collect();
        for id in ids {
            let projection = self.projection(id);
            if !projection.status.is_terminal() {
                continue;
            }
            let Some(parent) = projection.parent.clone() else {
                continue;
            };

            let event = match projection.status {
                ExecStatus::Completed => NewEvent::step(
                    EventKind::StepCompleted,
                    &parent.step_name,
                    serde_json::json!({
                        "data": projection.output.clone().unwrap_or(serde_json::Value::Null)
                    }),
                ),
                ExecStatus::Failed => NewEvent::step(
                    EventKind::StepFailed,
                    &parent.step_name,
                    serde_json::json!({
                        "reason": "subplaybook_failed",
                        "detail": projection
                            .error
                            .clone()
                            .unwrap_or_else(|| "child execution failed".into()),
                    }),
                ),
                _ => continue,
            }
            .with_loop_index(parent.loop_index);

            if matches!(
                self.publish(parent.execution_id, event),
                PublishOutcome::Appended { .. }
            ) {
                settled = true;
            }
        }
        settled
    }

    /// Tick every live execution until nothing moves. Workers are driven
    /// separately via the `complete_*` helpers.
    pub fn run(&mut self) {
        for _ in 0..64 {
            let mut moved = self.settle_parents();
            let ids: Vec<i64> = self.logs.keys().copied().collect();
            for id in ids {
                moved |= self.tick(id).expect("tick must plan") > 0;
            }
            if !moved {
                return;
            }
        }
        panic!("harness did not quiesce within 64 rounds");
    }

    fn leasable(&self, job: &EnqueueJob) -> bool {
        job.not_before.map(|t| t <= self.now).unwrap_or(true)
    }

    /// Complete the first leasable job matching the predicate.
    pub fn complete_job_where<F>(&mut self, pred: F, data: serde_json::Value)
    where
        F: Fn(&EnqueueJob) -> bool,
    {
        let index = self
            .jobs
            .iter()
            .position(|j| self.leasable(j) && pred(j))
            .expect("no matching leasable job");
        let job = self.jobs.remove(index);

        let started = NewEvent::step(EventKind::StepStarted, &job.key.step_name, serde_json::json!({"worker": "sim"}))
            .with_attempt(job.key.attempt)
            .with_loop_index(job.key.loop_index);
        let completed = NewEvent::step(
            EventKind::StepCompleted,
            &job.key.step_name,
            serde_json::json!({"data": data}),
        )
        .with_attempt(job.key.attempt)
        .with_loop_index(job.key.loop_index);

        let execution_id = job.key.execution_id;
        self.publish(execution_id, started);
        self.publish(execution_id, completed);
    }

    /// Complete the first leasable job.
    pub fn complete_next_job(&mut self, data: serde_json::Value) {
        self.complete_job_where(|_| true, data);
    }

    /// Fail the first leasable job matching the predicate.
    pub fn fail_job_where<F>(&mut self, pred: F, reason: &str, detail: &str)
    where
        F: Fn(&EnqueueJob) -> bool,
    {
        let index = self
            .jobs
            .iter()
            .position(|j| self.leasable(j) && pred(j))
            .expect("no matching leasable job");
        let job = self.jobs.remove(index);

        let started = NewEvent::step(EventKind::StepStarted, &job.key.step_name, serde_json::json!({"worker": "sim"}))
            .with_attempt(job.key.attempt)
            .with_loop_index(job.key.loop_index);
        let failed = NewEvent::step(
            EventKind::StepFailed,
            &job.key.step_name,
            serde_json::json!({"reason": reason, "detail": detail}),
        )
        .with_attempt(job.key.attempt)
        .with_loop_index(job.key.loop_index);

        let execution_id = job.key.execution_id;
        self.publish(execution_id, started);
        self.publish(execution_id, failed);
    }

    pub fn fail_next_job(&mut self, reason: &str, detail: &str) {
        self.fail_job_where(|_| true, reason, detail);
    }

    /// Jobs currently leasable (clock-gated jobs excluded).
    pub fn leasable_jobs(&self) -> Vec<&EnqueueJob> {
        self.jobs.iter().filter(|j| self.leasable(j)).collect()
    }
}
