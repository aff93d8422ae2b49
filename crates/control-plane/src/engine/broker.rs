//! Broker: the persistent loop that advances every live execution.
//!
//! Correctness does not depend on this loop being a singleton. Any number
//! of broker instances may tick concurrently; every decision they apply
//! goes through the log's compare-and-append, so losers of a race drop
//! their action list, re-fold, and converge. The broker also owns every
//! clock-driven transition: lease expiry, step timeouts, execution
//! deadlines, and stale-worker sweeps.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;

use crate::config::AppConfig;
use crate::db::models::event::{AppendOutcome, Event, EventKind, NewEvent};
use crate::engine::interpreter::{plan, Action, ChildSpec, EngineSettings};
use crate::engine::projector::{project, ExecutionProjection, ParentRef, StepStatus};
use crate::error::{AppError, AppResult};
use crate::nats::Notifier;
use crate::playbook::Playbook;
use crate::services::{
    CatalogService, EventService, ExecutionService, JobQueueService, WorkerRegistryService,
};

/// The broker/scheduler.
#[derive(Clone)]
pub struct Broker {
    config: Arc<AppConfig>,
    events: EventService,
    catalog: CatalogService,
    queue: JobQueueService,
    registry: WorkerRegistryService,
    executions: ExecutionService,
    notifier: Notifier,
    settings: EngineSettings,
}

impl Broker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<AppConfig>,
        events: EventService,
        catalog: CatalogService,
        queue: JobQueueService,
        registry: WorkerRegistryService,
        executions: ExecutionService,
        notifier: Notifier,
    ) -> Self {
        let settings = EngineSettings {
            max_subplaybook_depth: config.max_subplaybook_depth,
        };
        Self {
            config,
            events,
            catalog,
            queue,
            registry,
            executions,
            notifier,
            settings,
        }
    }

    /// Run the broker loop until the process shuts down.
    pub async fn run(self) {
        let wake = self.notifier.local_wake();
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.broker_tick_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            tick_ms = self.config.broker_tick_ms,
            parallelism = self.config.broker_parallelism,
            "Broker started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = wake.notified() => {}
            }

            if let Err(e) = self.tick().await {
                tracing::error!(error = %e, "Broker tick failed");
            }
        }
    }

    /// One pass over everything that needs advancing.
    pub async fn tick(&self) -> AppResult<()> {
        self.sweep_expired_leases().await?;
        self.registry
            .sweep_stale(self.config.worker_stale_seconds)
            .await?;

        let live = self.events.list_live().await?;
        if live.is_empty() {
            return Ok(());
        }

        // Parallel across executions, serial within each; round-robin by
        // taking the live list in order every tick.
        let mut join_set: JoinSet<()> = JoinSet::new();
        for execution_id in live {
            while join_set.len() >= self.config.broker_parallelism {
                join_set.join_next().await;
            }
            let broker = self.clone();
            join_set.spawn(async move {
                if let Err(e) = broker.advance(execution_id).await {
                    tracing::warn!(execution_id, error = %e, "Execution tick failed");
                }
            });
        }
        while join_set.join_next().await.is_some() {}

        Ok(())
    }

    /// Advance one execution: fold, maintain, plan, apply.
    pub async fn advance(&self, execution_id: i64) -> AppResult<()> {
        let mut events = self.events.read_log(execution_id).await?;
        let Some(mut projection) = project(&events) else {
            return Ok(());
        };

        if projection.status.is_terminal() {
            // Cancellation may have raced with in-flight enqueues.
            self.queue.revoke_queued(execution_id).await?;
            return Ok(());
        }

        let playbook = self.load_playbook(&projection).await?;

        // Clock-driven maintenance appends, then re-fold if anything moved.
        let mut maintained = self.enforce_deadline(&projection, &playbook).await?;
        if !maintained {
            maintained |= self.settle_subplaybooks(&events, &projection).await?;
            maintained |= self.fail_timed_out_steps(&projection, &playbook).await?;
        }
        if maintained {
            events = self.events.read_log(execution_id).await?;
            projection = match project(&events) {
                Some(p) => p,
                None => return Ok(()),
            };
            if projection.status.is_terminal() {
                self.finish(execution_id, &projection).await?;
                return Ok(());
            }
        }

        let actions = plan(&projection, &playbook, &self.settings)?;
        if actions.is_empty() {
            return Ok(());
        }

        self.apply(&projection, actions).await
    }

    async fn load_playbook(&self, projection: &ExecutionProjection) -> AppResult<Playbook> {
        if let Some(catalog_id) = projection.catalog_id {
            let (_, playbook) = self.catalog.load_by_id(catalog_id).await?;
            return Ok(playbook);
        }
        let path = projection.path.as_deref().ok_or_else(|| {
            AppError::Internal(format!(
                "execution {} has no playbook reference",
                projection.execution_id
            ))
        })?;
        let (_, playbook) = self.catalog.load(path, projection.version).await?;
        Ok(playbook)
    }

    /// Apply one planned action list. Events first and strictly in order
    /// via compare-and-append; a conflict means another broker advanced
    /// this execution, so the whole list is dropped.
    async fn apply(&self, projection: &ExecutionProjection, actions: Vec<Action>) -> AppResult<()> {
        let execution_id = projection.execution_id;
        let mut seq = projection.next_seq;
        let mut closed = false;

        let deferred = self.saturated_tags(&actions).await?;

        for action in actions {
            match action {
                Action::Append(event) => {
                    if closed {
                        break;
                    }
                    // Backpressure: hold back the enqueue record together
                    // with its job.
                    if event.kind == EventKind::StepEnqueued {
                        if let Some(tag) = event
                            .payload
                            .get("capability_tag")
                            .and_then(|v| v.as_str())
                        {
                            if deferred.contains(tag) {
                                continue;
                            }
                        }
                    }

                    let terminal = event.kind.is_execution_terminal();
                    match self.events.append_at(execution_id, seq, &event).await? {
                        AppendOutcome::Ok { .. } => {
                            seq += 1;
                            closed = terminal;
                        }
                        AppendOutcome::Conflict { current_seq } => {
                            tracing::debug!(
                                execution_id,
                                expected = seq,
                                current_seq,
                                "Append conflict, dropping tick"
                            );
                            return Ok(());
                        }
                    }
                }
                Action::Enqueue(job) => {
                    if closed || deferred.contains(&job.capability_tag) {
                        continue;
                    }
                    self.queue.enqueue(job).await?;
                }
                Action::Spawn(spec) => {
                    if closed {
                        continue;
                    }
                    seq = self.spawn_child(execution_id, seq, spec).await?;
                }
            }
        }

        if closed {
            let events = self.events.read_log(execution_id).await?;
            if let Some(projection) = project(&events) {
                self.finish(execution_id, &projection).await?;
            }
        }

        Ok(())
    }

    /// Capability tags over the queue-depth ceiling this tick.
    async fn saturated_tags(&self, actions: &[Action]) -> AppResult<HashSet<String>> {
        let mut depths: HashMap<String, i64> = HashMap::new();
        let mut saturated = HashSet::new();

        for action in actions {
            if let Action::Enqueue(job) = action {
                if depths.contains_key(&job.capability_tag) {
                    continue;
                }
                let depth = self.queue.depth(&job.capability_tag).await?;
                depths.insert(job.capability_tag.clone(), depth);
                if depth >= self.config.queue_high_water {
                    tracing::warn!(
                        capability_tag = %job.capability_tag,
                        depth,
                        high_water = self.config.queue_high_water,
                        "Queue saturated, deferring enqueues"
                    );
                    saturated.insert(job.capability_tag.clone());
                }
            }
        }

        Ok(saturated)
    }

    /// Create a child execution for a sub-playbook step and record the
    /// spawn in the parent log. Returns the parent's next seq.
    async fn spawn_child(
        &self,
        execution_id: i64,
        seq: i64,
        spec: ChildSpec,
    ) -> AppResult<i64> {
        let entry = match self
            .catalog
            .load(&spec.path, spec.version)
            .await
        {
            Ok((entry, _)) => entry,
            Err(AppError::NotFound(_)) => {
                let failed = NewEvent::step(
                    EventKind::StepFailed,
                    &spec.parent_step,
                    serde_json::json!({
                        "reason": "playbook_not_found",
                        "detail": format!("no playbook registered at '{}'", spec.path),
                    }),
                );
                return match self.events.append_at(execution_id, seq, &failed).await? {
                    AppendOutcome::Ok { .. } => Ok(seq + 1),
                    AppendOutcome::Conflict { .. } => Ok(seq),
                };
            }
            Err(e) => return Err(e),
        };

        let child_execution_id =
            crate::db::queries::event::next_execution_id(self.events.pool()).await?;

        let spawned = NewEvent::step(
            EventKind::SubplaybookSpawned,
            &spec.parent_step,
            serde_json::json!({
                "child_execution_id": child_execution_id,
                "path": entry.path,
                "version": entry.version,
                "catalog_id": entry.catalog_id,
                "workload": spec.workload,
                "ancestors": spec.ancestors,
            }),
        )
        .with_loop_index(spec.parent_loop_index);

        match self.events.append_at(execution_id, seq, &spawned).await? {
            AppendOutcome::Ok { .. } => {}
            // Another broker spawned first; its child record wins.
            AppendOutcome::Conflict { .. } => return Ok(seq),
        }

        self.executions
            .create(
                child_execution_id,
                &entry.path,
                entry.version,
                entry.catalog_id,
                spec.workload,
                Some(ParentRef {
                    execution_id,
                    step_name: spec.parent_step.clone(),
                    loop_index: spec.parent_loop_index,
                }),
                &spec.ancestors,
            )
            .await?;

        self.notifier.execution_changed(child_execution_id).await;

        tracing::info!(
            execution_id,
            child_execution_id,
            path = %entry.path,
            step = %spec.parent_step,
            "Sub-playbook spawned"
        );

        Ok(seq + 1)
    }

    /// Terminal bookkeeping: propagate a finished child to its parent and
    /// clear any leftover queued jobs.
    async fn finish(&self, execution_id: i64, projection: &ExecutionProjection) -> AppResult<()> {
        self.queue.revoke_queued(execution_id).await?;

        if let Some(parent) = &projection.parent {
            self.settle_parent(parent, projection).await?;
        }
        Ok(())
    }

    /// Append the parent-side terminal for a finished child execution.
    async fn settle_parent(
        &self,
        parent: &ParentRef,
        child: &ExecutionProjection,
    ) -> AppResult<()> {
        let event = match child.status {
            crate::engine::projector::ExecStatus::Completed => NewEvent::step(
                EventKind::StepCompleted,
                &parent.step_name,
                serde_json::json!({
                    "data": child.output.clone().unwrap_or(serde_json::Value::Null),
                }),
            ),
            crate::engine::projector::ExecStatus::Failed => NewEvent::step(
                EventKind::StepFailed,
                &parent.step_name,
                serde_json::json!({
                    "reason": "subplaybook_failed",
                    "detail": child.error.clone().unwrap_or_else(|| "child execution failed".into()),
                }),
            ),
            crate::engine::projector::ExecStatus::Cancelled => NewEvent::step(
                EventKind::StepFailed,
                &parent.step_name,
                serde_json::json!({
                    "reason": "subplaybook_cancelled",
                    "detail": "child execution was cancelled",
                }),
            ),
            crate::engine::projector::ExecStatus::Running => return Ok(()),
        }
        .with_loop_index(parent.loop_index);

        // Guarded publish: duplicate settles collapse, terminal parents
        // reject.
        self.events.publish(parent.execution_id, event).await?;
        self.notifier.execution_changed(parent.execution_id).await;
        Ok(())
    }

    /// Pull-based child settlement for running sub-playbook work - both
    /// step-level calls and per-item children of playbook-task iterators -
    /// plus recreation of half-spawned children (crash between the spawn
    /// record and the child's first event).
    async fn settle_subplaybooks(
        &self,
        events: &[Event],
        projection: &ExecutionProjection,
    ) -> AppResult<bool> {
        let mut maintained = false;

        for (name, step) in &projection.steps {
            if step.status != StepStatus::Running {
                continue;
            }

            if let Some(iter) = &step.iterator {
                for (index, slot) in &iter.children {
                    if slot.status.is_terminal() {
                        continue;
                    }
                    let Some(child_id) = slot.child_execution_id else {
                        continue;
                    };
                    maintained |= self
                        .settle_child(events, projection, name, child_id, Some(*index))
                        .await?;
                }
                continue;
            }

            let Some(child_id) = step.child_execution_id else {
                continue;
            };
            maintained |= self
                .settle_child(events, projection, name, child_id, None)
                .await?;
        }

        Ok(maintained)
    }

    /// Settle (or recreate) one spawned child execution.
    async fn settle_child(
        &self,
        events: &[Event],
        projection: &ExecutionProjection,
        step_name: &str,
        child_id: i64,
        loop_index: Option<i32>,
    ) -> AppResult<bool> {
        let child_events = self.events.read_log(child_id).await?;
        if child_events.is_empty() {
            return self.recreate_child(events, step_name, child_id).await;
        }

        if let Some(child) = project(&child_events) {
            if child.status.is_terminal() {
                self.settle_parent(
                    &ParentRef {
                        execution_id: projection.execution_id,
                        step_name: step_name.to_string(),
                        loop_index,
                    },
                    &child,
                )
                .await?;
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Rebuild a child's `execution_started` from the spawn record.
    async fn recreate_child(
        &self,
        events: &[Event],
        step_name: &str,
        child_id: i64,
    ) -> AppResult<bool> {
        let Some(spawn) = events.iter().find(|e| {
            e.kind == EventKind::SubplaybookSpawned.as_str()
                && e.step_name.as_deref() == Some(step_name)
                && e.payload.get("child_execution_id").and_then(|v| v.as_i64()) == Some(child_id)
        }) else {
            return Ok(false);
        };

        let payload = &spawn.payload;
        let path = payload.get("path").and_then(|v| v.as_str()).unwrap_or_default();
        let version = payload.get("version").and_then(|v| v.as_i64()).unwrap_or(0) as i32;
        let catalog_id = payload.get("catalog_id").and_then(|v| v.as_i64()).unwrap_or(0);
        let workload = payload.get("workload").cloned().unwrap_or_default();
        let ancestors: Vec<String> = payload
            .get("ancestors")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        tracing::warn!(
            execution_id = spawn.execution_id,
            child_id,
            step = %step_name,
            "Recreating half-spawned child execution"
        );

        self.executions
            .create(
                child_id,
                path,
                version,
                catalog_id,
                workload,
                Some(ParentRef {
                    execution_id: spawn.execution_id,
                    step_name: step_name.to_string(),
                    loop_index: spawn.loop_index,
                }),
                &ancestors,
            )
            .await?;

        Ok(true)
    }

    /// Fail running steps whose timeout window lapsed without a terminal.
    async fn fail_timed_out_steps(
        &self,
        projection: &ExecutionProjection,
        playbook: &Playbook,
    ) -> AppResult<bool> {
        let now = Utc::now();
        let mut maintained = false;

        for (name, step) in &projection.steps {
            if step.status != StepStatus::Running {
                continue;
            }
            let Some(timeout) = playbook.get_step(name).and_then(|s| s.timeout) else {
                continue;
            };
            let Some(started_at) = step.started_at else {
                continue;
            };

            if now > started_at + chrono::Duration::seconds(timeout as i64) {
                let attempt = step.attempts.max(1);
                let event = NewEvent::step(
                    EventKind::StepFailed,
                    name,
                    serde_json::json!({
                        "reason": "timeout",
                        "detail": format!("no terminal event within {}s of step_started", timeout),
                    }),
                )
                .with_attempt(attempt);

                self.events.publish(projection.execution_id, event).await?;
                maintained = true;
            }
        }

        Ok(maintained)
    }

    /// Cancel executions past their deadline.
    async fn enforce_deadline(
        &self,
        projection: &ExecutionProjection,
        playbook: &Playbook,
    ) -> AppResult<bool> {
        let Some(deadline) = playbook.deadline else {
            return Ok(false);
        };
        let Some(started_at) = projection.started_at else {
            return Ok(false);
        };

        if Utc::now() > started_at + chrono::Duration::seconds(deadline as i64) {
            tracing::warn!(
                execution_id = projection.execution_id,
                deadline,
                "Execution deadline exceeded, cancelling"
            );
            self.executions.cancel(projection.execution_id).await?;
            return Ok(true);
        }

        Ok(false)
    }

    /// Lease expiry: the job went out but no terminal came back in time.
    /// The failure event retries per policy; a duplicate publish means the
    /// worker actually finished and only the ack was lost.
    async fn sweep_expired_leases(&self) -> AppResult<()> {
        for job in self.queue.expired_leases().await? {
            let key = job.key();
            let event = NewEvent::step(
                EventKind::StepFailed,
                &key.step_name,
                serde_json::json!({
                    "reason": "lease_expired",
                    "detail": format!(
                        "lease held by '{}' expired",
                        job.leased_by.as_deref().unwrap_or("unknown")
                    ),
                }),
            )
            .with_attempt(key.attempt)
            .with_loop_index(key.loop_index);

            let outcome = self.events.publish(key.execution_id, event).await;
            match outcome {
                Ok(_) => {}
                Err(AppError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }

            self.queue.remove(&key).await?;
            tracing::warn!(key = %key, "Job lease expired");
        }

        Ok(())
    }
}
