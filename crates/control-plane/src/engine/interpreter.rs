//! Scheduling decisions for one execution tick.
//!
//! `plan` consumes the projected state plus the playbook definition and
//! returns the ordered action list to apply: events to append, jobs to
//! enqueue, child executions to spawn. It is pure - no clock, no I/O - so
//! replaying any log prefix reproduces the original decisions and
//! concurrent brokers converge under the log's compare-and-append guard.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::event::{EventKind, NewEvent};
use crate::db::models::job::JobKey;
use crate::db::queries::job::EnqueueJob;
use crate::engine::context::build_context;
use crate::engine::iterator;
use crate::engine::projector::{ExecutionProjection, StepStatus};
use crate::error::{AppError, AppResult};
use crate::playbook::types::{CaseRule, NextTarget, OnError, PlaybookCallSpec, Step, ToolKind};
use crate::playbook::Playbook;
use crate::template::TemplateResolver;

/// Engine limits that shape planning decisions.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Recursion guard for nested playbook executions.
    pub max_subplaybook_depth: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_subplaybook_depth: 8,
        }
    }
}

/// Specification of a child execution to create.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChildSpec {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<i32>,
    pub workload: serde_json::Value,
    pub parent_step: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_loop_index: Option<i32>,
    /// Playbook paths of the parent chain, root first.
    pub ancestors: Vec<String>,
}

/// One scheduling action to apply to the log and queue.
#[derive(Debug, Clone)]
pub enum Action {
    /// Append an event (events are applied first, in order, via CAS).
    Append(NewEvent),
    /// Enqueue a job (idempotent by job key).
    Enqueue(EnqueueJob),
    /// Create a child execution for a sub-playbook step.
    Spawn(ChildSpec),
}

/// Compute this tick's actions for one execution.
pub fn plan(
    projection: &ExecutionProjection,
    playbook: &Playbook,
    settings: &EngineSettings,
) -> AppResult<Vec<Action>> {
    if projection.status.is_terminal() {
        return Ok(Vec::new());
    }

    let resolver = TemplateResolver::new();
    let ctx = build_context(projection, playbook);
    let mut tick = Tick {
        projection,
        playbook,
        settings,
        resolver: &resolver,
        ctx,
        actions: Vec::new(),
        scheduled: HashSet::new(),
        skipped: HashSet::new(),
        routed_args: HashMap::new(),
    };

    // Fresh execution: make the entry step ready.
    if projection.steps.is_empty() {
        let entry = playbook
            .entry_step()
            .ok_or_else(|| AppError::Validation("Workflow has no steps".to_string()))?;
        tick.schedule(entry, 1, None)?;
        return Ok(tick.actions);
    }

    // Exhausted failures first: they either retry, route (on_error:
    // continue), run their handler, or fail the whole execution.
    if tick.handle_failures()? {
        return Ok(tick.actions);
    }

    // Successors selected by earlier ticks but never scheduled (crash
    // between append and enqueue).
    for name in &projection.pending_successors {
        if let Some(step) = playbook.get_step(name) {
            tick.schedule_once(step)?;
        }
    }

    // Route steps that reached a terminal state this tick.
    tick.route_finished()?;

    // Skip propagation: a step is skipped only when every incoming edge is
    // resolved against it.
    tick.propagate_skips();

    // Drive expanded iterators: enqueue eligible children, settle finished
    // ones, aggregate when done.
    for step in &playbook.workflow {
        if step.tool == ToolKind::Iterator {
            iterator::advance(&mut tick, step)?;
        }
    }

    // Everything settled and nothing emitted: the execution is finished.
    if tick.actions.is_empty() && tick.is_quiescent() {
        let output = tick.aggregate_output();
        tick.actions.push(Action::Append(NewEvent::execution(
            EventKind::ExecutionCompleted,
            serde_json::json!({ "output": output }),
        )));
    }

    Ok(tick.actions)
}

/// Working state of one planning pass.
pub(crate) struct Tick<'a> {
    pub projection: &'a ExecutionProjection,
    pub playbook: &'a Playbook,
    pub settings: &'a EngineSettings,
    pub resolver: &'a TemplateResolver,
    pub ctx: HashMap<String, serde_json::Value>,
    pub actions: Vec<Action>,
    /// Steps scheduled during this tick.
    scheduled: HashSet<String>,
    /// Steps skip-marked during this tick.
    skipped: HashSet<String>,
    /// Args attached by routing decided in this tick, keyed by successor.
    routed_args: HashMap<String, serde_json::Value>,
}

impl<'a> Tick<'a> {
    /// Schedule a step unless the log or this tick already touched it.
    fn schedule_once(&mut self, step: &Step) -> AppResult<()> {
        if self.projection.steps.contains_key(&step.step)
            || self.scheduled.contains(&step.step)
            || self.skipped.contains(&step.step)
        {
            return Ok(());
        }
        self.schedule(step, 1, None)
    }

    /// Make a step ready: resolve its templates and emit the actions its
    /// tool kind calls for.
    fn schedule(
        &mut self,
        step: &Step,
        attempt: i32,
        not_before: Option<DateTime<Utc>>,
    ) -> AppResult<()> {
        self.scheduled.insert(step.step.clone());

        match step.tool {
            ToolKind::Iterator => iterator::expand(self, step, attempt),
            ToolKind::Playbook => self.spawn_subplaybook(step, attempt),
            _ => self.enqueue_tool_job(step, attempt, not_before),
        }
    }

    /// Resolve args for a step, merging any args routing attached.
    fn resolve_args(&self, step: &Step) -> AppResult<serde_json::Value> {
        let mut args = serde_json::Map::new();
        if let Some(step_args) = &step.args {
            for (k, v) in step_args {
                args.insert(k.clone(), v.clone());
            }
        }
        let routed = self
            .projection
            .successor_args
            .get(&step.step)
            .or_else(|| self.routed_args.get(&step.step));
        if let Some(extra) = routed.and_then(|v| v.as_object()) {
            for (k, v) in extra {
                args.insert(k.clone(), v.clone());
            }
        }
        self.resolver
            .resolve_value(&serde_json::Value::Object(args), &self.ctx)
    }

    /// Enqueue a worker job for an ordinary tool step.
    fn enqueue_tool_job(
        &mut self,
        step: &Step,
        attempt: i32,
        not_before: Option<DateTime<Utc>>,
    ) -> AppResult<()> {
        let resolved = self
            .resolve_args(step)
            .and_then(|args| Ok((args, self.resolver.resolve_value(&step.spec_value(), &self.ctx)?)));

        let (args, tool_spec) = match resolved {
            Ok(pair) => pair,
            Err(AppError::Resolution(detail)) => {
                // Unresolved references are deterministic: fail the attempt
                // without enqueuing, never retry.
                self.actions.push(Action::Append(
                    NewEvent::step(
                        EventKind::StepFailed,
                        &step.step,
                        serde_json::json!({
                            "reason": "unresolved_reference",
                            "detail": detail,
                        }),
                    )
                    .with_attempt(attempt),
                ));
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let payload = serde_json::json!({
            "capability_tag": step.capability_tag(),
            "tool": step.tool.to_string(),
            "not_before": not_before,
        });
        self.actions.push(Action::Append(
            NewEvent::step(EventKind::StepEnqueued, &step.step, payload).with_attempt(attempt),
        ));

        self.actions.push(Action::Enqueue(EnqueueJob {
            key: JobKey::new(self.projection.execution_id, &step.step, attempt, None),
            capability_tag: step.capability_tag().to_string(),
            tool_kind: step.tool.to_string(),
            tool_spec: with_kind(tool_spec, &step.tool.to_string()),
            context: self.job_context(args, None, None),
            save: step.save.clone(),
            timeout_seconds: step.timeout.map(|t| t as i64),
            not_before,
        }));

        Ok(())
    }

    /// Context snapshot shipped with a job: resolved args, iterator
    /// bindings, and the credential handles workers must resolve.
    pub(crate) fn job_context(
        &self,
        args: serde_json::Value,
        item: Option<&serde_json::Value>,
        loop_index: Option<i32>,
    ) -> serde_json::Value {
        let mut context = serde_json::json!({ "args": args });
        if let Some(item) = item {
            context["item"] = item.clone();
        }
        if let Some(idx) = loop_index {
            context["loop_index"] = serde_json::json!(idx);
        }
        if let Some(credentials) = &self.playbook.credentials {
            context["credentials"] = serde_json::to_value(credentials).unwrap_or_default();
        }
        context
    }

    /// Spawn a child execution for a playbook step.
    fn spawn_subplaybook(&mut self, step: &Step, attempt: i32) -> AppResult<()> {
        let resolved = self
            .resolver
            .resolve_value(&step.spec_value(), &self.ctx)
            .and_then(|spec| Ok((spec, self.resolve_args(step)?)));

        let (spec, workload) = match resolved {
            Ok(pair) => pair,
            Err(AppError::Resolution(detail)) => {
                self.actions.push(Action::Append(
                    NewEvent::step(
                        EventKind::StepFailed,
                        &step.step,
                        serde_json::json!({
                            "reason": "unresolved_reference",
                            "detail": detail,
                        }),
                    )
                    .with_attempt(attempt),
                ));
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let spec: PlaybookCallSpec = serde_json::from_value(spec)
            .map_err(|e| AppError::Validation(format!("invalid playbook spec: {}", e)))?;

        let mut ancestors = self.projection.ancestors.clone();
        if let Some(path) = &self.projection.path {
            ancestors.push(path.clone());
        }

        if ancestors.len() as u32 >= self.settings.max_subplaybook_depth {
            self.actions.push(Action::Append(
                NewEvent::step(
                    EventKind::StepFailed,
                    &step.step,
                    serde_json::json!({
                        "reason": "subplaybook_depth_exceeded",
                        "detail": format!(
                            "nesting depth {} reached calling '{}'",
                            ancestors.len(),
                            spec.path
                        ),
                    }),
                )
                .with_attempt(attempt),
            ));
            return Ok(());
        }

        self.actions.push(Action::Spawn(ChildSpec {
            path: spec.path,
            version: spec.version,
            workload,
            parent_step: step.step.clone(),
            parent_loop_index: None,
            ancestors,
        }));

        Ok(())
    }

    /// Retry, route, run handlers, or fail the execution for exhausted
    /// failures. Returns true when this tick is now fully decided.
    fn handle_failures(&mut self) -> AppResult<bool> {
        for step_def in &self.playbook.workflow {
            let Some(proj) = self.projection.steps.get(&step_def.step) else {
                continue;
            };
            if proj.status != StepStatus::Failed {
                continue;
            }

            // Retry while attempts remain, unless the failure is
            // deterministic.
            let max_attempts = step_def.retry.as_ref().map(|r| r.max).unwrap_or(1);
            let retryable = !matches!(
                proj.failure_reason.as_deref(),
                Some("unresolved_reference") | Some("subplaybook_depth_exceeded")
            );
            if retryable && proj.attempts < max_attempts {
                let backoff = step_def
                    .retry
                    .as_ref()
                    .map(|r| r.backoff_seconds)
                    .unwrap_or(0);
                let not_before = proj
                    .finished_at
                    .map(|t| t + Duration::seconds(backoff as i64));
                self.schedule(step_def, proj.attempts + 1, not_before)?;
                continue;
            }

            // Exhausted: on_error continue routes like a completion.
            if step_def.on_error() == OnError::Continue {
                continue;
            }

            // Flush the handler step before failing the execution.
            if let Some(handler_name) = &step_def.on_failure {
                match self.projection.steps.get(handler_name) {
                    None => {
                        let handler = self
                            .playbook
                            .get_step(handler_name)
                            .expect("validated on_failure reference");
                        self.schedule_once(handler)?;
                        return Ok(true);
                    }
                    Some(handler) if !handler.status.is_terminal() => return Ok(true),
                    Some(_) => {}
                }
            }

            let error = proj.last_error.clone().unwrap_or_else(|| "step failed".into());
            self.actions.push(Action::Append(NewEvent::execution(
                EventKind::ExecutionFailed,
                serde_json::json!({ "error": error, "step": step_def.step }),
            )));
            return Ok(true);
        }

        Ok(false)
    }

    /// Evaluate case/next for finished steps without a routing record,
    /// append `branch_taken`, and schedule the selected successors.
    fn route_finished(&mut self) -> AppResult<()> {
        for step_def in &self.playbook.workflow {
            let Some(proj) = self.projection.steps.get(&step_def.step) else {
                continue;
            };
            if proj.routed {
                continue;
            }

            let finished = match proj.status {
                StepStatus::Completed => true,
                StepStatus::Failed => step_def.on_error() == OnError::Continue,
                _ => false,
            };
            if !finished || step_def.routing_targets().is_empty() {
                continue;
            }

            let (selected, rule) = match self.evaluate_routing(step_def) {
                Ok(decision) => decision,
                Err(AppError::Resolution(detail)) => {
                    self.actions.push(Action::Append(NewEvent::execution(
                        EventKind::ExecutionFailed,
                        serde_json::json!({
                            "error": format!("routing failed: {}", detail),
                            "step": step_def.step,
                        }),
                    )));
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            let selected_names: Vec<&str> = selected.iter().map(|t| t.step.as_str()).collect();
            let skipped: Vec<&str> = step_def
                .routing_targets()
                .into_iter()
                .filter(|t| !selected_names.contains(t))
                .collect();

            let selected_payload: Vec<serde_json::Value> = selected
                .iter()
                .map(|t| {
                    let mut entry = serde_json::json!({ "step": t.step });
                    if let Some(args) = &t.args {
                        entry["args"] = serde_json::to_value(args).unwrap_or_default();
                    }
                    entry
                })
                .collect();

            self.actions.push(Action::Append(NewEvent::step(
                EventKind::BranchTaken,
                &step_def.step,
                serde_json::json!({
                    "selected": selected_payload,
                    "skipped": skipped,
                    "rule": rule,
                }),
            )));

            for target in &selected {
                if let Some(args) = &target.args {
                    // Args attached by this tick's routing are not yet in
                    // the projection; carry them to the scheduling path.
                    self.routed_args
                        .insert(target.step.clone(), serde_json::to_value(args)?);
                }
                let successor = self
                    .playbook
                    .get_step(&target.step)
                    .expect("validated routing reference");
                self.schedule_routed(successor)?;
            }
        }

        Ok(())
    }

    /// Schedule a successor selected by routing this tick.
    fn schedule_routed(&mut self, step: &Step) -> AppResult<()> {
        if self.projection.steps.contains_key(&step.step) || self.scheduled.contains(&step.step) {
            return Ok(());
        }
        self.schedule(step, 1, None)
    }

    /// First truthy when-rule wins; else-rules fall back; `next` is the
    /// unconditional form.
    fn evaluate_routing(&self, step: &Step) -> AppResult<(Vec<NextTarget>, String)> {
        if let Some(rules) = &step.case {
            for (index, rule) in rules.iter().enumerate() {
                if let Some(when) = &rule.when {
                    if self.resolver.evaluate_condition(when, &self.ctx)? {
                        return Ok((rule.then.clone(), index.to_string()));
                    }
                }
            }
            if let Some(fallback) = first_else(rules) {
                return Ok((fallback.to_vec(), "else".to_string()));
            }
            return Ok((Vec::new(), "none".to_string()));
        }

        if let Some(next) = &step.next {
            let targets = match next {
                crate::playbook::types::NextSpec::Single(name) => vec![NextTarget {
                    step: name.clone(),
                    args: None,
                }],
                crate::playbook::types::NextSpec::List(names) => names
                    .iter()
                    .map(|name| NextTarget {
                        step: name.clone(),
                        args: None,
                    })
                    .collect(),
                crate::playbook::types::NextSpec::Targets(targets) => targets.clone(),
            };
            return Ok((targets, "next".to_string()));
        }

        Ok((Vec::new(), "none".to_string()))
    }

    /// Mark steps skipped once every incoming edge resolved against them.
    ///
    /// Fan-in rule: a step with several predecessors goes down only when
    /// all of them are terminal (or themselves skipped) and none selected
    /// it. Iterates to a fixpoint so skips cascade through chains.
    fn propagate_skips(&mut self) {
        let preds = self.playbook.predecessors();
        let entry_name = self
            .playbook
            .entry_step()
            .map(|s| s.step.clone())
            .unwrap_or_default();

        loop {
            let mut changed = false;

            for step_def in &self.playbook.workflow {
                let name = step_def.step.as_str();
                if name == entry_name
                    || self.projection.steps.contains_key(name)
                    || self.scheduled.contains(name)
                    || self.skipped.contains(name)
                {
                    continue;
                }
                let Some(incoming) = preds.get(name) else {
                    // No routing edges at all (e.g. a bare on_failure
                    // handler): never auto-skipped.
                    continue;
                };

                let all_resolved_against = incoming.iter().all(|p| self.edge_resolved(p, name));
                if all_resolved_against {
                    self.skipped.insert(name.to_string());
                    self.actions.push(Action::Append(NewEvent::step(
                        EventKind::StepSkipped,
                        name,
                        serde_json::json!({}),
                    )));
                    changed = true;
                }
            }

            if !changed {
                break;
            }
        }
    }

    /// Whether predecessor `pred` has conclusively not selected `target`.
    fn edge_resolved(&self, pred: &str, target: &str) -> bool {
        if self.skipped.contains(pred) {
            return true;
        }
        // Selections made earlier in this same tick.
        for action in &self.actions {
            if let Action::Append(event) = action {
                if event.kind == EventKind::BranchTaken && event.step_name.as_deref() == Some(pred)
                {
                    let selected = event
                        .payload
                        .get("selected")
                        .and_then(|v| v.as_array())
                        .map(|arr| {
                            arr.iter()
                                .any(|t| t.get("step").and_then(|s| s.as_str()) == Some(target))
                        })
                        .unwrap_or(false);
                    return !selected;
                }
            }
        }
        match self.projection.steps.get(pred) {
            Some(p) if p.status == StepStatus::Skipped => true,
            Some(p) if p.routed => !p.selected.iter().any(|s| s == target),
            // A failed predecessor that will fail the execution resolves
            // nothing; handle_failures already owns that path.
            _ => false,
        }
    }

    /// No unfinished work anywhere: all touched steps terminal, nothing in
    /// flight, nothing selected but unscheduled.
    fn is_quiescent(&self) -> bool {
        !self.projection.has_work_in_flight()
            && self.projection.pending_successors.is_empty()
            && self
                .projection
                .steps
                .values()
                .all(|s| s.status.is_terminal())
    }

    /// Aggregated output: data of completed leaf steps (no routing).
    fn aggregate_output(&self) -> serde_json::Value {
        let mut output = serde_json::Map::new();
        for step_def in &self.playbook.workflow {
            if !step_def.routing_targets().is_empty() {
                continue;
            }
            if let Some(proj) = self.projection.steps.get(&step_def.step) {
                if proj.status == StepStatus::Completed {
                    output.insert(
                        step_def.step.clone(),
                        proj.last_result.clone().unwrap_or(serde_json::Value::Null),
                    );
                }
            }
        }
        serde_json::Value::Object(output)
    }
}

fn first_else(rules: &[CaseRule]) -> Option<&[NextTarget]> {
    rules
        .iter()
        .find(|r| !r.otherwise.is_empty())
        .map(|r| r.otherwise.as_slice())
}

/// Attach the tool kind to a resolved spec object.
fn with_kind(mut spec: serde_json::Value, kind: &str) -> serde_json::Value {
    if let Some(obj) = spec.as_object_mut() {
        obj.insert("kind".to_string(), serde_json::json!(kind));
    }
    spec
}
