//! Iterator fan-out/fan-in planning.
//!
//! An iterator step resolves its collection exactly once; the resolved
//! items are persisted in the `iterator_expanded` payload so replays and
//! competing brokers never re-resolve them. Children are jobs keyed by
//! `loop_index`; the aggregate result preserves item order regardless of
//! completion order.

use crate::db::models::event::{EventKind, NewEvent};
use crate::db::models::job::JobKey;
use crate::db::queries::job::EnqueueJob;
use crate::engine::context::bind_item;
use crate::engine::interpreter::{Action, ChildSpec, Tick};
use crate::engine::projector::{IteratorState, StepStatus};
use crate::error::{AppError, AppResult};
use crate::playbook::types::{IteratorSpec, PlaybookCallSpec, Step, ToolKind};

/// Expand a ready iterator step: resolve the collection, record the
/// expansion, and enqueue the first batch of children.
pub(crate) fn expand(tick: &mut Tick<'_>, step: &Step, attempt: i32) -> AppResult<()> {
    let spec: IteratorSpec = serde_json::from_value(step.spec_value())
        .map_err(|e| AppError::Validation(format!("invalid iterator spec: {}", e)))?;

    let items = match resolve_collection(tick, &spec) {
        Ok(items) => items,
        Err(AppError::Resolution(detail)) => {
            tick.actions.push(Action::Append(
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

    tick.actions.push(Action::Append(
        NewEvent::step(
            EventKind::IteratorExpanded,
            &step.step,
            serde_json::json!({
                "count": items.len(),
                "items": items,
                "mode": spec.mode,
            }),
        )
        .with_attempt(attempt),
    ));

    if items.is_empty() {
        // Nothing to fan out; the aggregate is an empty list.
        tick.actions.push(Action::Append(
            NewEvent::step(
                EventKind::StepCompleted,
                &step.step,
                serde_json::json!({"data": []}),
            )
            .with_attempt(attempt),
        ));
        return Ok(());
    }

    let initial = spec.mode.max_in_flight(items.len()).min(items.len());
    for (index, item) in items.iter().take(initial).enumerate() {
        enqueue_child(tick, step, &spec, attempt, index as i32, item)?;
    }

    Ok(())
}

/// Advance an already-expanded iterator: settle finished children, enqueue
/// the next eligible ones, and aggregate when everything is decided.
pub(crate) fn advance(tick: &mut Tick<'_>, step: &Step) -> AppResult<()> {
    let Some(proj) = tick.projection.steps.get(&step.step) else {
        return Ok(());
    };
    if proj.status.is_terminal() {
        return Ok(());
    }
    let Some(iter) = proj.iterator.as_ref() else {
        return Ok(());
    };

    let spec: IteratorSpec = serde_json::from_value(step.spec_value())
        .map_err(|e| AppError::Validation(format!("invalid iterator spec: {}", e)))?;
    let attempt = proj.attempts.max(1);

    // Mirror child terminals with the settle marker the aggregate waits on.
    let mut settled_now = 0usize;
    for (index, slot) in &iter.children {
        if slot.status.is_terminal() && !slot.settled {
            settled_now += 1;
            tick.actions.push(Action::Append(
                NewEvent::step(
                    EventKind::IteratorChildCompleted,
                    &step.step,
                    serde_json::json!({
                        "status": slot.status,
                        "result": slot.result,
                        "error": slot.error,
                    }),
                )
                .with_attempt(attempt)
                .with_loop_index(Some(*index)),
            ));
        }
    }

    let failed_children = iter
        .children
        .values()
        .filter(|c| c.status == StepStatus::Failed)
        .count();
    let aborted = failed_children > 0 && !spec.continue_on_error;

    // Enqueue the next children in strict index order while the mode's
    // in-flight bound allows.
    let mut in_flight = iter.in_flight_children();
    let budget = spec.mode.max_in_flight(iter.count);
    if !aborted {
        for index in 0..iter.count {
            if in_flight >= budget {
                break;
            }
            let idx = index as i32;
            if iter.children.contains_key(&idx) {
                continue;
            }
            if !predecessors_done(&spec, iter, index) {
                break;
            }
            let item = iter
                .items
                .get(index)
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            enqueue_child(tick, step, &spec, attempt, idx, &item)?;
            in_flight += 1;
        }
    }

    // Aggregate once no child is running (including any enqueued this
    // tick), none remains to schedule, and every terminal child has its
    // settle marker (counting this tick's).
    let all_created = iter.children.len() == iter.count;
    let done_scheduling = aborted || all_created;
    let all_settled = iter.settled_children() + settled_now == iter.terminal_children();
    if done_scheduling && all_settled && in_flight == 0 {
        if aborted {
            let first_error = iter
                .children
                .values()
                .find_map(|c| c.error.clone())
                .unwrap_or_else(|| "iterator child failed".to_string());
            tick.actions.push(Action::Append(
                NewEvent::step(
                    EventKind::StepFailed,
                    &step.step,
                    serde_json::json!({
                        "reason": "iterator_child_failed",
                        "detail": first_error,
                    }),
                )
                .with_attempt(attempt),
            ));
        } else {
            // Ordered by loop_index; failed slots surface as null under
            // continue_on_error.
            let results: Vec<serde_json::Value> = (0..iter.count)
                .map(|i| {
                    iter.children
                        .get(&(i as i32))
                        .and_then(|c| c.result.clone())
                        .unwrap_or(serde_json::Value::Null)
                })
                .collect();
            tick.actions.push(Action::Append(
                NewEvent::step(
                    EventKind::StepCompleted,
                    &step.step,
                    serde_json::json!({"data": results}),
                )
                .with_attempt(attempt),
            ));
        }
    }

    Ok(())
}

/// Sequential mode requires every earlier child to be terminal, and
/// successful unless continue_on_error.
fn predecessors_done(spec: &IteratorSpec, iter: &IteratorState, index: usize) -> bool {
    use crate::playbook::types::{IteratorMode, SimpleMode};

    if !matches!(spec.mode, IteratorMode::Simple(SimpleMode::Sequential)) {
        return true;
    }

    (0..index).all(|i| {
        iter.children
            .get(&(i as i32))
            .map(|c| {
                c.status == StepStatus::Completed
                    || (spec.continue_on_error && c.status.is_terminal())
            })
            .unwrap_or(false)
    })
}

fn enqueue_child(
    tick: &mut Tick<'_>,
    step: &Step,
    spec: &IteratorSpec,
    attempt: i32,
    index: i32,
    item: &serde_json::Value,
) -> AppResult<()> {
    let child_ctx = bind_item(&tick.ctx, item, index);

    let resolved = tick
        .resolver
        .resolve_value(
            &serde_json::to_value(&spec.task.spec)
                .map_err(|e| AppError::Internal(e.to_string()))?,
            &child_ctx,
        )
        .and_then(|tool_spec| {
            let args = tick.resolver.resolve_value(
                &serde_json::to_value(&spec.task.args)
                    .map_err(|e| AppError::Internal(e.to_string()))?,
                &child_ctx,
            )?;
            Ok((tool_spec, args))
        });

    let (mut tool_spec, args) = match resolved {
        Ok(pair) => pair,
        Err(AppError::Resolution(detail)) => {
            tick.actions.push(Action::Append(
                NewEvent::step(
                    EventKind::StepFailed,
                    &step.step,
                    serde_json::json!({
                        "reason": "unresolved_reference",
                        "detail": detail,
                    }),
                )
                .with_attempt(attempt)
                .with_loop_index(Some(index)),
            ));
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    // A playbook task fans a child execution out per item; the spawn
    // record stands in for the slot's enqueue.
    if spec.task.tool == ToolKind::Playbook {
        return spawn_child_execution(tick, step, attempt, index, tool_spec, args);
    }

    if let Some(obj) = tool_spec.as_object_mut() {
        obj.insert(
            "kind".to_string(),
            serde_json::json!(spec.task.tool.to_string()),
        );
    }

    tick.actions.push(Action::Append(
        NewEvent::step(
            EventKind::StepEnqueued,
            &step.step,
            serde_json::json!({
                "capability_tag": step.capability_tag(),
                "tool": spec.task.tool.to_string(),
            }),
        )
        .with_attempt(attempt)
        .with_loop_index(Some(index)),
    ));

    tick.actions.push(Action::Enqueue(EnqueueJob {
        key: JobKey::new(
            tick.projection.execution_id,
            &step.step,
            attempt,
            Some(index),
        ),
        capability_tag: step.capability_tag().to_string(),
        tool_kind: spec.task.tool.to_string(),
        tool_spec,
        context: tick.job_context(args, Some(item), Some(index)),
        save: step.save.clone(),
        timeout_seconds: step.timeout.map(|t| t as i64),
        not_before: None,
    }));

    Ok(())
}

/// Spawn one sub-playbook child for a loop slot, with the same ancestor
/// depth guard as step-level playbook calls.
fn spawn_child_execution(
    tick: &mut Tick<'_>,
    step: &Step,
    attempt: i32,
    index: i32,
    tool_spec: serde_json::Value,
    workload: serde_json::Value,
) -> AppResult<()> {
    let call: PlaybookCallSpec = serde_json::from_value(tool_spec)
        .map_err(|e| AppError::Validation(format!("invalid playbook task spec: {}", e)))?;

    let mut ancestors = tick.projection.ancestors.clone();
    if let Some(path) = &tick.projection.path {
        ancestors.push(path.clone());
    }

    if ancestors.len() as u32 >= tick.settings.max_subplaybook_depth {
        tick.actions.push(Action::Append(
            NewEvent::step(
                EventKind::StepFailed,
                &step.step,
                serde_json::json!({
                    "reason": "subplaybook_depth_exceeded",
                    "detail": format!(
                        "nesting depth {} reached calling '{}'",
                        ancestors.len(),
                        call.path
                    ),
                }),
            )
            .with_attempt(attempt)
            .with_loop_index(Some(index)),
        ));
        return Ok(());
    }

    tick.actions.push(Action::Spawn(ChildSpec {
        path: call.path,
        version: call.version,
        workload,
        parent_step: step.step.clone(),
        parent_loop_index: Some(index),
        ancestors,
    }));

    Ok(())
}

/// Resolve the iterator collection to a finite ordered sequence.
///
/// Mappings iterate as `{key, value}` pairs in key order.
fn resolve_collection(tick: &Tick<'_>, spec: &IteratorSpec) -> AppResult<Vec<serde_json::Value>> {
    let resolved = tick.resolver.resolve_value(&spec.collection, &tick.ctx)?;

    match resolved {
        serde_json::Value::Array(items) => Ok(items),
        serde_json::Value::Object(map) => Ok(map
            .into_iter()
            .map(|(k, v)| serde_json::json!({"key": k, "value": v}))
            .collect()),
        other => Err(AppError::Resolution(format!(
            "iterator collection did not resolve to a sequence: {}",
            other
        ))),
    }
}
