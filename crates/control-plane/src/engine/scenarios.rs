//! End-to-end engine scenarios over the in-memory harness.

use crate::db::models::event::{EventKind, NewEvent};
use crate::engine::harness::Harness;
use crate::engine::interpreter::plan;
use crate::engine::projector::{project, ExecStatus, StepStatus};
use crate::playbook::parse_playbook;
use crate::services::event::PublishOutcome;

const LINEAR_PIPELINE: &str = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata:
  name: linear
  path: ci/linear
workflow:
  - step: start
    tool: shell
    command: "true"
    next: [build]
  - step: build
    tool: shell
    command: make build
    next: [test]
  - step: test
    tool: shell
    command: make test
"#;

const BRANCHING: &str = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata:
  name: branching
  path: ci/branching
workload:
  env: staging
workflow:
  - step: route
    tool: noop
    case:
      - when: "{{ workload.env }} == prod"
        then:
          - step: prod_deploy
      - else:
          - step: staging_deploy
  - step: prod_deploy
    tool: shell
    command: ./deploy prod
  - step: staging_deploy
    tool: shell
    command: ./deploy staging
"#;

const ASYNC_ITERATOR: &str = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata:
  name: fanout
  path: etl/fanout
workload:
  targets:
    - { id: 1 }
    - { id: 2 }
    - { id: 3 }
workflow:
  - step: ping_all
    tool: iterator
    collection: "{{ workload.targets }}"
    mode: async
    task:
      tool: http
      url: "https://svc/{{ item.id }}"
      method: POST
"#;

const PARENT: &str = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata:
  name: parent
  path: flows/parent
workflow:
  - step: run_child
    tool: playbook
    path: flows/child
    args:
      region: eu
"#;

const CHILD: &str = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata:
  name: child
  path: flows/child
workflow:
  - step: start
    tool: shell
    command: exit 1
"#;

const RETRYING: &str = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata:
  name: retrying
  path: ci/retrying
workflow:
  - step: flaky
    tool: shell
    command: ./sometimes
    retry:
      max: 3
      backoff_seconds: 1
"#;

/// Scenario 1: linear shell pipeline runs to completion in order.
#[test]
fn test_linear_pipeline_completes_in_order() {
    let mut h = Harness::new();
    let path = h.register(LINEAR_PIPELINE);
    let exec = h.start(&path, serde_json::json!({}));

    for step in ["start", "build", "test"] {
        h.run();
        assert_eq!(h.leasable_jobs().len(), 1, "one job for {}", step);
        assert_eq!(h.leasable_jobs()[0].key.step_name, step);
        h.complete_next_job(serde_json::json!({"exit_code": 0}));
    }
    h.run();

    let projection = h.projection(exec);
    assert_eq!(projection.status, ExecStatus::Completed);
    assert_eq!(projection.completed_steps(), vec!["build", "start", "test"]);

    // step_started/step_completed pairs appear in pipeline order.
    let step_events: Vec<(String, String)> = h
        .events(exec)
        .iter()
        .filter(|e| e.kind == "step_started" || e.kind == "step_completed")
        .map(|e| (e.kind.clone(), e.step_name.clone().unwrap()))
        .collect();
    assert_eq!(
        step_events,
        vec![
            ("step_started".into(), "start".into()),
            ("step_completed".into(), "start".into()),
            ("step_started".into(), "build".into()),
            ("step_completed".into(), "build".into()),
            ("step_started".into(), "test".into()),
            ("step_completed".into(), "test".into()),
        ]
    );
    assert!(h.kinds(exec).last().unwrap() == "execution_completed");
}

/// Scenario 2: case routing selects prod, staging is skipped untouched.
#[test]
fn test_branch_on_case() {
    let mut h = Harness::new();
    let path = h.register(BRANCHING);
    let exec = h.start(&path, serde_json::json!({"env": "prod"}));

    h.run();
    h.complete_next_job(serde_json::json!({}));
    h.run();
    h.complete_next_job(serde_json::json!({"deployed": "prod"}));
    h.run();

    let projection = h.projection(exec);
    assert_eq!(projection.status, ExecStatus::Completed);
    assert_eq!(projection.steps["prod_deploy"].status, StepStatus::Completed);
    assert_eq!(
        projection.steps["staging_deploy"].status,
        StepStatus::Skipped
    );

    let branch = h
        .events(exec)
        .iter()
        .find(|e| e.kind == "branch_taken")
        .expect("branch_taken recorded");
    assert_eq!(branch.payload["selected"][0]["step"], "prod_deploy");
    assert_eq!(branch.payload["skipped"][0], "staging_deploy");

    // The skipped branch never started.
    assert!(!h
        .events(exec)
        .iter()
        .any(|e| e.kind == "step_started"
            && e.step_name.as_deref() == Some("staging_deploy")));
}

/// Scenario 3: async iterator fans out all children at once and aggregates
/// results in item order regardless of completion order.
#[test]
fn test_async_iterator_aggregates_in_order() {
    let mut h = Harness::new();
    let path = h.register(ASYNC_ITERATOR);
    let exec = h.start(&path, serde_json::json!({}));

    h.run();

    let expanded = h
        .events(exec)
        .iter()
        .find(|e| e.kind == "iterator_expanded")
        .expect("iterator expanded");
    assert_eq!(expanded.payload["count"], 3);

    let enqueued: Vec<i32> = h
        .events(exec)
        .iter()
        .filter(|e| e.kind == "step_enqueued")
        .filter_map(|e| e.loop_index)
        .collect();
    assert_eq!(enqueued, vec![0, 1, 2]);
    assert_eq!(h.leasable_jobs().len(), 3);

    // Children finish out of order: 2, 0, 1.
    for index in [2, 0, 1] {
        h.complete_job_where(
            |j| j.key.loop_index == Some(index),
            serde_json::json!({"pinged": index}),
        );
    }
    h.run();

    let settled = h
        .events(exec)
        .iter()
        .filter(|e| e.kind == "iterator_child_completed")
        .count();
    assert_eq!(settled, 3);

    let projection = h.projection(exec);
    assert_eq!(projection.status, ExecStatus::Completed);
    let aggregate = projection.steps["ping_all"].last_result.clone().unwrap();
    assert_eq!(
        aggregate,
        serde_json::json!([{"pinged": 0}, {"pinged": 1}, {"pinged": 2}])
    );
}

/// Scenario 4: sub-playbook failure maps to a parent step failure and both
/// executions fail consistently.
#[test]
fn test_subplaybook_failure_propagates() {
    let mut h = Harness::new();
    h.register(CHILD);
    let parent_path = h.register(PARENT);
    let parent = h.start(&parent_path, serde_json::json!({}));

    h.run();

    let spawn = h
        .events(parent)
        .iter()
        .find(|e| e.kind == "subplaybook_spawned")
        .expect("child spawned")
        .clone();
    let child = spawn.payload["child_execution_id"].as_i64().unwrap();
    assert_eq!(h.projection(child).workload["region"], "eu");

    // The child's only step fails without retry.
    h.fail_next_job("tool_error", "command exited with code 1");
    h.run();

    let child_projection = h.projection(child);
    assert_eq!(child_projection.status, ExecStatus::Failed);

    let parent_projection = h.projection(parent);
    assert_eq!(parent_projection.status, ExecStatus::Failed);
    assert_eq!(
        parent_projection.steps["run_child"].failure_reason.as_deref(),
        Some("subplaybook_failed")
    );
    assert!(h
        .kinds(parent)
        .iter()
        .any(|k| k == "execution_failed"));
}

/// Iterator with a playbook task: one child execution per item, tracked by
/// loop_index, settled into the slot, and aggregated in item order.
#[test]
fn test_iterator_over_subplaybooks() {
    let worker_child = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata:
  name: deploy_region
  path: flows/deploy-region
workflow:
  - step: start
    tool: shell
    command: "./deploy {{ workload.region }}"
"#;
    let fanout_parent = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata:
  name: deploy_all
  path: flows/deploy-all
workload:
  regions: [eu, us]
workflow:
  - step: deploy_each
    tool: iterator
    collection: "{{ workload.regions }}"
    mode: async
    task:
      tool: playbook
      path: flows/deploy-region
      args:
        region: "{{ item }}"
"#;

    let mut h = Harness::new();
    h.register(worker_child);
    let parent_path = h.register(fanout_parent);
    let parent = h.start(&parent_path, serde_json::json!({}));

    h.run();

    // One spawn per item, recorded against its loop slot.
    let spawns: Vec<_> = h
        .events(parent)
        .iter()
        .filter(|e| e.kind == "subplaybook_spawned")
        .cloned()
        .collect();
    assert_eq!(spawns.len(), 2);
    assert_eq!(spawns[0].loop_index, Some(0));
    assert_eq!(spawns[1].loop_index, Some(1));

    let projection = h.projection(parent);
    let iter = projection.steps["deploy_each"].iterator.as_ref().unwrap();
    let child_eu = iter.children[&0].child_execution_id.unwrap();
    let child_us = iter.children[&1].child_execution_id.unwrap();
    assert_ne!(child_eu, child_us);
    assert_eq!(h.projection(child_eu).workload["region"], "eu");
    assert_eq!(h.projection(child_us).workload["region"], "us");

    // Each child execution runs its own job; finish them out of order.
    h.complete_job_where(
        |j| j.key.execution_id == child_us,
        serde_json::json!({"deployed": "us"}),
    );
    h.run();
    h.complete_job_where(
        |j| j.key.execution_id == child_eu,
        serde_json::json!({"deployed": "eu"}),
    );
    h.run();

    assert_eq!(h.projection(child_eu).status, ExecStatus::Completed);
    assert_eq!(h.projection(child_us).status, ExecStatus::Completed);

    let projection = h.projection(parent);
    assert_eq!(projection.status, ExecStatus::Completed);

    // Each slot holds its child's aggregated output, in item order rather
    // than completion order.
    let aggregate = projection.steps["deploy_each"].last_result.clone().unwrap();
    assert_eq!(aggregate.as_array().unwrap().len(), 2);
    assert_eq!(aggregate[0]["start"]["deployed"], "eu");
    assert_eq!(aggregate[1]["start"]["deployed"], "us");

    let settled = h
        .events(parent)
        .iter()
        .filter(|e| e.kind == "iterator_child_completed")
        .count();
    assert_eq!(settled, 2);
}

/// Scenario 5: redelivering a completed job cannot publish again.
#[test]
fn test_duplicate_delivery_is_rejected() {
    let mut h = Harness::new();
    let path = h.register(LINEAR_PIPELINE);
    let exec = h.start(&path, serde_json::json!({}));

    h.run();
    h.complete_next_job(serde_json::json!({"exit_code": 0}));
    let log_len = h.events(exec).len();

    // A second worker redelivers the same job and tries to start it.
    let outcome = h.publish(
        exec,
        NewEvent::step(
            EventKind::StepStarted,
            "start",
            serde_json::json!({"worker": "other"}),
        ),
    );
    assert_eq!(outcome, PublishOutcome::Duplicate);

    let outcome = h.publish(
        exec,
        NewEvent::step(
            EventKind::StepCompleted,
            "start",
            serde_json::json!({"data": {"again": true}}),
        ),
    );
    assert_eq!(outcome, PublishOutcome::Duplicate);

    // No extra events appeared.
    assert_eq!(h.events(exec).len(), log_len);
}

/// Scenario 6: retry with backoff runs attempts 1..3 with clock-gated
/// re-enqueues and completes on the third attempt.
#[test]
fn test_retry_with_backoff() {
    let mut h = Harness::new();
    let path = h.register(RETRYING);
    let exec = h.start(&path, serde_json::json!({}));

    h.run();
    h.fail_next_job("tool_error", "exit 1");
    h.run();

    // Attempt 2 is enqueued but gated behind the backoff deadline.
    assert!(h.leasable_jobs().is_empty());
    assert_eq!(h.jobs.len(), 1);
    assert_eq!(h.jobs[0].key.attempt, 2);

    h.advance_clock(1);
    h.fail_next_job("tool_error", "exit 1");
    h.run();
    h.advance_clock(1);
    h.complete_next_job(serde_json::json!({"exit_code": 0}));
    h.run();

    let projection = h.projection(exec);
    assert_eq!(projection.status, ExecStatus::Completed);
    assert_eq!(projection.steps["flaky"].attempts, 3);

    // One enqueue per attempt, backoff deadlines a second apart.
    let enqueues: Vec<i32> = h
        .events(exec)
        .iter()
        .filter(|e| e.kind == "step_enqueued")
        .map(|e| e.attempt)
        .collect();
    assert_eq!(enqueues, vec![1, 2, 3]);

    let fails: Vec<_> = h
        .events(exec)
        .iter()
        .filter(|e| e.kind == "step_failed")
        .collect();
    assert_eq!(fails.len(), 2);
    assert!(fails[1].created_at - fails[0].created_at >= chrono::Duration::seconds(1));
}

/// Cancellation safety: after execution_cancelled nothing is ever appended.
#[test]
fn test_cancellation_blocks_all_publication() {
    let mut h = Harness::new();
    let path = h.register(LINEAR_PIPELINE);
    let exec = h.start(&path, serde_json::json!({}));

    h.run();
    assert_eq!(h.leasable_jobs().len(), 1);

    let outcome = h.publish(
        exec,
        NewEvent::execution(EventKind::ExecutionCancelled, serde_json::json!({})),
    );
    assert!(matches!(outcome, PublishOutcome::Appended { .. }));
    let log_len = h.events(exec).len();

    // The in-flight worker reports; the log refuses.
    let outcome = h.publish(
        exec,
        NewEvent::step(EventKind::StepStarted, "start", serde_json::json!({})),
    );
    assert_eq!(outcome, PublishOutcome::ExecutionClosed);

    // The broker plans nothing further either.
    h.run();
    assert_eq!(h.events(exec).len(), log_len);
    assert!(!h
        .events(exec)
        .iter()
        .any(|e| e.kind == "step_started"));
}

/// Replay determinism: at any log prefix the interpreter reproduces the
/// same action list.
#[test]
fn test_replay_produces_identical_actions() {
    let mut h = Harness::new();
    let path = h.register(BRANCHING);
    let exec = h.start(&path, serde_json::json!({"env": "prod"}));

    h.run();
    h.complete_next_job(serde_json::json!({}));

    let playbook = parse_playbook(BRANCHING).unwrap();
    for prefix_len in 1..=h.events(exec).len() {
        let prefix = &h.events(exec)[..prefix_len];
        let projection = project(prefix).unwrap();
        let first = plan(&projection, &playbook, &h.settings).unwrap();
        let second = plan(&projection, &playbook, &h.settings).unwrap();
        assert_eq!(format!("{:?}", first), format!("{:?}", second));
    }
}

/// Sequential iterators feed children one at a time and stop on failure.
#[test]
fn test_sequential_iterator_aborts_on_failure() {
    let yaml = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata:
  name: seq
  path: etl/seq
workload:
  items: [a, b, c]
workflow:
  - step: walk
    tool: iterator
    collection: "{{ workload.items }}"
    mode: sequential
    task:
      tool: shell
      command: "./handle {{ item }}"
"#;

    let mut h = Harness::new();
    let path = h.register(yaml);
    let exec = h.start(&path, serde_json::json!({}));

    h.run();
    assert_eq!(h.leasable_jobs().len(), 1);
    assert_eq!(h.leasable_jobs()[0].key.loop_index, Some(0));

    h.complete_next_job(serde_json::json!({"ok": "a"}));
    h.run();
    assert_eq!(h.leasable_jobs().len(), 1);
    assert_eq!(h.leasable_jobs()[0].key.loop_index, Some(1));

    h.fail_next_job("tool_error", "b failed");
    h.run();

    // Child 2 was never enqueued; the iterator and execution fail.
    assert!(h.jobs.is_empty());
    let projection = h.projection(exec);
    assert_eq!(projection.status, ExecStatus::Failed);
    assert_eq!(
        projection.steps["walk"].failure_reason.as_deref(),
        Some("iterator_child_failed")
    );
}

/// Unresolved references fail the step without retry.
#[test]
fn test_unresolved_reference_fails_fast() {
    let yaml = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata:
  name: unresolved
  path: ci/unresolved
workflow:
  - step: start
    tool: shell
    command: "echo {{ missing_thing.field }}"
    retry:
      max: 3
      backoff_seconds: 1
"#;

    let mut h = Harness::new();
    let path = h.register(yaml);
    let exec = h.start(&path, serde_json::json!({}));

    h.run();

    let projection = h.projection(exec);
    assert_eq!(projection.status, ExecStatus::Failed);
    assert_eq!(
        projection.steps["start"].failure_reason.as_deref(),
        Some("unresolved_reference")
    );
    // Despite the retry policy, no job and no second attempt.
    assert!(h.jobs.is_empty());
    let enqueues = h
        .events(exec)
        .iter()
        .filter(|e| e.kind == "step_enqueued")
        .count();
    assert_eq!(enqueues, 0);
}

/// Fan-in: a step is skipped only when all of its incoming edges resolve
/// against it.
#[test]
fn test_fan_in_skip_requires_all_edges() {
    let yaml = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata:
  name: fanin
  path: ci/fanin
workload:
  fast_path: true
workflow:
  - step: start
    tool: noop
    next: [left, right]
  - step: left
    tool: noop
    case:
      - when: "{{ workload.fast_path }}"
        then: [{ step: join }]
      - else: [{ step: slow_join }]
  - step: right
    tool: noop
    case:
      - when: "{{ workload.fast_path }}"
        then: [{ step: join }]
      - else: [{ step: slow_join }]
  - step: join
    tool: noop
  - step: slow_join
    tool: noop
"#;

    let mut h = Harness::new();
    let path = h.register(yaml);
    let exec = h.start(&path, serde_json::json!({}));

    h.run();
    h.complete_next_job(serde_json::json!({})); // start
    h.run();
    // left and right run in parallel; finish left first.
    h.complete_job_where(|j| j.key.step_name == "left", serde_json::json!({}));
    h.run();

    // left routed away from slow_join, but right's edge into it is still
    // unresolved: slow_join must not be skipped yet.
    let projection = h.projection(exec);
    assert!(!projection.steps.contains_key("slow_join"));

    h.complete_job_where(|j| j.key.step_name == "right", serde_json::json!({}));
    h.run();

    // Now every incoming edge resolved against slow_join.
    let projection = h.projection(exec);
    assert_eq!(projection.steps["slow_join"].status, StepStatus::Skipped);

    h.complete_job_where(|j| j.key.step_name == "join", serde_json::json!({}));
    h.run();

    let projection = h.projection(exec);
    assert_eq!(projection.status, ExecStatus::Completed);
    assert_eq!(projection.steps["join"].status, StepStatus::Completed);
    // join ran exactly once despite two selectors.
    let join_starts = h
        .events(exec)
        .iter()
        .filter(|e| e.kind == "step_started" && e.step_name.as_deref() == Some("join"))
        .count();
    assert_eq!(join_starts, 1);
}
