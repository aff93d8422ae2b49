//! Playbook parsing and validation.
//!
//! Validation failures surface synchronously as `AppError::Validation`,
//! never as step failures in the log.

use std::collections::HashSet;

use crate::error::{AppError, AppResult};
use crate::playbook::types::{IteratorSpec, Playbook, PlaybookCallSpec, Step, ToolKind};

/// Parse playbook YAML and validate its structure.
pub fn parse_playbook(yaml: &str) -> AppResult<Playbook> {
    let playbook: Playbook = serde_yaml::from_str(yaml)
        .map_err(|e| AppError::Validation(format!("Invalid playbook YAML: {}", e)))?;

    validate(&playbook)?;
    Ok(playbook)
}

/// Structural validation of a parsed playbook.
pub fn validate(playbook: &Playbook) -> AppResult<()> {
    if !playbook.api_version.starts_with("noetl.io/") {
        return Err(AppError::Validation(format!(
            "Unsupported apiVersion: {}",
            playbook.api_version
        )));
    }

    if playbook.kind != "Playbook" {
        return Err(AppError::Validation(format!(
            "Unsupported kind: {}",
            playbook.kind
        )));
    }

    if playbook.workflow.is_empty() {
        return Err(AppError::Validation(
            "Workflow must contain at least one step".to_string(),
        ));
    }

    let mut names = HashSet::new();
    for step in &playbook.workflow {
        if step.step.is_empty() {
            return Err(AppError::Validation("Step name must not be empty".to_string()));
        }
        if !names.insert(step.step.as_str()) {
            return Err(AppError::Validation(format!(
                "Duplicate step name: {}",
                step.step
            )));
        }
    }

    for step in &playbook.workflow {
        validate_step(playbook, step, &names)?;
    }

    Ok(())
}

fn validate_step(playbook: &Playbook, step: &Step, names: &HashSet<&str>) -> AppResult<()> {
    // A step has at most one of case or next.
    if step.case.is_some() && step.next.is_some() {
        return Err(AppError::Validation(format!(
            "Step '{}' defines both case and next",
            step.step
        )));
    }

    if let Some(rules) = &step.case {
        if rules.is_empty() {
            return Err(AppError::Validation(format!(
                "Step '{}' has an empty case block",
                step.step
            )));
        }
        for rule in rules {
            if rule.when.is_none() && rule.otherwise.is_empty() {
                return Err(AppError::Validation(format!(
                    "Step '{}' has a case rule with neither when nor else",
                    step.step
                )));
            }
            if rule.when.is_some() && rule.then.is_empty() {
                return Err(AppError::Validation(format!(
                    "Step '{}' has a when rule without then targets",
                    step.step
                )));
            }
        }
    }

    for target in step.routing_targets() {
        if !names.contains(target) {
            return Err(AppError::Validation(format!(
                "Step '{}' routes to unknown step '{}'",
                step.step, target
            )));
        }
    }

    if let Some(handler) = &step.on_failure {
        if !names.contains(handler.as_str()) {
            return Err(AppError::Validation(format!(
                "Step '{}' names unknown on_failure step '{}'",
                step.step, handler
            )));
        }
    }

    if let Some(retry) = &step.retry {
        if retry.max < 1 {
            return Err(AppError::Validation(format!(
                "Step '{}' retry.max must be at least 1",
                step.step
            )));
        }
    }

    match step.tool {
        ToolKind::Iterator => {
            let spec: IteratorSpec = serde_json::from_value(step.spec_value()).map_err(|e| {
                AppError::Validation(format!("Step '{}' has invalid iterator spec: {}", step.step, e))
            })?;
            // One loop_index dimension: loops do not nest within a step.
            if spec.task.tool == ToolKind::Iterator {
                return Err(AppError::Validation(format!(
                    "Step '{}' iterator task cannot be 'iterator'",
                    step.step
                )));
            }
            // Sub-playbook tasks fan a child execution out per item; their
            // call spec must be well-formed up front.
            if spec.task.tool == ToolKind::Playbook {
                let call: Result<PlaybookCallSpec, _> =
                    serde_json::from_value(spec.task.spec_value());
                let call = call.map_err(|e| {
                    AppError::Validation(format!(
                        "Step '{}' has invalid playbook task spec: {}",
                        step.step, e
                    ))
                })?;
                if call.path.is_empty() {
                    return Err(AppError::Validation(format!(
                        "Step '{}' playbook task path must not be empty",
                        step.step
                    )));
                }
            }
        }
        ToolKind::Playbook => {
            let spec: Result<PlaybookCallSpec, _> = serde_json::from_value(step.spec_value());
            let spec = spec.map_err(|e| {
                AppError::Validation(format!("Step '{}' has invalid playbook spec: {}", step.step, e))
            })?;
            if spec.path.is_empty() {
                return Err(AppError::Validation(format!(
                    "Step '{}' playbook path must not be empty",
                    step.step
                )));
            }
        }
        _ => {}
    }

    let _ = playbook;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata:
  name: pipeline
  path: ci/pipeline
workload:
  env: staging
workflow:
  - step: start
    tool: noop
    next: [build]
  - step: build
    tool: shell
    command: make build
    retry:
      max: 3
      backoff_seconds: 2
    next: [test]
  - step: test
    tool: shell
    command: make test
"#;

    #[test]
    fn test_parse_valid_playbook() {
        let playbook = parse_playbook(VALID).unwrap();
        assert_eq!(playbook.workflow.len(), 3);
        assert_eq!(playbook.get_step("build").unwrap().retry.as_ref().unwrap().max, 3);
    }

    #[test]
    fn test_reject_bad_api_version() {
        let yaml = VALID.replace("noetl.io/v2", "other.io/v1");
        let err = parse_playbook(&yaml).unwrap_err();
        assert!(err.to_string().contains("apiVersion"));
    }

    #[test]
    fn test_reject_duplicate_step_names() {
        let yaml = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata: { name: dup }
workflow:
  - step: a
    tool: noop
  - step: a
    tool: noop
"#;
        let err = parse_playbook(yaml).unwrap_err();
        assert!(err.to_string().contains("Duplicate step name"));
    }

    #[test]
    fn test_reject_case_and_next_together() {
        let yaml = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata: { name: both }
workflow:
  - step: a
    tool: noop
    next: [b]
    case:
      - when: "true"
        then: [{ step: b }]
  - step: b
    tool: noop
"#;
        let err = parse_playbook(yaml).unwrap_err();
        assert!(err.to_string().contains("both case and next"));
    }

    #[test]
    fn test_reject_unknown_successor() {
        let yaml = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata: { name: dangling }
workflow:
  - step: a
    tool: noop
    next: [ghost]
"#;
        let err = parse_playbook(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown step 'ghost'"));
    }

    #[test]
    fn test_reject_invalid_iterator() {
        let yaml = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata: { name: iter }
workflow:
  - step: fanout
    tool: iterator
    mode: async
"#;
        // Missing collection and task.
        let err = parse_playbook(yaml).unwrap_err();
        assert!(err.to_string().contains("invalid iterator spec"));
    }

    #[test]
    fn test_reject_nested_iterator_task() {
        let yaml = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata: { name: iter }
workflow:
  - step: fanout
    tool: iterator
    collection: "{{ workload.items }}"
    task:
      tool: iterator
      collection: "{{ item }}"
      task:
        tool: noop
"#;
        let err = parse_playbook(yaml).unwrap_err();
        assert!(err.to_string().contains("cannot be 'iterator'"));
    }

    #[test]
    fn test_accept_playbook_iterator_task() {
        let yaml = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata: { name: iter }
workflow:
  - step: fanout
    tool: iterator
    collection: "{{ workload.regions }}"
    task:
      tool: playbook
      path: flows/deploy-region
      args:
        region: "{{ item }}"
"#;
        assert!(parse_playbook(yaml).is_ok());
    }

    #[test]
    fn test_reject_playbook_iterator_task_without_path() {
        let yaml = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata: { name: iter }
workflow:
  - step: fanout
    tool: iterator
    collection: "{{ workload.regions }}"
    task:
      tool: playbook
"#;
        let err = parse_playbook(yaml).unwrap_err();
        assert!(err.to_string().contains("invalid playbook task spec"));
    }

    #[test]
    fn test_reject_zero_retry() {
        let yaml = VALID.replace("max: 3", "max: 0");
        let err = parse_playbook(&yaml).unwrap_err();
        assert!(err.to_string().contains("retry.max"));
    }

    #[test]
    fn test_reject_unknown_on_failure() {
        let yaml = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata: { name: handler }
workflow:
  - step: a
    tool: noop
    on_failure: cleanup
"#;
        let err = parse_playbook(yaml).unwrap_err();
        assert!(err.to_string().contains("on_failure"));
    }
}
