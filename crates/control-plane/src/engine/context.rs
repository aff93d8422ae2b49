//! Render-context assembly for template resolution.
//!
//! The scoped context a step's templates see: `workload`, one result proxy
//! per finished step (the step name maps straight to the result's data
//! payload, so `{{ step }}` is the data and `{{ step.field }}` descends),
//! execution metadata, and the `secret` namespace.
//!
//! Secrets are resolved on workers. The server maps each credential binding
//! to its own template text so rendering a spec leaves `{{ secret.X }}`
//! intact for the worker-side pass.

use std::collections::HashMap;

use crate::engine::projector::{ExecutionProjection, StepStatus};
use crate::playbook::Playbook;

/// Build the template context for an execution.
pub fn build_context(
    projection: &ExecutionProjection,
    playbook: &Playbook,
) -> HashMap<String, serde_json::Value> {
    let mut ctx = HashMap::new();

    ctx.insert("workload".to_string(), projection.workload.clone());
    ctx.insert(
        "execution_id".to_string(),
        serde_json::json!(projection.execution_id.to_string()),
    );
    if let Some(path) = &projection.path {
        ctx.insert("path".to_string(), serde_json::json!(path));
    }

    for (name, step) in &projection.steps {
        match step.status {
            StepStatus::Completed => {
                if let Some(result) = &step.last_result {
                    ctx.insert(name.clone(), result.clone());
                }
            }
            // Failed steps expose their error so on_error: continue routing
            // can branch on it.
            StepStatus::Failed => {
                ctx.insert(
                    name.clone(),
                    serde_json::json!({
                        "error": step.last_error,
                        "reason": step.failure_reason,
                    }),
                );
            }
            _ => {}
        }
    }

    let secret: serde_json::Map<String, serde_json::Value> = playbook
        .credentials
        .iter()
        .flatten()
        .map(|(name, _handle)| {
            (
                name.clone(),
                serde_json::json!(format!("{{{{ secret.{} }}}}", name)),
            )
        })
        .collect();
    ctx.insert("secret".to_string(), serde_json::Value::Object(secret));

    ctx
}

/// Extend a context with iterator bindings for one loop child.
pub fn bind_item(
    ctx: &HashMap<String, serde_json::Value>,
    item: &serde_json::Value,
    loop_index: i32,
) -> HashMap<String, serde_json::Value> {
    let mut child_ctx = ctx.clone();
    child_ctx.insert("item".to_string(), item.clone());
    child_ctx.insert("loop_index".to_string(), serde_json::json!(loop_index));
    child_ctx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::event::{Event, EventKind};
    use crate::engine::projector::project;
    use chrono::Utc;

    fn playbook_with_credentials() -> Playbook {
        crate::playbook::parse_playbook(
            r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata:
  name: ctx_test
credentials:
  api_token: vault://tokens/api
workflow:
  - step: start
    tool: noop
"#,
        )
        .unwrap()
    }

    fn projection_with_result() -> ExecutionProjection {
        let events = vec![
            Event {
                execution_id: 1,
                seq: 0,
                kind: EventKind::ExecutionStarted.as_str().to_string(),
                step_name: None,
                attempt: 1,
                loop_index: None,
                payload: serde_json::json!({"path": "p", "workload": {"env": "prod"}}),
                created_at: Utc::now(),
            },
            Event {
                execution_id: 1,
                seq: 1,
                kind: EventKind::StepCompleted.as_str().to_string(),
                step_name: Some("fetch".to_string()),
                attempt: 1,
                loop_index: None,
                payload: serde_json::json!({"data": {"rows": 3}}),
                created_at: Utc::now(),
            },
        ];
        project(&events).unwrap()
    }

    #[test]
    fn test_context_contains_workload_and_results() {
        let ctx = build_context(&projection_with_result(), &playbook_with_credentials());
        assert_eq!(ctx["workload"]["env"], "prod");
        assert_eq!(ctx["fetch"]["rows"], 3);
    }

    #[test]
    fn test_secret_placeholders_self_preserve() {
        let ctx = build_context(&projection_with_result(), &playbook_with_credentials());
        assert_eq!(ctx["secret"]["api_token"], "{{ secret.api_token }}");
    }

    #[test]
    fn test_bind_item() {
        let ctx = build_context(&projection_with_result(), &playbook_with_credentials());
        let child = bind_item(&ctx, &serde_json::json!({"id": 9}), 2);
        assert_eq!(child["item"]["id"], 9);
        assert_eq!(child["loop_index"], 2);
        // Parent context untouched.
        assert!(!ctx.contains_key("item"));
    }
}
