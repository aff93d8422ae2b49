//! Execution context handed to tool adapters.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Context for one job execution.
///
/// Carries the minimum scope a tool needs: job identity, the context
/// snapshot resolved by the control plane, the iterator binding when the job
/// is a loop child, and worker-side secrets. Tools hold no globals; whatever
/// they need arrives here.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolContext {
    /// Execution this job belongs to.
    pub execution_id: i64,

    /// Step name.
    pub step: String,

    /// Attempt number (1-based).
    #[serde(default = "default_attempt")]
    pub attempt: i32,

    /// Loop index for iterator children.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_index: Option<i32>,

    /// Resolved step arguments and context snapshot.
    #[serde(default)]
    pub args: HashMap<String, serde_json::Value>,

    /// Current iterator item, when this job is a loop child.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item: Option<serde_json::Value>,

    /// Secrets resolved on the worker. Never serialized.
    #[serde(default, skip_serializing, skip_deserializing)]
    pub secrets: HashMap<String, String>,

    /// Name of the worker running this job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
}

fn default_attempt() -> i32 {
    1
}

impl ToolContext {
    /// Create a context for a job.
    pub fn new(execution_id: i64, step: impl Into<String>, attempt: i32) -> Self {
        Self {
            execution_id,
            step: step.into(),
            attempt,
            ..Default::default()
        }
    }

    pub fn with_loop_index(mut self, loop_index: Option<i32>) -> Self {
        self.loop_index = loop_index;
        self
    }

    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    /// Set a secret value.
    pub fn set_secret(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.secrets.insert(name.into(), value.into());
    }

    /// Get a secret value.
    pub fn get_secret(&self, name: &str) -> Option<&str> {
        self.secrets.get(name).map(|s| s.as_str())
    }

    /// Flatten the context into a template-rendering map.
    ///
    /// Secrets are exposed under the `secret` namespace so the worker-side
    /// template pass can substitute `{{ secret.NAME }}` placeholders the
    /// control plane deliberately left unresolved.
    pub fn template_context(&self) -> HashMap<String, serde_json::Value> {
        let mut ctx = self.args.clone();

        ctx.insert(
            "execution_id".to_string(),
            serde_json::json!(self.execution_id),
        );
        ctx.insert("step".to_string(), serde_json::json!(self.step));
        ctx.insert("attempt".to_string(), serde_json::json!(self.attempt));

        if let Some(idx) = self.loop_index {
            ctx.insert("loop_index".to_string(), serde_json::json!(idx));
        }
        if let Some(ref item) = self.item {
            ctx.insert("item".to_string(), item.clone());
        }

        let secret: serde_json::Map<String, serde_json::Value> = self
            .secrets
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::json!(v)))
            .collect();
        ctx.insert("secret".to_string(), serde_json::Value::Object(secret));

        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_new() {
        let ctx = ToolContext::new(12345, "fetch", 1).with_loop_index(Some(2));
        assert_eq!(ctx.execution_id, 12345);
        assert_eq!(ctx.step, "fetch");
        assert_eq!(ctx.loop_index, Some(2));
    }

    #[test]
    fn test_secrets_not_serialized() {
        let mut ctx = ToolContext::new(1, "s", 1);
        ctx.set_secret("api_key", "topsecret");

        let json = serde_json::to_string(&ctx).unwrap();
        assert!(!json.contains("topsecret"));
        assert_eq!(ctx.get_secret("api_key"), Some("topsecret"));
    }

    #[test]
    fn test_template_context_bindings() {
        let mut ctx = ToolContext::new(7, "child", 1).with_loop_index(Some(0));
        ctx.item = Some(serde_json::json!({"id": 1}));
        ctx.args
            .insert("base_url".to_string(), serde_json::json!("http://x"));
        ctx.set_secret("token", "abc");

        let tctx = ctx.template_context();
        assert_eq!(tctx["item"]["id"], 1);
        assert_eq!(tctx["loop_index"], 0);
        assert_eq!(tctx["base_url"], "http://x");
        assert_eq!(tctx["secret"]["token"], "abc");
    }
}
