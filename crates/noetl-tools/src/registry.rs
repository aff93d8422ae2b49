//! Tool trait and dispatch registry.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::context::ToolContext;
use crate::error::ToolError;
use crate::result::ToolResult;

/// Channel for streaming `step_progress` payloads out of a running tool.
pub type ProgressSink = mpsc::Sender<serde_json::Value>;

/// Tool specification as shipped inside a job.
///
/// The `kind` selects the adapter; everything else is adapter-specific and
/// already template-expanded by the control plane except for `secret`
/// placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool kind (e.g. "shell", "http", "noop").
    pub kind: String,

    /// Adapter-specific configuration.
    #[serde(flatten)]
    pub config: serde_json::Value,

    /// Timeout in seconds, enforced by the worker around `execute`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl ToolSpec {
    /// Parse the adapter-specific config into a concrete type.
    pub fn parse_config<T: serde::de::DeserializeOwned>(&self) -> Result<T, ToolError> {
        serde_json::from_value(self.config.clone())
            .map_err(|e| ToolError::Configuration(format!("invalid {} config: {}", self.kind, e)))
    }
}

/// A tool adapter.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The tool's unique kind.
    fn name(&self) -> &'static str;

    /// Capability tag the tool requires from its worker pool.
    fn capability(&self) -> &'static str {
        "cpu"
    }

    /// Secrets the adapter expects in the context, by name.
    fn required_secrets(&self) -> &'static [&'static str] {
        &[]
    }

    /// Execute the tool.
    ///
    /// Long-running adapters should watch `cancel` and send periodic
    /// payloads through `progress`; both are wired to the worker runtime.
    async fn execute(
        &self,
        spec: &ToolSpec,
        ctx: &ToolContext,
        cancel: CancellationToken,
        progress: ProgressSink,
    ) -> Result<ToolResult, ToolError>;
}

/// Registry of available tool adapters.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool.
    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    /// Get a tool by kind.
    pub fn get(&self, kind: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(kind).cloned()
    }

    /// Check if a tool is registered.
    pub fn has(&self, kind: &str) -> bool {
        self.tools.contains_key(kind)
    }

    /// List registered kinds.
    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    /// Execute the adapter selected by `spec.kind`.
    pub async fn execute(
        &self,
        spec: &ToolSpec,
        ctx: &ToolContext,
        cancel: CancellationToken,
        progress: ProgressSink,
    ) -> Result<ToolResult, ToolError> {
        let tool = self
            .get(&spec.kind)
            .ok_or_else(|| ToolError::NotFound(spec.kind.clone()))?;
        tool.execute(spec, ctx, cancel, progress).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockTool;

    #[async_trait]
    impl Tool for MockTool {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn execute(
            &self,
            _spec: &ToolSpec,
            _ctx: &ToolContext,
            _cancel: CancellationToken,
            _progress: ProgressSink,
        ) -> Result<ToolResult, ToolError> {
            Ok(ToolResult::success(serde_json::json!({"mock": true})))
        }
    }

    fn mock_spec(kind: &str) -> ToolSpec {
        ToolSpec {
            kind: kind.to_string(),
            config: serde_json::json!({}),
            timeout: None,
        }
    }

    #[test]
    fn test_registry_register() {
        let mut registry = ToolRegistry::new();
        registry.register(MockTool);

        assert!(registry.has("mock"));
        assert!(!registry.has("unknown"));
        assert_eq!(registry.list(), vec!["mock"]);
    }

    #[tokio::test]
    async fn test_registry_execute() {
        let mut registry = ToolRegistry::new();
        registry.register(MockTool);

        let (tx, _rx) = mpsc::channel(4);
        let result = registry
            .execute(
                &mock_spec("mock"),
                &ToolContext::default(),
                CancellationToken::new(),
                tx,
            )
            .await
            .unwrap();
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn test_registry_execute_not_found() {
        let registry = ToolRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        let result = registry
            .execute(
                &mock_spec("unknown"),
                &ToolContext::default(),
                CancellationToken::new(),
                tx,
            )
            .await;
        assert!(matches!(result, Err(ToolError::NotFound(_))));
    }

    #[test]
    fn test_tool_spec_flatten() {
        let json = serde_json::json!({
            "kind": "shell",
            "command": "echo hi",
            "timeout": 30
        });
        let spec: ToolSpec = serde_json::from_value(json).unwrap();
        assert_eq!(spec.kind, "shell");
        assert_eq!(spec.timeout, Some(30));
        assert_eq!(spec.config["command"], "echo hi");
    }
}
