//! No-op tool.
//!
//! Steps that exist purely for routing (entry points, joins) run this; the
//! step's resolved args are echoed back as the result data so successors can
//! reference them.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::context::ToolContext;
use crate::error::ToolError;
use crate::registry::{ProgressSink, Tool, ToolSpec};
use crate::result::ToolResult;

/// Pass-through tool for routing-only steps.
pub struct NoopTool;

#[async_trait]
impl Tool for NoopTool {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn execute(
        &self,
        _spec: &ToolSpec,
        ctx: &ToolContext,
        _cancel: CancellationToken,
        _progress: ProgressSink,
    ) -> Result<ToolResult, ToolError> {
        let data = serde_json::to_value(&ctx.args)?;
        Ok(ToolResult::success(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_noop_echoes_args() {
        let mut ctx = ToolContext::new(1, "start", 1);
        ctx.args.insert("env".to_string(), serde_json::json!("prod"));

        let spec = ToolSpec {
            kind: "noop".to_string(),
            config: serde_json::json!({}),
            timeout: None,
        };

        let (tx, _rx) = mpsc::channel(1);
        let result = NoopTool
            .execute(&spec, &ctx, CancellationToken::new(), tx)
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(result.data["env"], "prod");
    }
}
