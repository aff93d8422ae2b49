//! Shell command execution tool.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::context::ToolContext;
use crate::error::ToolError;
use crate::registry::{ProgressSink, Tool, ToolSpec};
use crate::result::ToolResult;
use crate::template::TemplateEngine;

/// Shell tool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    /// Command to execute.
    pub command: String,

    /// Shell to use (default: "bash").
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Working directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,

    /// Environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_shell() -> String {
    "bash".to_string()
}

/// Shell command execution tool.
pub struct ShellTool {
    template_engine: TemplateEngine,
}

impl ShellTool {
    /// Create a new shell tool.
    pub fn new() -> Self {
        Self {
            template_engine: TemplateEngine::new(),
        }
    }

    async fn run(
        &self,
        config: &ShellConfig,
        timeout_seconds: Option<u64>,
        cancel: CancellationToken,
    ) -> Result<ToolResult, ToolError> {
        let start = std::time::Instant::now();

        let mut cmd = Command::new(&config.shell);
        cmd.arg("-c").arg(&config.command);

        if let Some(dir) = &config.cwd {
            cmd.current_dir(dir);
        }
        for (k, v) in &config.env {
            cmd.env(k, v);
        }

        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| ToolError::Process(format!("failed to spawn process: {}", e)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stdout_handle = tokio::spawn(async move {
            let mut output = String::new();
            if let Some(stdout) = stdout {
                let mut reader = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    output.push_str(&line);
                    output.push('\n');
                }
            }
            output
        });

        let stderr_handle = tokio::spawn(async move {
            let mut output = String::new();
            if let Some(stderr) = stderr {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    output.push_str(&line);
                    output.push('\n');
                }
            }
            output
        });

        let wait = async {
            if let Some(seconds) = timeout_seconds {
                match timeout(Duration::from_secs(seconds), child.wait()).await {
                    Ok(result) => Some(result),
                    Err(_) => None,
                }
            } else {
                Some(child.wait().await)
            }
        };

        let wait_result = tokio::select! {
            result = wait => result,
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(ToolError::Cancelled);
            }
        };

        let status = match wait_result {
            Some(result) => {
                result.map_err(|e| ToolError::Process(format!("failed to wait: {}", e)))?
            }
            None => {
                let _ = child.kill().await;
                let duration_ms = start.elapsed().as_millis() as u64;
                return Ok(
                    ToolResult::timeout(timeout_seconds.unwrap_or(0)).with_duration(duration_ms)
                );
            }
        };

        let exit_code = status.code().unwrap_or(-1);
        let stdout = stdout_handle.await.unwrap_or_default();
        let stderr = stderr_handle.await.unwrap_or_default();

        let duration_ms = start.elapsed().as_millis() as u64;
        Ok(ToolResult::from_shell(exit_code, stdout, stderr).with_duration(duration_ms))
    }
}

impl Default for ShellTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &'static str {
        "shell"
    }

    async fn execute(
        &self,
        spec: &ToolSpec,
        ctx: &ToolContext,
        cancel: CancellationToken,
        _progress: ProgressSink,
    ) -> Result<ToolResult, ToolError> {
        let template_ctx = ctx.template_context();
        let rendered = self
            .template_engine
            .render_value(&spec.config, &template_ctx)?;

        let config: ShellConfig = serde_json::from_value(rendered)
            .map_err(|e| ToolError::Configuration(format!("invalid shell config: {}", e)))?;

        tracing::debug!(
            execution_id = ctx.execution_id,
            step = %ctx.step,
            shell = %config.shell,
            "Executing shell command"
        );

        self.run(&config, spec.timeout, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn spec(config: serde_json::Value, timeout: Option<u64>) -> ToolSpec {
        ToolSpec {
            kind: "shell".to_string(),
            config,
            timeout,
        }
    }

    #[tokio::test]
    async fn test_shell_success() {
        let tool = ShellTool::new();
        let (tx, _rx) = mpsc::channel(4);
        let result = tool
            .execute(
                &spec(serde_json::json!({"command": "echo hello"}), None),
                &ToolContext::default(),
                CancellationToken::new(),
                tx,
            )
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.data["stdout"], "hello\n");
    }

    #[tokio::test]
    async fn test_shell_nonzero_exit() {
        let tool = ShellTool::new();
        let (tx, _rx) = mpsc::channel(4);
        let result = tool
            .execute(
                &spec(serde_json::json!({"command": "exit 3"}), None),
                &ToolContext::default(),
                CancellationToken::new(),
                tx,
            )
            .await
            .unwrap();

        assert!(!result.is_success());
        assert_eq!(result.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_shell_timeout() {
        let tool = ShellTool::new();
        let (tx, _rx) = mpsc::channel(4);
        let result = tool
            .execute(
                &spec(serde_json::json!({"command": "sleep 5"}), Some(1)),
                &ToolContext::default(),
                CancellationToken::new(),
                tx,
            )
            .await
            .unwrap();

        assert_eq!(result.status, crate::result::ToolStatus::Timeout);
    }

    #[tokio::test]
    async fn test_shell_template_in_command() {
        let tool = ShellTool::new();
        let mut ctx = ToolContext::new(1, "greet", 1);
        ctx.args
            .insert("name".to_string(), serde_json::json!("world"));

        let (tx, _rx) = mpsc::channel(4);
        let result = tool
            .execute(
                &spec(serde_json::json!({"command": "echo {{ name }}"}), None),
                &ctx,
                CancellationToken::new(),
                tx,
            )
            .await
            .unwrap();

        assert_eq!(result.data["stdout"], "world\n");
    }

    #[tokio::test]
    async fn test_shell_cancellation() {
        let tool = ShellTool::new();
        let (tx, _rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = tool
            .execute(
                &spec(serde_json::json!({"command": "sleep 5"}), None),
                &ToolContext::default(),
                cancel,
                tx,
            )
            .await;

        assert!(matches!(result, Err(ToolError::Cancelled)));
    }
}
