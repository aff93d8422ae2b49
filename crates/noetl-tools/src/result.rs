//! Tool execution result types.

use serde::{Deserialize, Serialize};

/// Status of a tool execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    /// Tool executed successfully.
    Success,
    /// Tool execution failed.
    Error,
    /// Tool execution timed out.
    Timeout,
}

impl ToolStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolStatus::Success)
    }
}

impl std::fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolStatus::Success => write!(f, "success"),
            ToolStatus::Error => write!(f, "error"),
            ToolStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// Result envelope returned by a tool adapter.
///
/// The `data` payload is what the step result proxy exposes to templates in
/// later steps; everything else is bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Execution status.
    pub status: ToolStatus,

    /// Primary result payload.
    #[serde(default)]
    pub data: serde_json::Value,

    /// Error message for failed executions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Wall-clock duration in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Process exit code (shell tool).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl ToolResult {
    /// Create a successful result with the given data payload.
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            status: ToolStatus::Success,
            data,
            error: None,
            duration_ms: None,
            exit_code: None,
        }
    }

    /// Create a failed result with an error message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Error,
            data: serde_json::Value::Null,
            error: Some(message.into()),
            duration_ms: None,
            exit_code: None,
        }
    }

    /// Create a timeout result.
    pub fn timeout(seconds: u64) -> Self {
        Self {
            status: ToolStatus::Timeout,
            data: serde_json::Value::Null,
            error: Some(format!("timed out after {}s", seconds)),
            duration_ms: None,
            exit_code: None,
        }
    }

    /// Build a result from a shell exit.
    pub fn from_shell(exit_code: i32, stdout: String, stderr: String) -> Self {
        let data = serde_json::json!({
            "exit_code": exit_code,
            "stdout": stdout,
            "stderr": stderr,
        });

        if exit_code == 0 {
            Self {
                status: ToolStatus::Success,
                data,
                error: None,
                duration_ms: None,
                exit_code: Some(exit_code),
            }
        } else {
            Self {
                status: ToolStatus::Error,
                data,
                error: Some(format!("command exited with code {}", exit_code)),
                duration_ms: None,
                exit_code: Some(exit_code),
            }
        }
    }

    /// Attach a duration to the result.
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_result() {
        let result = ToolResult::success(serde_json::json!({"rows": 3}));
        assert!(result.is_success());
        assert_eq!(result.data["rows"], 3);
        assert!(result.error.is_none());
    }

    #[test]
    fn test_from_shell_exit_codes() {
        let ok = ToolResult::from_shell(0, "out\n".to_string(), String::new());
        assert!(ok.is_success());
        assert_eq!(ok.exit_code, Some(0));

        let failed = ToolResult::from_shell(2, String::new(), "boom\n".to_string());
        assert_eq!(failed.status, ToolStatus::Error);
        assert_eq!(failed.error.as_deref(), Some("command exited with code 2"));
    }

    #[test]
    fn test_serialization_skips_empty_fields() {
        let result = ToolResult::success(serde_json::json!(null));
        let json = serde_json::to_string(&result).unwrap();
        assert!(!json.contains("duration_ms"));
        assert!(!json.contains("exit_code"));

        let timed = ToolResult::timeout(30).with_duration(30000);
        let json = serde_json::to_string(&timed).unwrap();
        assert!(json.contains("\"status\":\"timeout\""));
        assert!(json.contains("30000"));
    }
}
