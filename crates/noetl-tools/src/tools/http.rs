//! HTTP request tool.

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::context::ToolContext;
use crate::error::ToolError;
use crate::registry::{ProgressSink, Tool, ToolSpec};
use crate::result::ToolResult;
use crate::template::TemplateEngine;

/// HTTP method.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
#[allow(clippy::upper_case_acronyms)] // HTTP methods are conventionally uppercase
pub enum HttpMethod {
    #[default]
    GET,
    POST,
    PUT,
    PATCH,
    DELETE,
    HEAD,
}

impl From<HttpMethod> for Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::GET => Method::GET,
            HttpMethod::POST => Method::POST,
            HttpMethod::PUT => Method::PUT,
            HttpMethod::PATCH => Method::PATCH,
            HttpMethod::DELETE => Method::DELETE,
            HttpMethod::HEAD => Method::HEAD,
        }
    }
}

/// HTTP tool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// URL to request.
    pub url: String,

    /// HTTP method (default: GET).
    #[serde(default)]
    pub method: HttpMethod,

    /// Request headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// JSON body (for POST/PUT/PATCH).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<serde_json::Value>,

    /// Query parameters.
    #[serde(default)]
    pub params: HashMap<String, String>,
}

/// HTTP request tool.
pub struct HttpTool {
    client: reqwest::Client,
    template_engine: TemplateEngine,
}

impl HttpTool {
    /// Create a new HTTP tool.
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            client,
            template_engine: TemplateEngine::new(),
        }
    }

    async fn request(
        &self,
        config: &HttpConfig,
        timeout_seconds: Option<u64>,
    ) -> Result<ToolResult, ToolError> {
        let start = std::time::Instant::now();

        let mut request = self
            .client
            .request(config.method.clone().into(), &config.url);

        for (k, v) in &config.headers {
            request = request.header(k, v);
        }
        if !config.params.is_empty() {
            request = request.query(&config.params);
        }
        if let Some(json) = &config.json {
            request = request.json(json);
        }
        if let Some(seconds) = timeout_seconds {
            request = request.timeout(Duration::from_secs(seconds));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                let duration_ms = start.elapsed().as_millis() as u64;
                return Ok(
                    ToolResult::timeout(timeout_seconds.unwrap_or(30)).with_duration(duration_ms)
                );
            }
            Err(e) => return Err(ToolError::Http(e.to_string())),
        };

        let status = response.status();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();

        let text = response.text().await?;
        let body: serde_json::Value =
            serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));

        let duration_ms = start.elapsed().as_millis() as u64;
        let data = serde_json::json!({
            "status_code": status.as_u16(),
            "headers": headers,
            "body": body,
        });

        if status.is_success() {
            Ok(ToolResult::success(data).with_duration(duration_ms))
        } else {
            let mut result = ToolResult::error(format!("HTTP {}", status.as_u16()));
            result.data = data;
            Ok(result.with_duration(duration_ms))
        }
    }
}

impl Default for HttpTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for HttpTool {
    fn name(&self) -> &'static str {
        "http"
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

        let config: HttpConfig = serde_json::from_value(rendered)
            .map_err(|e| ToolError::Configuration(format!("invalid http config: {}", e)))?;

        tracing::debug!(
            execution_id = ctx.execution_id,
            step = %ctx.step,
            url = %config.url,
            "Executing HTTP request"
        );

        tokio::select! {
            result = self.request(&config, spec.timeout) => result,
            _ = cancel.cancelled() => Err(ToolError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_config_defaults() {
        let config: HttpConfig =
            serde_json::from_value(serde_json::json!({"url": "https://example.com"})).unwrap();
        assert!(matches!(config.method, HttpMethod::GET));
        assert!(config.headers.is_empty());
        assert!(config.json.is_none());
    }

    #[test]
    fn test_http_config_full() {
        let config: HttpConfig = serde_json::from_value(serde_json::json!({
            "url": "https://example.com/api",
            "method": "POST",
            "headers": {"Authorization": "Bearer x"},
            "json": {"id": 1},
            "params": {"page": "2"}
        }))
        .unwrap();

        assert!(matches!(config.method, HttpMethod::POST));
        assert_eq!(config.params["page"], "2");
        assert_eq!(config.json.unwrap()["id"], 1);
    }

    #[test]
    fn test_method_conversion() {
        assert_eq!(Method::from(HttpMethod::DELETE), Method::DELETE);
        assert_eq!(Method::from(HttpMethod::PATCH), Method::PATCH);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result: Result<HttpConfig, _> =
            serde_json::from_value(serde_json::json!({"method": "GET"}));
        assert!(result.is_err());
    }
}
