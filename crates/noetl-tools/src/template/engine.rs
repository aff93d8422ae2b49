//! Jinja2-style rendering for tool specs on the worker.
//!
//! The control plane expands almost every template before a job is enqueued;
//! what reaches the worker still containing `{{ ... }}` is the `secret`
//! namespace, which is substituted here so secret values never transit the
//! event log.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use minijinja::{Environment, Error, ErrorKind, UndefinedBehavior, Value};
use std::collections::HashMap;

use crate::error::ToolError;

/// Template engine with the filters tool specs rely on.
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    /// Create a new template engine.
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::SemiStrict);

        env.add_filter("b64encode", filter_b64encode);
        env.add_filter("b64decode", filter_b64decode);
        env.add_filter("to_json", filter_to_json);
        env.add_filter("tojson", filter_to_json);

        Self { env }
    }

    /// Check if a string contains template syntax.
    pub fn is_template(s: &str) -> bool {
        s.contains("{{") && s.contains("}}")
    }

    /// Render a template string with the given context.
    pub fn render(
        &self,
        template: &str,
        context: &HashMap<String, serde_json::Value>,
    ) -> Result<String, ToolError> {
        if !Self::is_template(template) {
            return Ok(template.to_string());
        }

        let ctx: HashMap<&str, Value> = context
            .iter()
            .map(|(k, v)| (k.as_str(), Value::from_serialize(v)))
            .collect();

        self.env
            .render_str(template, ctx)
            .map_err(|e| ToolError::Template(format!("render error: {}", e)))
    }

    /// Render every string scalar in a JSON structure, recursively.
    pub fn render_value(
        &self,
        value: &serde_json::Value,
        context: &HashMap<String, serde_json::Value>,
    ) -> Result<serde_json::Value, ToolError> {
        match value {
            serde_json::Value::String(s) => Ok(serde_json::Value::String(self.render(s, context)?)),
            serde_json::Value::Object(map) => {
                let mut result = serde_json::Map::new();
                for (k, v) in map {
                    result.insert(k.clone(), self.render_value(v, context)?);
                }
                Ok(serde_json::Value::Object(result))
            }
            serde_json::Value::Array(arr) => {
                let rendered: Result<Vec<_>, _> =
                    arr.iter().map(|v| self.render_value(v, context)).collect();
                Ok(serde_json::Value::Array(rendered?))
            }
            _ => Ok(value.clone()),
        }
    }
}

fn filter_b64encode(value: &Value) -> String {
    BASE64.encode(value.to_string().as_bytes())
}

fn filter_b64decode(value: &Value) -> Result<String, Error> {
    let decoded = BASE64.decode(value.to_string().as_bytes()).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("b64decode error: {}", e),
        )
    })?;
    String::from_utf8(decoded)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("utf8 error: {}", e)))
}

fn filter_to_json(value: &Value) -> Result<String, Error> {
    serde_json::to_string(&value)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("to_json error: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with_secret() -> HashMap<String, serde_json::Value> {
        let mut ctx = HashMap::new();
        ctx.insert(
            "secret".to_string(),
            serde_json::json!({"token": "abc123"}),
        );
        ctx.insert("host".to_string(), serde_json::json!("api.example.com"));
        ctx
    }

    #[test]
    fn test_secret_substitution() {
        let engine = TemplateEngine::new();
        let rendered = engine
            .render("Bearer {{ secret.token }}", &ctx_with_secret())
            .unwrap();
        assert_eq!(rendered, "Bearer abc123");
    }

    #[test]
    fn test_missing_secret_fails() {
        let engine = TemplateEngine::new();
        let result = engine.render("{{ secret.nope }}", &ctx_with_secret());
        assert!(matches!(result, Err(ToolError::Template(_))));
    }

    #[test]
    fn test_render_value_recurses() {
        let engine = TemplateEngine::new();
        let spec = serde_json::json!({
            "url": "https://{{ host }}/v1",
            "headers": {"Authorization": "Bearer {{ secret.token }}"},
            "retries": 3,
        });

        let rendered = engine.render_value(&spec, &ctx_with_secret()).unwrap();
        assert_eq!(rendered["url"], "https://api.example.com/v1");
        assert_eq!(rendered["headers"]["Authorization"], "Bearer abc123");
        assert_eq!(rendered["retries"], 3);
    }

    #[test]
    fn test_non_template_passthrough() {
        let engine = TemplateEngine::new();
        let rendered = engine.render("plain text", &HashMap::new()).unwrap();
        assert_eq!(rendered, "plain text");
    }

    #[test]
    fn test_b64_filters() {
        let engine = TemplateEngine::new();
        let ctx = ctx_with_secret();
        let encoded = engine.render("{{ secret.token | b64encode }}", &ctx).unwrap();
        assert_eq!(encoded, "YWJjMTIz");
    }
}
