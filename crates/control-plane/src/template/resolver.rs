//! Jinja2-style template rendering using minijinja.
//!
//! Resolves `{{ ... }}` fragments against the scoped execution context.
//! A scalar that is a single expression keeps its native type; anything
//! interpolated into surrounding text renders to a string. Undefined
//! references fail with `AppError::Resolution`; the `default` filter
//! suppresses that.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use minijinja::{value::ValueKind, Environment, Error, ErrorKind, UndefinedBehavior, Value};
use std::collections::HashMap;

use crate::error::{AppError, AppResult};

/// Template resolver with custom filters and strict undefined handling.
pub struct TemplateResolver {
    env: Environment<'static>,
}

impl Default for TemplateResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateResolver {
    /// Create a new resolver with the filter set playbooks rely on.
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::SemiStrict);

        env.add_filter("b64encode", filter_b64encode);
        env.add_filter("b64decode", filter_b64decode);
        env.add_filter("to_json", filter_to_json);
        env.add_filter("tojson", filter_to_json);
        env.add_filter("from_json", filter_from_json);
        env.add_filter("int", filter_int);
        env.add_filter("float", filter_float);
        env.add_filter("string", filter_string);
        env.add_filter("split", filter_split);
        env.add_filter("keys", filter_keys);
        env.add_filter("values", filter_values);

        Self { env }
    }

    /// Check if a string contains template syntax.
    pub fn is_template(s: &str) -> bool {
        (s.contains("{{") && s.contains("}}")) || (s.contains("{%") && s.contains("%}"))
    }

    /// A scalar whose entire content is one `{{ expr }}` fragment.
    fn sole_expression(s: &str) -> Option<&str> {
        let trimmed = s.trim();
        let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?;
        if inner.contains("{{") || inner.contains("}}") {
            return None;
        }
        Some(inner.trim())
    }

    /// Render a template string to text.
    pub fn render(
        &self,
        template: &str,
        context: &HashMap<String, serde_json::Value>,
    ) -> AppResult<String> {
        if !Self::is_template(template) {
            return Ok(template.to_string());
        }

        self.env
            .render_str(template, context)
            .map_err(resolution_error)
    }

    /// Resolve a string to a JSON value, preserving native types when the
    /// string is a single expression.
    pub fn resolve_str(
        &self,
        template: &str,
        context: &HashMap<String, serde_json::Value>,
    ) -> AppResult<serde_json::Value> {
        if let Some(expr) = Self::sole_expression(template) {
            return self.eval_expression(expr, context);
        }

        Ok(serde_json::Value::String(self.render(template, context)?))
    }

    /// Evaluate one expression to a typed value.
    ///
    /// The plain render runs first so undefined references fail under
    /// SemiStrict; the tojson pass then recovers the native type.
    fn eval_expression(
        &self,
        expr: &str,
        context: &HashMap<String, serde_json::Value>,
    ) -> AppResult<serde_json::Value> {
        let probe = format!("{{{{ {} }}}}", expr);
        self.env
            .render_str(&probe, context)
            .map_err(resolution_error)?;

        let typed = format!("{{{{ ({}) | tojson }}}}", expr);
        let rendered = self
            .env
            .render_str(&typed, context)
            .map_err(resolution_error)?;

        serde_json::from_str(&rendered)
            .or(Ok(serde_json::Value::String(rendered)))
    }

    /// Resolve a nested structure (map or list) recursively.
    pub fn resolve_value(
        &self,
        value: &serde_json::Value,
        context: &HashMap<String, serde_json::Value>,
    ) -> AppResult<serde_json::Value> {
        match value {
            serde_json::Value::String(s) => self.resolve_str(s, context),
            serde_json::Value::Object(map) => {
                let mut result = serde_json::Map::new();
                for (k, v) in map {
                    result.insert(k.clone(), self.resolve_value(v, context)?);
                }
                Ok(serde_json::Value::Object(result))
            }
            serde_json::Value::Array(arr) => {
                let resolved: Result<Vec<_>, _> =
                    arr.iter().map(|v| self.resolve_value(v, context)).collect();
                Ok(serde_json::Value::Array(resolved?))
            }
            _ => Ok(value.clone()),
        }
    }

    /// Evaluate a `when` condition to a boolean.
    ///
    /// Playbooks write conditions in two shapes. A fully templated
    /// expression (`{{ workload.count > 3 }}`) evaluates through minijinja.
    /// The rendered-comparison shape (`{{ workload.env }} == prod`) renders
    /// the template fragments first and compares the remaining text:
    /// both sides whitespace-trimmed, numbers compared numerically when
    /// both parse.
    pub fn evaluate_condition(
        &self,
        condition: &str,
        context: &HashMap<String, serde_json::Value>,
    ) -> AppResult<bool> {
        if let Some(expr) = Self::sole_expression(condition) {
            let value = self.eval_expression(expr, context)?;
            return Ok(json_truthy(&value));
        }

        let rendered = self.render(condition, context)?;
        Ok(evaluate_rendered(&rendered))
    }
}

/// Jinja truthiness over a JSON value.
fn json_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
    }
}

/// Evaluate a condition string with all templates already substituted.
fn evaluate_rendered(rendered: &str) -> bool {
    for op in ["==", "!=", "<=", ">=", "<", ">"] {
        if let Some((left, right)) = rendered.split_once(op) {
            return compare_coerced(left, right, op);
        }
    }

    matches!(
        rendered.trim().to_lowercase().as_str(),
        "true" | "1" | "yes"
    )
}

/// Trimmed, number-coercing comparison of two rendered fragments.
fn compare_coerced(left: &str, right: &str, op: &str) -> bool {
    let left = left.trim().trim_matches(|c| c == '"' || c == '\'');
    let right = right.trim().trim_matches(|c| c == '"' || c == '\'');

    if let (Ok(l), Ok(r)) = (left.parse::<f64>(), right.parse::<f64>()) {
        return match op {
            "==" => l == r,
            "!=" => l != r,
            "<" => l < r,
            "<=" => l <= r,
            ">" => l > r,
            ">=" => l >= r,
            _ => false,
        };
    }

    match op {
        "==" => left == right,
        "!=" => left != right,
        "<" => left < right,
        "<=" => left <= right,
        ">" => left > right,
        ">=" => left >= right,
        _ => false,
    }
}

fn resolution_error(e: minijinja::Error) -> AppError {
    match e.kind() {
        ErrorKind::UndefinedError => AppError::Resolution(e.to_string()),
        _ => AppError::Resolution(format!("Template render error: {}", e)),
    }
}

// ============================================================================
// Custom Filters
// ============================================================================

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

fn filter_from_json(value: &Value) -> Result<Value, Error> {
    let parsed: serde_json::Value = serde_json::from_str(&value.to_string()).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("from_json error: {}", e),
        )
    })?;
    Ok(Value::from_serialize(&parsed))
}

fn filter_int(value: &Value) -> Result<i64, Error> {
    if let Some(i) = value.as_i64() {
        return Ok(i);
    }
    let s = value.to_string();
    if let Ok(f) = s.parse::<f64>() {
        return Ok(f as i64);
    }
    s.parse::<i64>()
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("int error: {}", e)))
}

fn filter_float(value: &Value) -> Result<f64, Error> {
    if let Some(i) = value.as_i64() {
        return Ok(i as f64);
    }
    value
        .to_string()
        .parse::<f64>()
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("float error: {}", e)))
}

fn filter_string(value: &Value) -> String {
    value.to_string()
}

fn filter_split(value: &Value, sep: Option<&Value>) -> Vec<String> {
    let s = value.to_string();
    let separator = sep
        .map(|v| v.to_string())
        .unwrap_or_else(|| " ".to_string());
    s.split(&separator).map(|s| s.to_string()).collect()
}

fn filter_keys(value: &Value) -> Result<Vec<String>, Error> {
    if value.kind() != ValueKind::Map {
        return Err(Error::new(
            ErrorKind::InvalidOperation,
            "keys requires a mapping",
        ));
    }
    let iter = value
        .try_iter()
        .map_err(|_| Error::new(ErrorKind::InvalidOperation, "cannot iterate keys"))?;
    Ok(iter.map(|v| v.to_string()).collect())
}

fn filter_values(value: &Value) -> Result<Vec<Value>, Error> {
    if value.kind() != ValueKind::Map {
        return Err(Error::new(
            ErrorKind::InvalidOperation,
            "values requires a mapping",
        ));
    }
    let iter = value
        .try_iter()
        .map_err(|_| Error::new(ErrorKind::InvalidOperation, "cannot iterate values"))?;
    let mut result = Vec::new();
    for key in iter {
        if let Ok(val) = value.get_item(&key) {
            result.push(val);
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_context() -> HashMap<String, serde_json::Value> {
        let mut ctx = HashMap::new();
        ctx.insert(
            "workload".to_string(),
            serde_json::json!({"env": "prod", "count": 5, "targets": [{"id": 1}, {"id": 2}]}),
        );
        ctx.insert(
            "fetch".to_string(),
            serde_json::json!({"rows": 42, "status": "ok"}),
        );
        ctx.insert("name".to_string(), serde_json::json!("Alice"));
        ctx
    }

    #[test]
    fn test_interpolation_renders_string() {
        let resolver = TemplateResolver::new();
        let result = resolver
            .render("Hello, {{ name }}!", &make_context())
            .unwrap();
        assert_eq!(result, "Hello, Alice!");
    }

    #[test]
    fn test_sole_expression_preserves_type() {
        let resolver = TemplateResolver::new();
        let ctx = make_context();

        let count = resolver.resolve_str("{{ workload.count }}", &ctx).unwrap();
        assert_eq!(count, serde_json::json!(5));

        let targets = resolver.resolve_str("{{ workload.targets }}", &ctx).unwrap();
        assert!(targets.is_array());
        assert_eq!(targets[1]["id"], 2);
    }

    #[test]
    fn test_step_result_proxy_access() {
        let resolver = TemplateResolver::new();
        let ctx = make_context();

        // {{ fetch }} yields the whole data payload, {{ fetch.rows }} descends.
        let whole = resolver.resolve_str("{{ fetch }}", &ctx).unwrap();
        assert_eq!(whole["rows"], 42);

        let field = resolver.resolve_str("{{ fetch.rows }}", &ctx).unwrap();
        assert_eq!(field, serde_json::json!(42));
    }

    #[test]
    fn test_unresolved_reference_fails() {
        let resolver = TemplateResolver::new();
        let result = resolver.resolve_str("{{ missing_step.field }}", &make_context());
        assert!(matches!(result, Err(AppError::Resolution(_))));

        let rendered = resolver.render("value: {{ missing }}", &make_context());
        assert!(matches!(rendered, Err(AppError::Resolution(_))));
    }

    #[test]
    fn test_default_filter_suppresses_missing() {
        let resolver = TemplateResolver::new();
        let result = resolver
            .resolve_str("{{ missing | default('fallback') }}", &make_context())
            .unwrap();
        assert_eq!(result, serde_json::json!("fallback"));
    }

    #[test]
    fn test_resolve_value_nested() {
        let resolver = TemplateResolver::new();
        let value = serde_json::json!({
            "greeting": "Hello, {{ name }}!",
            "copies": "{{ workload.count }}",
            "static": 7,
        });

        let resolved = resolver.resolve_value(&value, &make_context()).unwrap();
        assert_eq!(resolved["greeting"], "Hello, Alice!");
        assert_eq!(resolved["copies"], 5);
        assert_eq!(resolved["static"], 7);
    }

    #[test]
    fn test_condition_rendered_comparison() {
        let resolver = TemplateResolver::new();
        let ctx = make_context();

        assert!(resolver
            .evaluate_condition("{{ workload.env }} == prod", &ctx)
            .unwrap());
        assert!(!resolver
            .evaluate_condition("{{ workload.env }} == staging", &ctx)
            .unwrap());
        // Numeric coercion: "5" == 5.0
        assert!(resolver
            .evaluate_condition("{{ workload.count }} == 5.0", &ctx)
            .unwrap());
        assert!(resolver
            .evaluate_condition("{{ workload.count }} >= 4", &ctx)
            .unwrap());
    }

    #[test]
    fn test_condition_full_expression() {
        let resolver = TemplateResolver::new();
        let ctx = make_context();

        assert!(resolver
            .evaluate_condition("{{ workload.count > 3 }}", &ctx)
            .unwrap());
        assert!(!resolver
            .evaluate_condition("{{ workload.count > 10 }}", &ctx)
            .unwrap());
        assert!(resolver
            .evaluate_condition("{{ workload.env == 'prod' and workload.count == 5 }}", &ctx)
            .unwrap());
    }

    #[test]
    fn test_condition_truthy_literal() {
        let resolver = TemplateResolver::new();
        let ctx = make_context();
        assert!(resolver.evaluate_condition("true", &ctx).unwrap());
        assert!(!resolver.evaluate_condition("false", &ctx).unwrap());
        assert!(!resolver.evaluate_condition("", &ctx).unwrap());
    }

    #[test]
    fn test_condition_whitespace_trimmed() {
        let resolver = TemplateResolver::new();
        let ctx = make_context();
        assert!(resolver
            .evaluate_condition("  {{ workload.env }}   ==   prod  ", &ctx)
            .unwrap());
    }

    #[test]
    fn test_filters() {
        let resolver = TemplateResolver::new();
        let ctx = make_context();

        assert_eq!(
            resolver.render("{{ name | upper }}", &ctx).unwrap(),
            "ALICE"
        );
        assert_eq!(
            resolver
                .render("{{ workload.targets | length }}", &ctx)
                .unwrap(),
            "2"
        );
        assert_eq!(
            resolver.render("{{ name | b64encode }}", &ctx).unwrap(),
            "QWxpY2U="
        );
        let json = resolver
            .resolve_str("{{ fetch | to_json }}", &ctx)
            .unwrap();
        assert!(json.as_str().unwrap().contains("\"rows\":42"));
    }

    #[test]
    fn test_split_filter() {
        let resolver = TemplateResolver::new();
        let mut ctx = make_context();
        ctx.insert("csv".to_string(), serde_json::json!("a,b,c"));

        let parts = resolver
            .resolve_str("{{ csv | split(',') }}", &ctx)
            .unwrap();
        assert_eq!(parts, serde_json::json!(["a", "b", "c"]));

        // Default separator is a single space.
        ctx.insert("words".to_string(), serde_json::json!("one two"));
        let parts = resolver
            .resolve_str("{{ words | split }}", &ctx)
            .unwrap();
        assert_eq!(parts, serde_json::json!(["one", "two"]));
    }

    #[test]
    fn test_secret_placeholder_round_trip() {
        // The server-side context maps each credential to its own template
        // text, so rendering leaves secret references for the worker.
        let resolver = TemplateResolver::new();
        let mut ctx = make_context();
        ctx.insert(
            "secret".to_string(),
            serde_json::json!({"api_token": "{{ secret.api_token }}"}),
        );

        let rendered = resolver
            .render("Bearer {{ secret.api_token }}", &ctx)
            .unwrap();
        assert_eq!(rendered, "Bearer {{ secret.api_token }}");
    }

    #[test]
    fn test_plain_text_passthrough() {
        let resolver = TemplateResolver::new();
        assert_eq!(
            resolver.render("no templates here", &HashMap::new()).unwrap(),
            "no templates here"
        );
    }
}
