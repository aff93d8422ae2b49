//! Sensitive data sanitization.
//!
//! Redacts bearer tokens, passwords, and API keys from JSON values before
//! they are persisted to the event log. Secrets proper are resolved on
//! workers and never transit the control plane; this guards against tool
//! results and args that happen to carry credentials anyway.

use serde_json::{Map, Value};

/// Redaction placeholder.
const REDACTED: &str = "[REDACTED]";

/// Key fragments that indicate sensitive data (lowercase).
static SENSITIVE_KEYS: &[&str] = &[
    "password",
    "passwd",
    "token",
    "api_key",
    "apikey",
    "authorization",
    "credential",
    "private_key",
    "secret_key",
    "client_secret",
    "passphrase",
    "connection_string",
];

/// Check if a key indicates sensitive data.
fn is_sensitive_key(key: &str) -> bool {
    let key_lower = key.to_lowercase().replace('-', "_");
    SENSITIVE_KEYS.iter().any(|s| key_lower.contains(s))
}

/// Template placeholders are references, not values; keep them readable.
fn is_placeholder(value: &Value) -> bool {
    value
        .as_str()
        .map(|s| s.trim_start().starts_with("{{") && s.trim_end().ends_with("}}"))
        .unwrap_or(false)
}

/// Recursively redact sensitive values from a JSON structure.
pub fn sanitize_sensitive_data(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sanitized = Map::new();
            for (key, val) in map {
                if is_sensitive_key(key) && !val.is_object() && !val.is_array() {
                    if is_placeholder(val) {
                        sanitized.insert(key.clone(), val.clone());
                    } else {
                        sanitized.insert(key.clone(), Value::String(REDACTED.to_string()));
                    }
                } else {
                    sanitized.insert(key.clone(), sanitize_sensitive_data(val));
                }
            }
            Value::Object(sanitized)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sanitize_sensitive_data).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_sensitive_keys() {
        let input = serde_json::json!({
            "username": "alice",
            "password": "hunter2",
            "nested": {"api_key": "abc123", "count": 3},
        });

        let sanitized = sanitize_sensitive_data(&input);
        assert_eq!(sanitized["username"], "alice");
        assert_eq!(sanitized["password"], REDACTED);
        assert_eq!(sanitized["nested"]["api_key"], REDACTED);
        assert_eq!(sanitized["nested"]["count"], 3);
    }

    #[test]
    fn test_keeps_template_placeholders() {
        let input = serde_json::json!({"auth_token": "{{ secret.api_token }}"});
        let sanitized = sanitize_sensitive_data(&input);
        assert_eq!(sanitized["auth_token"], "{{ secret.api_token }}");
    }

    #[test]
    fn test_case_and_dash_insensitive() {
        let input = serde_json::json!({"API-Key": "x", "Authorization": "Bearer y"});
        let sanitized = sanitize_sensitive_data(&input);
        assert_eq!(sanitized["API-Key"], REDACTED);
        assert_eq!(sanitized["Authorization"], REDACTED);
    }

    #[test]
    fn test_arrays_recursed() {
        let input = serde_json::json!([{"token": "t"}, {"plain": 1}]);
        let sanitized = sanitize_sensitive_data(&input);
        assert_eq!(sanitized[0]["token"], REDACTED);
        assert_eq!(sanitized[1]["plain"], 1);
    }
}
