//! Worker-side secret resolution.
//!
//! The control plane ships opaque credential handles; real values are
//! resolved here, on the worker, so they never transit the event log.
//! The store reads `NOETL_SECRET_<NAME>` environment variables; vault
//! backends plug in behind the same lookup.

use std::collections::HashMap;

/// Environment-backed secret store.
#[derive(Debug, Clone, Default)]
pub struct SecretStore {
    overrides: HashMap<String, String>,
}

impl SecretStore {
    /// Store reading from process environment.
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Inject a secret directly (tests, embedded runs).
    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(name.into(), value.into());
        self
    }

    /// Resolve one secret by binding name.
    pub fn resolve(&self, name: &str) -> Option<String> {
        if let Some(value) = self.overrides.get(name) {
            return Some(value.clone());
        }
        let var = format!("NOETL_SECRET_{}", name.to_uppercase());
        std::env::var(var).ok()
    }

    /// Resolve every binding in a credentials map, by binding name.
    pub fn resolve_bindings(
        &self,
        credentials: &HashMap<String, String>,
    ) -> (HashMap<String, String>, Vec<String>) {
        let mut resolved = HashMap::new();
        let mut missing = Vec::new();

        for name in credentials.keys() {
            match self.resolve(name) {
                Some(value) => {
                    resolved.insert(name.clone(), value);
                }
                None => missing.push(name.clone()),
            }
        }

        (resolved, missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_lookup() {
        let store = SecretStore::from_env().with_secret("api_token", "abc");
        assert_eq!(store.resolve("api_token").as_deref(), Some("abc"));
        assert_eq!(store.resolve("unknown_binding_xyz"), None);
    }

    #[test]
    fn test_resolve_bindings_reports_missing() {
        let store = SecretStore::from_env().with_secret("present", "v");
        let mut credentials = HashMap::new();
        credentials.insert("present".to_string(), "vault://a".to_string());
        credentials.insert("absent".to_string(), "vault://b".to_string());

        let (resolved, missing) = store.resolve_bindings(&credentials);
        assert_eq!(resolved.get("present").map(|s| s.as_str()), Some("v"));
        assert_eq!(missing, vec!["absent"]);
    }
}
