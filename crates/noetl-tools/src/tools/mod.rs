//! Built-in tool adapters.
//!
//! Database, scripting, and cloud adapters live in their own crates and
//! register themselves against the same [`ToolRegistry`]; the built-ins here
//! are the ones every worker pool carries.

pub mod http;
pub mod noop;
pub mod shell;

use crate::registry::ToolRegistry;

/// Create a registry with all built-in tools registered.
pub fn create_default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(shell::ShellTool::new());
    registry.register(http::HttpTool::new());
    registry.register(noop::NoopTool);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_contents() {
        let registry = create_default_registry();
        assert!(registry.has("shell"));
        assert!(registry.has("http"));
        assert!(registry.has("noop"));
    }
}
