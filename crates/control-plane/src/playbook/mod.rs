//! Playbook definition: types and parsing for the NoETL DSL v2.

pub mod parser;
pub mod types;

pub use parser::parse_playbook;
pub use types::{Playbook, Step, ToolKind};
