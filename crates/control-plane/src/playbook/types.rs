//! NoETL DSL v2 Types
//!
//! Type definitions for NoETL playbooks:
//! - tool kind selection per step, tool-specific fields flattened alongside
//! - case/when/then conditional routing, next for unconditional routing
//! - iterator and sub-playbook steps handled by the interpreter, everything
//!   else shipped to workers as jobs

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Supported tool kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Shell,
    Http,
    Postgres,
    Duckdb,
    Snowflake,
    Python,
    Iterator,
    Playbook,
    Transfer,
    Rhai,
    Noop,
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ToolKind::Shell => "shell",
            ToolKind::Http => "http",
            ToolKind::Postgres => "postgres",
            ToolKind::Duckdb => "duckdb",
            ToolKind::Snowflake => "snowflake",
            ToolKind::Python => "python",
            ToolKind::Iterator => "iterator",
            ToolKind::Playbook => "playbook",
            ToolKind::Transfer => "transfer",
            ToolKind::Rhai => "rhai",
            ToolKind::Noop => "noop",
        };
        write!(f, "{}", s)
    }
}

/// Target of a routing edge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NextTarget {
    /// Target step name.
    pub step: String,

    /// Extra arguments bound into the target's scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<HashMap<String, serde_json::Value>>,
}

/// Next step specification - a single name, a list of names, or targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NextSpec {
    /// Single step name.
    Single(String),

    /// List of step names.
    List(Vec<String>),

    /// List of step targets with optional args.
    Targets(Vec<NextTarget>),
}

impl NextSpec {
    /// Successor names in definition order.
    pub fn step_names(&self) -> Vec<&str> {
        match self {
            NextSpec::Single(name) => vec![name.as_str()],
            NextSpec::List(names) => names.iter().map(|s| s.as_str()).collect(),
            NextSpec::Targets(targets) => targets.iter().map(|t| t.step.as_str()).collect(),
        }
    }
}

/// One ordered case rule: first truthy `when` selects its `then` list; a
/// rule may also carry the `else` fallback used when nothing matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseRule {
    /// Jinja condition expression.
    #[serde(default)]
    pub when: Option<String>,

    /// Successors when the condition is truthy.
    #[serde(default)]
    pub then: Vec<NextTarget>,

    /// Fallback successors when no rule matches.
    #[serde(default, rename = "else")]
    pub otherwise: Vec<NextTarget>,
}

/// Retry policy for a step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first.
    pub max: i32,

    /// Delay before each re-attempt.
    #[serde(default)]
    pub backoff_seconds: u64,
}

/// What a step failure does to the execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Failure routes through case/next like a completion.
    Continue,
    /// Failure fails the execution (after any on_failure handler).
    #[default]
    Fail,
}

/// Workflow step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Step name (unique within the playbook).
    pub step: String,

    /// Step description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,

    /// Tool kind.
    pub tool: ToolKind,

    /// Template-evaluated inputs for the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<HashMap<String, serde_json::Value>>,

    /// Conditional routing rules. Mutually exclusive with `next`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case: Option<Vec<CaseRule>>,

    /// Unconditional successors. Mutually exclusive with `case`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<NextSpec>,

    /// Result-persistence descriptor, opaque to the core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save: Option<serde_json::Value>,

    /// Retry policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    /// Per-step timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Failure propagation mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<OnError>,

    /// Handler step scheduled before the execution is failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<String>,

    /// Worker-pool capability tag; defaults to "cpu".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,

    /// Tool-specific fields (command, url, collection, path, ...).
    #[serde(flatten)]
    pub spec: HashMap<String, serde_json::Value>,
}

impl Step {
    /// Routing mode of the step failure path.
    pub fn on_error(&self) -> OnError {
        self.on_error.unwrap_or_default()
    }

    /// Capability tag for jobs built from this step.
    pub fn capability_tag(&self) -> &str {
        self.capability.as_deref().unwrap_or("cpu")
    }

    /// All step names this step can route to (case then/else and next).
    pub fn routing_targets(&self) -> Vec<&str> {
        let mut targets = Vec::new();
        if let Some(rules) = &self.case {
            for rule in rules {
                targets.extend(rule.then.iter().map(|t| t.step.as_str()));
                targets.extend(rule.otherwise.iter().map(|t| t.step.as_str()));
            }
        }
        if let Some(next) = &self.next {
            targets.extend(next.step_names());
        }
        targets
    }

    /// Tool-specific fields as a JSON object.
    pub fn spec_value(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.spec
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

/// Iterator execution mode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum IteratorMode {
    Simple(SimpleMode),
    Bounded { parallel: u32 },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SimpleMode {
    Sequential,
    Async,
}

impl Default for IteratorMode {
    fn default() -> Self {
        IteratorMode::Simple(SimpleMode::Sequential)
    }
}

impl IteratorMode {
    /// How many children may be in flight at once, for `total` items.
    pub fn max_in_flight(&self, total: usize) -> usize {
        match self {
            IteratorMode::Simple(SimpleMode::Sequential) => 1,
            IteratorMode::Simple(SimpleMode::Async) => total,
            IteratorMode::Bounded { parallel } => (*parallel as usize).max(1),
        }
    }
}

/// Tool-specific fields of an `iterator` step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IteratorSpec {
    /// Template or literal resolving to the collection to iterate.
    pub collection: serde_json::Value,

    /// Execution mode.
    #[serde(default)]
    pub mode: IteratorMode,

    /// Keep going past failed children; failed slots appear as null results.
    #[serde(default)]
    pub continue_on_error: bool,

    /// The task fanned out per element.
    pub task: TaskSpec,
}

/// The per-element task inside an iterator.
///
/// Any non-iterator tool is allowed, including `playbook`: that fans a
/// sub-playbook execution out per item, tracked in the slot's
/// `child_execution_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Tool kind for each child.
    pub tool: ToolKind,

    /// Extra args bound per child alongside `item` and `loop_index`.
    #[serde(default)]
    pub args: HashMap<String, serde_json::Value>,

    /// Tool-specific fields.
    #[serde(flatten)]
    pub spec: HashMap<String, serde_json::Value>,
}

impl TaskSpec {
    /// Tool-specific fields as a JSON object.
    pub fn spec_value(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.spec
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

/// Tool-specific fields of a `playbook` step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybookCallSpec {
    /// Catalog path of the child playbook.
    pub path: String,

    /// Pinned version; latest when absent.
    #[serde(default)]
    pub version: Option<i32>,
}

/// Executor hint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Executor {
    #[serde(default = "default_profile")]
    pub profile: String,

    #[serde(default)]
    pub version: Option<String>,
}

fn default_profile() -> String {
    "distributed".to_string()
}

impl Default for Executor {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            version: None,
        }
    }
}

/// Playbook metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    /// Playbook name (required).
    pub name: String,

    /// Resource path.
    #[serde(default)]
    pub path: Option<String>,

    /// Description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Complete playbook definition (v2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playbook {
    /// API version (noetl.io/v2).
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (Playbook).
    pub kind: String,

    /// Metadata (name, path).
    pub metadata: Metadata,

    /// Executor hint.
    #[serde(default)]
    pub executor: Executor,

    /// Default workload inputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload: Option<serde_json::Value>,

    /// Execution deadline in seconds; exceeding it cancels the execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<u64>,

    /// Credential bindings: name -> opaque handle resolved on workers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<HashMap<String, String>>,

    /// Workflow steps.
    pub workflow: Vec<Step>,
}

impl Playbook {
    /// Get a step by name.
    pub fn get_step(&self, name: &str) -> Option<&Step> {
        self.workflow.iter().find(|s| s.step == name)
    }

    /// The entry step: `start` when present, otherwise the first step.
    pub fn entry_step(&self) -> Option<&Step> {
        self.get_step("start").or_else(|| self.workflow.first())
    }

    /// All step names in definition order.
    pub fn step_names(&self) -> Vec<&str> {
        self.workflow.iter().map(|s| s.step.as_str()).collect()
    }

    /// Reverse routing edges: target step -> steps that can select it.
    ///
    /// `on_failure` edges are excluded; handlers are only reachable on
    /// failure and must not count toward skip fan-in.
    pub fn predecessors(&self) -> HashMap<&str, Vec<&str>> {
        let mut preds: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in &self.workflow {
            for target in step.routing_targets() {
                preds.entry(target).or_default().push(step.step.as_str());
            }
        }
        preds
    }

    /// The resource path.
    pub fn path(&self) -> Option<&str> {
        self.metadata.path.as_deref()
    }

    /// The playbook name.
    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_playbook() {
        let yaml = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata:
  name: test_playbook
  path: test/simple
workflow:
  - step: start
    tool: shell
    command: echo hello
    next:
      - step: finish
  - step: finish
    tool: noop
"#;

        let playbook: Playbook = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(playbook.api_version, "noetl.io/v2");
        assert_eq!(playbook.name(), "test_playbook");
        assert_eq!(playbook.workflow.len(), 2);
        assert_eq!(playbook.entry_step().unwrap().step, "start");

        let start = playbook.get_step("start").unwrap();
        assert_eq!(start.tool, ToolKind::Shell);
        assert_eq!(start.spec["command"], "echo hello");
        assert_eq!(start.routing_targets(), vec!["finish"]);
    }

    #[test]
    fn test_parse_case_rules() {
        let yaml = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata:
  name: case_test
workflow:
  - step: route
    tool: noop
    case:
      - when: "{{ workload.env }} == prod"
        then:
          - step: prod_deploy
      - else:
          - step: staging_deploy
  - step: prod_deploy
    tool: shell
    command: ./deploy prod
  - step: staging_deploy
    tool: shell
    command: ./deploy staging
"#;

        let playbook: Playbook = serde_yaml::from_str(yaml).unwrap();
        let route = playbook.get_step("route").unwrap();
        let rules = route.case.as_ref().unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].when.as_deref(), Some("{{ workload.env }} == prod"));
        assert_eq!(rules[1].otherwise[0].step, "staging_deploy");

        let preds = playbook.predecessors();
        assert_eq!(preds["prod_deploy"], vec!["route"]);
        assert_eq!(preds["staging_deploy"], vec!["route"]);
    }

    #[test]
    fn test_parse_iterator_spec() {
        let yaml = r#"
step: fanout
tool: iterator
collection: "{{ workload.targets }}"
mode: async
task:
  tool: http
  url: "https://{{ item.host }}/ping"
"#;

        let step: Step = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(step.tool, ToolKind::Iterator);

        let iter: IteratorSpec = serde_json::from_value(step.spec_value()).unwrap();
        assert_eq!(iter.mode, IteratorMode::Simple(SimpleMode::Async));
        assert_eq!(iter.task.tool, ToolKind::Http);
        assert_eq!(iter.task.spec["url"], "https://{{ item.host }}/ping");
    }

    #[test]
    fn test_iterator_mode_parallel() {
        let mode: IteratorMode = serde_yaml::from_str("parallel: 3").unwrap();
        assert_eq!(mode, IteratorMode::Bounded { parallel: 3 });
        assert_eq!(mode.max_in_flight(10), 3);

        let mode: IteratorMode = serde_yaml::from_str("sequential").unwrap();
        assert_eq!(mode.max_in_flight(10), 1);

        let mode: IteratorMode = serde_yaml::from_str("async").unwrap();
        assert_eq!(mode.max_in_flight(10), 10);
    }

    #[test]
    fn test_next_spec_forms() {
        let single: NextSpec = serde_yaml::from_str(r#""build""#).unwrap();
        assert_eq!(single.step_names(), vec!["build"]);

        let list: NextSpec = serde_yaml::from_str("[build, test]").unwrap();
        assert_eq!(list.step_names(), vec!["build", "test"]);

        let targets: NextSpec = serde_yaml::from_str("- step: build\n- step: test").unwrap();
        assert_eq!(targets.step_names(), vec!["build", "test"]);
    }

    #[test]
    fn test_retry_policy_defaults() {
        let retry: RetryPolicy = serde_yaml::from_str("max: 3").unwrap();
        assert_eq!(retry.max, 3);
        assert_eq!(retry.backoff_seconds, 0);
    }

    #[test]
    fn test_entry_step_fallback() {
        let yaml = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata:
  name: no_start
workflow:
  - step: first
    tool: noop
"#;
        let playbook: Playbook = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(playbook.entry_step().unwrap().step, "first");
    }
}
