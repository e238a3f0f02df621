use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::Path;

use skillflow_core::{FlowError, NodeId, Result, ServerId, SkillId, ToolDescriptor, skill_tool_name};

use crate::transform::ParameterTransform;

/// A versioned, immutable skill: a graph of nodes plus its I/O contracts.
///
/// Stored as one JSON document per version:
///
/// ```json
/// {
///   "id": "fetch_and_store",
///   "version": 2,
///   "name": "Fetch and store",
///   "inputs_schema": { "type": "object", "required": ["url"] },
///   "graph": {
///     "nodes": [
///       { "id": "fetch", "kind": "tool_call", "server": "web", "tool": "fetch",
///         "args_template": { "url": "$inputs.url" } },
///       { "id": "save", "kind": "tool_call", "server": "fs", "tool": "write",
///         "depends_on": ["fetch"], "args_template": { "data": "@fetch.outputs.body" } }
///     ],
///     "concurrency": { "mode": "sequential" }
///   }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillDefinition {
    pub id: SkillId,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default = "permissive_schema")]
    pub inputs_schema: Value,
    #[serde(default = "permissive_schema")]
    pub output_schema: Value,
    pub graph: SkillGraph,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

fn default_version() -> u32 {
    1
}

fn permissive_schema() -> Value {
    json!({ "type": "object" })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillGraph {
    pub nodes: Vec<SkillNode>,
    #[serde(default)]
    pub concurrency: Concurrency,
}

// ── Nodes ──────────────────────────────────────────────────────

/// One step of a skill graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillNode {
    pub id: NodeId,
    #[serde(flatten)]
    pub kind: NodeKind,
    #[serde(default)]
    pub depends_on: Vec<NodeId>,
    #[serde(default = "empty_object")]
    pub args_template: Value,
    #[serde(default)]
    pub error_strategy: ErrorStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_config: Option<RetryConfig>,
    /// Output name → path into this node's raw result.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub export_outputs: BTreeMap<String, String>,
    /// Bound on a single attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_transform: Option<ParameterTransform>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

fn empty_object() -> Value {
    json!({})
}

/// Kind-specific payload, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    ToolCall {
        server: ServerId,
        tool: String,
    },
    SkillCall {
        skill: SkillId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<u32>,
    },
    Conditional {
        conditional: ConditionalSpec,
    },
    Loop {
        #[serde(rename = "loop")]
        spec: LoopSpec,
    },
    Control,
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::ToolCall { .. } => "tool_call",
            NodeKind::SkillCall { .. } => "skill_call",
            NodeKind::Conditional { .. } => "conditional",
            NodeKind::Loop { .. } => "loop",
            NodeKind::Control => "control",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalSpec {
    pub branches: Vec<Branch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_branch: Option<Vec<NodeId>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub condition: String,
    pub nodes: Vec<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopType {
    For,
    While,
    ForRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopSpec {
    #[serde(rename = "type")]
    pub loop_type: LoopType,
    /// `for`: reference to the collection, e.g. `@list.outputs.items`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    /// `while`: predicate re-evaluated before every pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// `for_range`: numeric range, end exclusive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<RangeSpec>,
    /// Name the current element is bound to. `index` is always bound too.
    #[serde(default = "default_loop_var")]
    pub var: String,
    pub body: Vec<NodeId>,
    pub max_iterations: u32,
}

fn default_loop_var() -> String {
    "item".into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSpec {
    #[serde(default)]
    pub start: i64,
    pub end: i64,
    #[serde(default = "default_step")]
    pub step: i64,
}

fn default_step() -> i64 {
    1
}

impl RangeSpec {
    pub fn values(&self) -> impl Iterator<Item = i64> + '_ {
        let step = self.step;
        let end = self.end;
        std::iter::successors(Some(self.start), move |v| v.checked_add(step))
            .take_while(move |v| if step > 0 { *v < end } else { *v > end })
    }
}

// ── Error policy ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    #[default]
    FailFast,
    Retry,
    SkipDependents,
    Continue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// Strategy applied once retries are exhausted.
    pub on_exhausted: ErrorStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            on_exhausted: ErrorStrategy::FailFast,
        }
    }
}

impl RetryConfig {
    /// Delay before attempt `attempt + 1`, where `attempt` counts from 1.
    pub fn backoff(&self, attempt: u32) -> std::time::Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let ms = self.backoff_ms as f64 * self.backoff_multiplier.powi(exp);
        std::time::Duration::from_millis(ms.clamp(0.0, u64::MAX as f64) as u64)
    }
}

impl SkillNode {
    /// Attempts allowed for this node (1 unless retrying).
    pub fn max_attempts(&self) -> u32 {
        match self.error_strategy {
            ErrorStrategy::Retry => self.retry().max_retries.saturating_add(1),
            _ => 1,
        }
    }

    pub fn retry(&self) -> RetryConfig {
        self.retry_config.clone().unwrap_or_default()
    }

    /// Strategy that governs a terminal failure of this node.
    pub fn terminal_strategy(&self) -> ErrorStrategy {
        match self.error_strategy {
            ErrorStrategy::Retry => match self.retry().on_exhausted {
                ErrorStrategy::Retry => ErrorStrategy::FailFast,
                other => other,
            },
            other => other,
        }
    }

    /// Nodes executed inside this node (branches or loop body).
    pub fn embedded_lists(&self) -> Vec<&[NodeId]> {
        match &self.kind {
            NodeKind::Conditional { conditional } => {
                let mut lists: Vec<&[NodeId]> =
                    conditional.branches.iter().map(|b| b.nodes.as_slice()).collect();
                if let Some(default) = &conditional.default_branch {
                    lists.push(default.as_slice());
                }
                lists
            }
            NodeKind::Loop { spec } => vec![spec.body.as_slice()],
            _ => vec![],
        }
    }
}

// ── Concurrency ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyMode {
    #[default]
    Sequential,
    Phased,
    FullParallel,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Concurrency {
    #[serde(default)]
    pub mode: ConcurrencyMode,
    /// Ordered phases; only read in `phased` mode.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phases: Vec<Vec<NodeId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<usize>,
}

// ── Definition helpers ─────────────────────────────────────────

impl SkillDefinition {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| FlowError::Validation(format!("invalid skill document: {e}")))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            FlowError::Storage(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    pub fn node(&self, id: &str) -> Option<&SkillNode> {
        self.graph.nodes.iter().find(|n| n.id == id)
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }

    /// Validate run inputs against `inputs_schema`.
    pub fn validate_inputs(&self, inputs: &Value) -> Result<()> {
        validate_against(&self.inputs_schema, inputs, "inputs")
    }

    /// Validate run outputs against `output_schema`.
    pub fn validate_outputs(&self, outputs: &Value) -> Result<()> {
        validate_against(&self.output_schema, outputs, "outputs")
    }

    /// How this skill is advertised to tool-calling clients.
    pub fn tool_descriptor(&self) -> ToolDescriptor {
        let description = if self.description.is_empty() {
            format!("[Skill v{}]", self.version)
        } else {
            format!("{}\n\n[Skill v{}]", self.description, self.version)
        };
        ToolDescriptor::new(skill_tool_name(&self.id), description, self.inputs_schema.clone())
    }

    /// Does this skill match a free-text query and every requested tag?
    pub fn matches(&self, query: Option<&str>, tags: &[String]) -> bool {
        let query_ok = query.is_none_or(|q| {
            let q = q.to_lowercase();
            self.id.to_lowercase().contains(&q)
                || self.name.to_lowercase().contains(&q)
                || self.description.to_lowercase().contains(&q)
        });
        query_ok && tags.iter().all(|t| self.tags.contains(t))
    }
}

fn validate_against(schema: &Value, instance: &Value, what: &str) -> Result<()> {
    let validator = jsonschema::validator_for(schema)
        .map_err(|e| FlowError::Validation(format!("invalid {what} schema: {e}")))?;
    let errors: Vec<String> = validator
        .iter_errors(instance)
        .map(|e| {
            let at = e.instance_path.to_string();
            if at.is_empty() { e.to_string() } else { format!("{at}: {e}") }
        })
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(FlowError::Validation(format!("{what} do not match schema: {}", errors.join("; "))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SkillDefinition {
        SkillDefinition::from_json(
            r#"{
                "id": "fetch_and_sum",
                "version": 3,
                "description": "Fetch then sum",
                "tags": ["web"],
                "inputs_schema": {
                    "type": "object",
                    "properties": { "url": { "type": "string" } },
                    "required": ["url"]
                },
                "graph": {
                    "nodes": [
                        { "id": "fetch", "kind": "tool_call", "server": "web", "tool": "fetch",
                          "args_template": { "url": "$inputs.url" },
                          "error_strategy": "retry",
                          "retry_config": { "max_retries": 2, "backoff_ms": 10 } },
                        { "id": "pick", "kind": "conditional", "depends_on": ["fetch"],
                          "conditional": {
                            "branches": [ { "condition": "@fetch.outputs.ok", "nodes": ["sum"] } ]
                          } },
                        { "id": "sum", "kind": "tool_call", "server": "calc", "tool": "sum" },
                        { "id": "poll", "kind": "loop",
                          "loop": { "type": "while", "condition": "true", "body": [], "max_iterations": 3 } },
                        { "id": "join", "kind": "control", "depends_on": ["pick", "poll"] }
                    ],
                    "concurrency": { "mode": "full_parallel", "max_parallel": 2 }
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn parses_tagged_node_kinds() {
        let def = sample();
        assert_eq!(def.graph.nodes.len(), 5);
        assert!(matches!(
            &def.node("fetch").unwrap().kind,
            NodeKind::ToolCall { server, tool } if server == "web" && tool == "fetch"
        ));
        assert_eq!(def.node("pick").unwrap().kind.name(), "conditional");
        let NodeKind::Loop { spec } = &def.node("poll").unwrap().kind else {
            panic!("expected loop");
        };
        assert_eq!(spec.loop_type, LoopType::While);
        assert_eq!(spec.var, "item");
        assert_eq!(def.node("join").unwrap().kind, NodeKind::Control);
        assert_eq!(def.graph.concurrency.mode, ConcurrencyMode::FullParallel);
    }

    #[test]
    fn retry_defaults_and_attempts() {
        let def = sample();
        let fetch = def.node("fetch").unwrap();
        assert_eq!(fetch.max_attempts(), 3);
        assert_eq!(fetch.retry().backoff_multiplier, 2.0);
        assert_eq!(fetch.terminal_strategy(), ErrorStrategy::FailFast);
        assert_eq!(def.node("sum").unwrap().max_attempts(), 1);
    }

    #[test]
    fn backoff_grows_geometrically() {
        let cfg = RetryConfig {
            backoff_ms: 100,
            backoff_multiplier: 2.0,
            ..Default::default()
        };
        assert_eq!(cfg.backoff(1).as_millis(), 100);
        assert_eq!(cfg.backoff(2).as_millis(), 200);
        assert_eq!(cfg.backoff(3).as_millis(), 400);
    }

    #[test]
    fn missing_max_iterations_is_rejected() {
        let raw = r#"{ "id": "x", "graph": { "nodes": [
            { "id": "l", "kind": "loop", "loop": { "type": "while", "condition": "true", "body": [] } }
        ] } }"#;
        assert!(SkillDefinition::from_json(raw).is_err());
    }

    #[test]
    fn range_values() {
        let r = RangeSpec { start: 0, end: 5, step: 2 };
        assert_eq!(r.values().collect::<Vec<_>>(), vec![0, 2, 4]);
        let down = RangeSpec { start: 3, end: 0, step: -1 };
        assert_eq!(down.values().collect::<Vec<_>>(), vec![3, 2, 1]);
    }

    #[test]
    fn input_schema_validation() {
        let def = sample();
        assert!(def.validate_inputs(&json!({"url": "http://x"})).is_ok());
        let err = def.validate_inputs(&json!({"url": 5})).unwrap_err();
        assert!(matches!(err, FlowError::Validation(_)));
        assert!(def.validate_inputs(&json!({})).is_err());
    }

    #[test]
    fn exported_tool_descriptor() {
        let tool = sample().tool_descriptor();
        assert_eq!(tool.name, "skill__fetch_and_sum");
        assert!(tool.description.ends_with("[Skill v3]"));
        assert_eq!(tool.input_schema["required"][0], "url");
    }

    #[test]
    fn query_and_tag_matching() {
        let def = sample();
        assert!(def.matches(Some("SUM"), &[]));
        assert!(def.matches(None, &["web".into()]));
        assert!(!def.matches(None, &["db".into()]));
        assert!(!def.matches(Some("nothing"), &[]));
    }

    #[test]
    fn serializes_back_with_kind_tag() {
        let def = sample();
        let v = serde_json::to_value(&def).unwrap();
        assert_eq!(v["graph"]["nodes"][0]["kind"], "tool_call");
        assert_eq!(v["graph"]["nodes"][3]["loop"]["type"], "while");
        let again: SkillDefinition = serde_json::from_value(v).unwrap();
        assert_eq!(again.graph.nodes.len(), 5);
    }
}
