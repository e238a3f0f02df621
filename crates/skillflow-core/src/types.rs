use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a skill run.
pub type RunId = Uuid;

/// Identifier of a node, unique within one skill graph.
pub type NodeId = String;

/// Identifier of a skill (stable across versions).
pub type SkillId = String;

/// Identifier of a configured upstream endpoint.
pub type ServerId = String;

/// Which version of a skill to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionSpec {
    #[default]
    Latest,
    Exact(u32),
}

impl From<Option<u32>> for VersionSpec {
    fn from(v: Option<u32>) -> Self {
        match v {
            Some(n) => VersionSpec::Exact(n),
            None => VersionSpec::Latest,
        }
    }
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionSpec::Latest => write!(f, "latest"),
            VersionSpec::Exact(n) => write!(f, "v{n}"),
        }
    }
}

/// Prefix used when skills are exposed as callable tools.
pub const SKILL_TOOL_PREFIX: &str = "skill__";

/// Build the externally visible tool name of a skill.
pub fn skill_tool_name(skill_id: &str) -> String {
    format!("{SKILL_TOOL_PREFIX}{skill_id}")
}

/// Inverse of [`skill_tool_name`].
pub fn skill_id_from_tool_name(tool_name: &str) -> Option<&str> {
    tool_name
        .strip_prefix(SKILL_TOOL_PREFIX)
        .filter(|id| !id.is_empty())
}

/// Lifecycle state of one node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    Cancelled,
}

impl NodeStatus {
    /// Terminal states never change again within a run.
    pub fn is_terminal(self) -> bool {
        !matches!(self, NodeStatus::Pending | NodeStatus::Running)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Success => "success",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
            NodeStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    PartialFailure,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_finished(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::PartialFailure => "partial_failure",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}
