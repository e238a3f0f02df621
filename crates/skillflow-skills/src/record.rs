//! Persistent shapes of a run: per-node execution records and the run summary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use skillflow_core::{NodeId, NodeStatus, RunId, RunStatus, SkillId};

/// Outcome of one node attempt sequence (or one loop iteration of a body node).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionRecord {
    pub run_id: RunId,
    pub skill_id: SkillId,
    pub version: u32,
    pub node_id: NodeId,
    pub status: NodeStatus,
    /// Attempts made, starting at 1. Zero for nodes that never started.
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args_resolved: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Conditional or loop node this record was produced under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_node: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
}

impl NodeExecutionRecord {
    /// A record for a node that never ran.
    pub fn skipped(
        run_id: RunId,
        skill_id: &str,
        version: u32,
        node_id: &str,
        status: NodeStatus,
        reason: Option<String>,
    ) -> Self {
        Self {
            run_id,
            skill_id: skill_id.to_string(),
            version,
            node_id: node_id.to_string(),
            status,
            attempt: 0,
            args_resolved: None,
            result: None,
            error: reason,
            error_kind: None,
            started_at: None,
            completed_at: Some(Utc::now()),
            parent_node: None,
            iteration: None,
        }
    }

    pub fn duration_ms(&self) -> Option<u64> {
        let (start, end) = (self.started_at?, self.completed_at?);
        Some((end - start).num_milliseconds().max(0) as u64)
    }
}

/// Node status tallies for a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    pub fn tally<'a>(statuses: impl IntoIterator<Item = &'a NodeStatus>) -> Self {
        let mut c = Self::default();
        for s in statuses {
            match s {
                NodeStatus::Success => c.success += 1,
                NodeStatus::Failed => c.failed += 1,
                NodeStatus::Skipped => c.skipped += 1,
                NodeStatus::Cancelled => c.cancelled += 1,
                NodeStatus::Pending | NodeStatus::Running => {}
            }
        }
        c
    }
}

/// Final description of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub skill_id: SkillId,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<RunId>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub outputs: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub counts: StatusCounts,
    /// Final status of every node, top-level and embedded.
    #[serde(default)]
    pub node_statuses: BTreeMap<NodeId, NodeStatus>,
    /// Output schema violations. They are reported, not fatal.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub schema_errors: Vec<String>,
}

impl RunSummary {
    pub fn duration_ms(&self) -> u64 {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }
}

/// Everything a finished run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub summary: RunSummary,
    pub records: Vec<NodeExecutionRecord>,
}

impl RunResult {
    /// Records of one node, in the order they were produced.
    pub fn records_for<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a NodeExecutionRecord> + 'a {
        self.records.iter().filter(move |r| r.node_id == node)
    }

    pub fn status_of(&self, node: &str) -> Option<NodeStatus> {
        self.summary.node_statuses.get(node).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn tally_ignores_non_terminal() {
        let statuses = [
            NodeStatus::Success,
            NodeStatus::Success,
            NodeStatus::Failed,
            NodeStatus::Skipped,
            NodeStatus::Pending,
        ];
        let c = StatusCounts::tally(statuses.iter());
        assert_eq!(c, StatusCounts { success: 2, failed: 1, skipped: 1, cancelled: 0 });
    }

    #[test]
    fn skipped_record_has_no_attempts() {
        let r = NodeExecutionRecord::skipped(
            Uuid::new_v4(),
            "s",
            1,
            "n",
            NodeStatus::Skipped,
            Some("dependency 'a' failed".into()),
        );
        assert_eq!(r.attempt, 0);
        assert!(r.duration_ms().is_none());
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["status"], "skipped");
        assert!(json.get("result").is_none());
    }
}
