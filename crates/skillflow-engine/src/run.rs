//! Bookkeeping of one in-flight run: node statuses, the append-only record
//! log and the final summary.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use skillflow_core::{FlowError, NodeId, NodeStatus, RunEvent, RunId, RunStatus};
use skillflow_skills::path::{lookup_or_null, parse_path};
use skillflow_skills::{
    ExecutionPlan, NodeExecutionRecord, RunResult, RunSummary, SkillDefinition, StatusCounts,
    jsonpath,
};

use crate::context::ExecutionContext;
use crate::engine::SkillEngine;

pub(crate) type StatusMap = Arc<RwLock<BTreeMap<NodeId, NodeStatus>>>;

/// Where an embedded node runs: its owning conditional/loop and, inside a
/// loop, the iteration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Embedded<'a> {
    pub owner: &'a str,
    pub iteration: Option<u32>,
}

pub(crate) struct RunState {
    pub engine: SkillEngine,
    pub run_id: RunId,
    pub parent_run_id: Option<RunId>,
    pub def: Arc<SkillDefinition>,
    pub plan: Arc<ExecutionPlan>,
    pub cancel: CancellationToken,
    pub started_at: DateTime<Utc>,
    statuses: StatusMap,
    records: Mutex<Vec<NodeExecutionRecord>>,
    halted: AtomicBool,
    failure: Mutex<Option<String>>,
}

impl RunState {
    pub fn new(
        engine: SkillEngine,
        run_id: RunId,
        parent_run_id: Option<RunId>,
        def: Arc<SkillDefinition>,
        plan: Arc<ExecutionPlan>,
        cancel: CancellationToken,
    ) -> Self {
        let statuses = def
            .graph
            .nodes
            .iter()
            .map(|n| (n.id.clone(), NodeStatus::Pending))
            .collect();
        Self {
            engine,
            run_id,
            parent_run_id,
            def,
            plan,
            cancel,
            started_at: Utc::now(),
            statuses: Arc::new(RwLock::new(statuses)),
            records: Mutex::new(Vec::new()),
            halted: AtomicBool::new(false),
            failure: Mutex::new(None),
        }
    }

    pub fn statuses(&self) -> StatusMap {
        Arc::clone(&self.statuses)
    }

    pub fn status(&self, node: &str) -> NodeStatus {
        self.statuses.read().get(node).copied().unwrap_or(NodeStatus::Pending)
    }

    pub fn set_status(&self, node: &str, status: NodeStatus) {
        self.statuses.write().insert(node.to_string(), status);
    }

    pub fn publish(&self, event: RunEvent) {
        self.engine.events().publish(event);
    }

    /// No new top-level nodes may start.
    pub fn stopped(&self) -> bool {
        self.halted.load(Ordering::SeqCst) || self.cancel.is_cancelled()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Escalate a node failure to the whole run.
    pub fn halt(&self, reason: String) {
        self.halted.store(true, Ordering::SeqCst);
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(reason);
        }
    }

    /// Append a terminal record, update the node's status and forward the
    /// record to the run log.
    pub async fn record(&self, record: NodeExecutionRecord) {
        self.set_status(&record.node_id, record.status);
        self.publish(RunEvent::NodeFinished {
            run_id: self.run_id,
            node_id: record.node_id.clone(),
            status: record.status,
            duration_ms: record.duration_ms().unwrap_or(0),
            error: record.error.clone(),
        });
        if let Err(e) = self.engine.run_log().append(&record).await {
            warn!(run_id = %self.run_id, node = %record.node_id, error = %e, "failed to append run record");
        }
        self.records.lock().push(record);
    }

    /// Record that a node will never run. Nodes that already have a terminal
    /// status are left alone.
    pub async fn mark_unrun(
        &self,
        node: &str,
        status: NodeStatus,
        reason: impl Into<String>,
        embedded: Option<Embedded<'_>>,
    ) {
        let current = self.status(node);
        if current.is_terminal() && embedded.is_none() {
            return;
        }
        let mut record = NodeExecutionRecord::skipped(
            self.run_id,
            &self.def.id,
            self.def.version,
            node,
            status,
            Some(reason.into()),
        );
        if let Some(e) = embedded {
            record.parent_node = Some(e.owner.to_string());
            record.iteration = e.iteration;
        }
        self.record(record).await;
    }

    /// Skip every top-level node that has not started yet.
    pub async fn skip_pending_top_level(&self, reason: &str) {
        let pending: Vec<NodeId> = self
            .plan
            .top_level
            .iter()
            .filter(|id| self.status(id) == NodeStatus::Pending)
            .cloned()
            .collect();
        for id in pending {
            self.mark_unrun(&id, NodeStatus::Skipped, reason, None).await;
        }
    }

    /// Close the run: settle unreached nodes, derive the overall status and
    /// outputs, and write the summary.
    pub async fn finish(&self, ctx: &ExecutionContext) -> RunResult {
        let cancelled = self.cancel.is_cancelled();
        let leftover: Vec<NodeId> = self
            .statuses
            .read()
            .iter()
            .filter(|(_, s)| !s.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for id in leftover {
            let (status, reason) = if cancelled {
                (NodeStatus::Cancelled, "run cancelled")
            } else {
                (NodeStatus::Skipped, "not reached")
            };
            self.mark_unrun(&id, status, reason, None).await;
        }

        let node_statuses = self.statuses.read().clone();
        let counts = StatusCounts::tally(node_statuses.values());
        let status = if cancelled {
            RunStatus::Cancelled
        } else if self.is_halted() {
            RunStatus::Failed
        } else if counts.failed > 0 {
            if counts.success > 0 {
                RunStatus::PartialFailure
            } else {
                RunStatus::Failed
            }
        } else {
            RunStatus::Success
        };

        let error = match status {
            RunStatus::Cancelled => Some("run cancelled".to_string()),
            RunStatus::Success => None,
            _ => self.failure.lock().clone().or_else(|| {
                let failed: Vec<&str> = node_statuses
                    .iter()
                    .filter(|(_, s)| **s == NodeStatus::Failed)
                    .map(|(id, _)| id.as_str())
                    .collect();
                Some(format!("{} node(s) failed: {}", failed.len(), failed.join(", ")))
            }),
        };

        let outputs = self.collect_outputs(ctx, &node_statuses);
        let mut schema_errors = Vec::new();
        if status == RunStatus::Success {
            if let Err(e) = self.def.validate_outputs(&outputs) {
                warn!(run_id = %self.run_id, skill = %self.def.id, error = %e, "run outputs do not match output_schema");
                schema_errors.push(e.to_string());
            }
        }

        let summary = RunSummary {
            run_id: self.run_id,
            skill_id: self.def.id.clone(),
            version: self.def.version,
            parent_run_id: self.parent_run_id,
            status,
            started_at: self.started_at,
            completed_at: Some(Utc::now()),
            outputs,
            error,
            counts,
            node_statuses,
            schema_errors,
        };

        if let Err(e) = self.engine.run_log().finish(&summary).await {
            warn!(run_id = %self.run_id, error = %e, "failed to write run summary");
        }
        self.publish(RunEvent::RunFinished {
            run_id: self.run_id,
            status,
            duration_ms: summary.duration_ms(),
            at: Utc::now(),
        });
        info!(
            run_id = %self.run_id,
            skill = %self.def.id,
            version = self.def.version,
            status = %status,
            succeeded = counts.success,
            failed = counts.failed,
            skipped = counts.skipped,
            duration_ms = summary.duration_ms(),
            "run finished"
        );

        RunResult {
            summary,
            records: self.records.lock().clone(),
        }
    }

    /// Named exports of successful nodes; without any exports, the outputs
    /// of successful top-level leaves keyed by node id.
    fn collect_outputs(&self, ctx: &ExecutionContext, statuses: &BTreeMap<NodeId, NodeStatus>) -> Value {
        let succeeded = |id: &str| statuses.get(id) == Some(&NodeStatus::Success);
        let mut out = Map::new();

        let exporting: Vec<_> = self
            .def
            .graph
            .nodes
            .iter()
            .filter(|n| !n.export_outputs.is_empty())
            .collect();
        if !exporting.is_empty() {
            for node in exporting {
                if !succeeded(&node.id) {
                    continue;
                }
                let Some(result) = ctx.output(&node.id) else {
                    continue;
                };
                for (name, path) in &node.export_outputs {
                    match extract(&result, path) {
                        Ok(v) => {
                            out.insert(name.clone(), v);
                        }
                        Err(e) => {
                            warn!(run_id = %self.run_id, node = %node.id, output = %name, error = %e, "export path failed");
                        }
                    }
                }
            }
            return Value::Object(out);
        }

        for id in &self.plan.top_level {
            let is_leaf = self
                .plan
                .dependents(id)
                .iter()
                .all(|d| self.plan.owner_of(d).is_some());
            if is_leaf && succeeded(id) {
                if let Some(v) = ctx.output(id) {
                    out.insert(id.clone(), (*v).clone());
                }
            }
        }
        Value::Object(out)
    }
}

/// `$`-prefixed paths are path queries; anything else is a dotted path.
fn extract(result: &Value, path: &str) -> Result<Value, FlowError> {
    if path.starts_with('$') {
        jsonpath::extract(result, path)
    } else {
        Ok(lookup_or_null(result, &parse_path(path)?))
    }
}
