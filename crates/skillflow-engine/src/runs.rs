//! Background runs: start a skill, poll its per-node status, cancel it or
//! wait for its result.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use skillflow_core::{FlowError, NodeId, NodeStatus, Result, RunId, RunStatus, SkillId};
use skillflow_skills::{RunResult, SkillDefinition, StatusCounts};

use crate::engine::{self, RunOptions, SkillEngine};
use crate::run::StatusMap;

pub(crate) struct TrackedRun {
    skill_id: SkillId,
    version: u32,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    statuses: StatusMap,
    done: watch::Sender<Option<Arc<RunResult>>>,
}

/// Point-in-time view of a background run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub skill_id: SkillId,
    pub version: u32,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub node_statuses: BTreeMap<NodeId, NodeStatus>,
    pub counts: StatusCounts,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub outputs: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SkillEngine {
    /// Start `def` in the background and return its run id.
    ///
    /// Validation happens before this returns; a graph or input error is
    /// returned here and no run is registered.
    pub fn start(&self, def: Arc<SkillDefinition>, inputs: Value) -> Result<RunId> {
        let cancel = CancellationToken::new();
        let (state, ctx) = self.prepare(
            def,
            inputs,
            None,
            RunOptions {
                run_id: None,
                cancel: Some(cancel.clone()),
            },
        )?;
        let run_id = state.run_id;
        let (done, _) = watch::channel(None);
        self.inner().runs.insert(
            run_id,
            TrackedRun {
                skill_id: state.def.id.clone(),
                version: state.def.version,
                started_at: state.started_at,
                cancel,
                statuses: state.statuses(),
                done,
            },
        );

        let engine = self.clone();
        tokio::spawn(async move {
            let result = Arc::new(engine::execute(state, ctx).await);
            if let Some(tracked) = engine.inner().runs.get(&run_id) {
                tracked.done.send_replace(Some(result));
            }
            engine.evict_finished();
        });
        Ok(run_id)
    }

    /// Current state of a run started with [`SkillEngine::start`].
    pub fn status(&self, run_id: RunId) -> Option<RunSnapshot> {
        let tracked = self.inner().runs.get(&run_id)?;
        let finished = tracked.done.borrow().clone();
        let snapshot = match finished {
            Some(result) => {
                let s = &result.summary;
                RunSnapshot {
                    run_id,
                    skill_id: s.skill_id.clone(),
                    version: s.version,
                    status: s.status,
                    started_at: s.started_at,
                    completed_at: s.completed_at,
                    node_statuses: s.node_statuses.clone(),
                    counts: s.counts,
                    outputs: s.outputs.clone(),
                    error: s.error.clone(),
                }
            }
            None => {
                let node_statuses = tracked.statuses.read().clone();
                RunSnapshot {
                    run_id,
                    skill_id: tracked.skill_id.clone(),
                    version: tracked.version,
                    status: RunStatus::Running,
                    started_at: tracked.started_at,
                    completed_at: None,
                    counts: StatusCounts::tally(node_statuses.values()),
                    node_statuses,
                    outputs: Value::Null,
                    error: None,
                }
            }
        };
        Some(snapshot)
    }

    /// Request cancellation. Returns false for unknown or finished runs.
    pub fn cancel(&self, run_id: RunId) -> bool {
        let Some(tracked) = self.inner().runs.get(&run_id) else {
            return false;
        };
        if tracked.done.borrow().is_some() {
            return false;
        }
        info!(run_id = %run_id, skill = %tracked.skill_id, "run cancellation requested");
        tracked.cancel.cancel();
        true
    }

    /// Wait for a background run to finish.
    pub async fn wait(&self, run_id: RunId) -> Result<Arc<RunResult>> {
        let mut rx = match self.inner().runs.get(&run_id) {
            Some(tracked) => tracked.done.subscribe(),
            None => return Err(FlowError::Validation(format!("unknown run '{run_id}'"))),
        };
        let finished = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| FlowError::Cancelled(format!("run '{run_id}' was dropped")))?;
        finished
            .clone()
            .ok_or_else(|| FlowError::Cancelled(format!("run '{run_id}' was dropped")))
    }

    /// Drop the oldest finished runs beyond `retained_runs`. Running runs
    /// are never evicted.
    fn evict_finished(&self) {
        let keep = self.settings().retained_runs;
        let mut finished: Vec<(DateTime<Utc>, RunId)> = self
            .inner()
            .runs
            .iter()
            .filter_map(|entry| {
                let done = entry.done.borrow();
                let s = &done.as_ref()?.summary;
                Some((s.completed_at.unwrap_or(s.started_at), *entry.key()))
            })
            .collect();
        if finished.len() <= keep {
            return;
        }
        finished.sort();
        let excess = finished.len() - keep;
        for (_, run_id) in finished.into_iter().take(excess) {
            self.inner().runs.remove(&run_id);
        }
        debug!(evicted = excess, retained = keep, "evicted finished runs");
    }

    /// Background runs, newest first.
    pub fn list_runs(&self) -> Vec<RunSnapshot> {
        let ids: Vec<RunId> = self.inner().runs.iter().map(|e| *e.key()).collect();
        let mut runs: Vec<RunSnapshot> = ids.into_iter().filter_map(|id| self.status(id)).collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs
    }
}
