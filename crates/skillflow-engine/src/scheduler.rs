//! Top-level scheduling: phases, readiness and the concurrency cap.
//!
//! ```text
//!  phase 0 ──barrier──▶ phase 1 ──barrier──▶ …
//!    │
//!    ├─ waiting: not started, dependencies unresolved
//!    ├─ ready:   every dependency succeeded (or failed under `continue`)
//!    └─ running: holds one permit of the run's semaphore
//! ```
//!
//! Sequential plans are phased plans with one node per phase and a single
//! permit. Full-parallel plans have one phase and prefer the ready node that
//! blocks the most others.

use std::cmp::Reverse;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use skillflow_core::{NodeId, NodeStatus};
use skillflow_skills::{ConcurrencyMode, ErrorStrategy};

use crate::context::ExecutionContext;
use crate::node::{self, NodeOutcome};
use crate::run::RunState;

pub(crate) async fn run_top_level(run: &Arc<RunState>, ctx: &ExecutionContext) {
    let limit = match run.plan.mode {
        ConcurrencyMode::Sequential => 1,
        _ => run
            .plan
            .max_parallel
            .unwrap_or(run.engine.settings().max_parallel)
            .max(1),
    };
    let slots = Arc::new(Semaphore::new(limit));

    for (index, phase) in run.plan.phases.iter().enumerate() {
        if run.stopped() {
            break;
        }
        debug!(run_id = %run.run_id, phase = index, nodes = phase.len(), limit, "phase started");
        run_phase(run, ctx, phase, &slots).await;
    }
}

async fn run_phase(run: &Arc<RunState>, ctx: &ExecutionContext, phase: &[NodeId], slots: &Arc<Semaphore>) {
    let mut waiting: Vec<NodeId> = phase.to_vec();
    let mut in_flight: JoinSet<(NodeId, NodeOutcome)> = JoinSet::new();

    loop {
        if !run.stopped() {
            skip_unsatisfiable(run, &mut waiting).await;

            let mut ready: Vec<NodeId> =
                waiting.iter().filter(|id| dependencies_resolved(run, id)).cloned().collect();
            order_ready(run, &mut ready);

            for id in ready {
                let Ok(permit) = Arc::clone(slots).try_acquire_owned() else {
                    break;
                };
                waiting.retain(|w| *w != id);
                run.set_status(&id, NodeStatus::Running);

                let run = Arc::clone(run);
                let ctx = ctx.clone();
                in_flight.spawn(async move {
                    let _permit = permit;
                    let outcome = node::execute(&run, &id, &ctx, None).await;
                    (id, outcome)
                });
            }
        }

        let Some(joined) = in_flight.join_next().await else {
            break;
        };
        match joined {
            Ok((id, outcome)) => apply_outcome(run, &id, outcome, &mut waiting).await,
            Err(e) => {
                error!(run_id = %run.run_id, error = %e, "node task aborted");
                run.halt(format!("node task aborted: {e}"));
            }
        }
    }

    let (status, reason) = if run.cancel.is_cancelled() {
        (NodeStatus::Cancelled, "run cancelled")
    } else {
        (NodeStatus::Skipped, "run stopped before the node started")
    };
    for id in waiting {
        run.mark_unrun(&id, status, reason, None).await;
    }
}

/// A dependency is resolved once it succeeded, or failed under `continue`.
fn dependencies_resolved(run: &RunState, id: &str) -> bool {
    let Some(node) = run.def.node(id) else {
        return false;
    };
    node.depends_on.iter().all(|dep| match run.status(dep) {
        NodeStatus::Success => true,
        NodeStatus::Failed => continues_on_failure(run, dep),
        _ => false,
    })
}

fn continues_on_failure(run: &RunState, id: &str) -> bool {
    run.def
        .node(id)
        .is_some_and(|n| n.terminal_strategy() == ErrorStrategy::Continue)
}

/// Skip waiting nodes with a dependency that ended without a usable output.
async fn skip_unsatisfiable(run: &RunState, waiting: &mut Vec<NodeId>) {
    loop {
        let blocked = waiting.iter().find_map(|id| {
            let node = run.def.node(id)?;
            node.depends_on
                .iter()
                .find(|dep| match run.status(dep) {
                    NodeStatus::Skipped | NodeStatus::Cancelled => true,
                    NodeStatus::Failed => !continues_on_failure(run, dep),
                    _ => false,
                })
                .map(|dep| (id.clone(), dep.clone()))
        });
        let Some((id, dep)) = blocked else {
            break;
        };
        waiting.retain(|w| *w != id);
        let status = run.status(&dep);
        run.mark_unrun(&id, NodeStatus::Skipped, format!("dependency '{dep}' {status}"), None)
            .await;
    }
}

fn order_ready(run: &RunState, ready: &mut [NodeId]) {
    match run.plan.mode {
        ConcurrencyMode::FullParallel => {
            ready.sort_by_key(|id| (Reverse(run.plan.blocking_weight(id)), run.plan.topo_index(id)))
        }
        _ => ready.sort_by_key(|id| run.plan.topo_index(id)),
    }
}

async fn apply_outcome(run: &Arc<RunState>, id: &str, outcome: NodeOutcome, waiting: &mut Vec<NodeId>) {
    if outcome.status != NodeStatus::Failed {
        return;
    }
    let Some(node) = run.def.node(id) else {
        return;
    };
    let reason = outcome
        .error
        .as_ref()
        .map(|e| e.to_string())
        .unwrap_or_else(|| "failed".into());

    match node.terminal_strategy() {
        ErrorStrategy::Continue => {
            debug!(run_id = %run.run_id, node = %id, "failure contained, dependents continue");
        }
        ErrorStrategy::SkipDependents => {
            let skipped = run.plan.transitive_dependents(id);
            warn!(run_id = %run.run_id, node = %id, dependents = ?skipped, "skipping dependents of failed node");
            for dep in &skipped {
                run.mark_unrun(dep, NodeStatus::Skipped, format!("dependency '{id}' failed"), None)
                    .await;
            }
            waiting.retain(|w| !skipped.contains(w));
        }
        ErrorStrategy::FailFast | ErrorStrategy::Retry => {
            warn!(run_id = %run.run_id, node = %id, error = %reason, "node failed, stopping run");
            run.halt(format!("node '{id}' failed: {reason}"));
            run.skip_pending_top_level(&format!("run stopped after '{id}' failed")).await;
            waiting.clear();
        }
    }
}
