//! Execution of a single node: attempts and retries, kind dispatch, and the
//! embedded sub-runs of conditional and loop nodes.

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{Map, Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use skillflow_core::{FlowError, NodeId, NodeStatus, Result, RunEvent, RunStatus, VersionSpec};
use skillflow_skills::{
    ConditionalSpec, ErrorStrategy, ExecutionPlan, LoopSpec, LoopType, NodeExecutionRecord, NodeKind,
    Predicate, Reference, ResolveContext, SkillNode, resolve, resolve_reference,
};

use crate::context::ExecutionContext;
use crate::run::{Embedded, RunState};

/// Terminal status of a node plus the error that caused a failure.
pub(crate) struct NodeOutcome {
    pub status: NodeStatus,
    pub error: Option<FlowError>,
}

impl NodeOutcome {
    fn into_error(self, node: &str) -> FlowError {
        match self.error {
            Some(e) => e,
            None => FlowError::Cancelled(format!("node '{node}' did not finish")),
        }
    }
}

/// Run `node_id` with retries and record its terminal state.
///
/// Boxed because conditional and loop nodes re-enter it for their members.
pub(crate) fn execute<'a>(
    run: &'a Arc<RunState>,
    node_id: &'a str,
    ctx: &'a ExecutionContext,
    embedded: Option<Embedded<'a>>,
) -> BoxFuture<'a, NodeOutcome> {
    Box::pin(async move {
        let Some(node) = run.def.node(node_id) else {
            return NodeOutcome {
                status: NodeStatus::Failed,
                error: Some(FlowError::Graph(format!("unknown node '{node_id}'"))),
            };
        };

        run.set_status(node_id, NodeStatus::Running);
        let started_at = Utc::now();
        let max_attempts = node.max_attempts();
        let retry = node.retry();
        let mut args_resolved = None;
        let mut attempt = 0;

        let result = loop {
            attempt += 1;
            if run.cancel.is_cancelled() {
                break Err(FlowError::Cancelled(format!("node '{node_id}'")));
            }
            run.publish(RunEvent::NodeStarted {
                run_id: run.run_id,
                node_id: node_id.to_string(),
                attempt,
            });
            debug!(run_id = %run.run_id, node = %node_id, kind = node.kind.name(), attempt, "node started");

            match attempt_once(run, node, ctx, embedded, &mut args_resolved).await {
                Ok(output) => break Ok(output),
                Err(e @ FlowError::Cancelled(_)) => break Err(e),
                Err(e) if attempt < max_attempts => {
                    let delay = retry.backoff(attempt);
                    warn!(
                        run_id = %run.run_id,
                        node = %node_id,
                        attempt,
                        max_attempts,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "attempt failed, retrying"
                    );
                    run.publish(RunEvent::NodeRetrying {
                        run_id: run.run_id,
                        node_id: node_id.to_string(),
                        attempt,
                        backoff_ms: delay.as_millis() as u64,
                        error: e.to_string(),
                    });
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = run.cancel.cancelled() => {
                            break Err(FlowError::Cancelled(format!("node '{node_id}' while backing off")));
                        }
                    }
                }
                Err(e) => break Err(e),
            }
        };

        let mut record = NodeExecutionRecord {
            run_id: run.run_id,
            skill_id: run.def.id.clone(),
            version: run.def.version,
            node_id: node_id.to_string(),
            status: NodeStatus::Success,
            attempt,
            args_resolved,
            result: None,
            error: None,
            error_kind: None,
            started_at: Some(started_at),
            completed_at: None,
            parent_node: embedded.map(|e| e.owner.to_string()),
            iteration: embedded.and_then(|e| e.iteration),
        };

        let outcome = match result {
            Ok(output) => {
                ctx.set_output(node_id, output.clone());
                record.result = Some(output);
                NodeOutcome {
                    status: NodeStatus::Success,
                    error: None,
                }
            }
            Err(e) => {
                let status = match e {
                    FlowError::Cancelled(_) => NodeStatus::Cancelled,
                    _ => NodeStatus::Failed,
                };
                if status == NodeStatus::Failed {
                    warn!(run_id = %run.run_id, node = %node_id, attempts = attempt, kind = e.kind(), error = %e, "node failed");
                    if node.terminal_strategy() == ErrorStrategy::Continue {
                        ctx.set_output(node_id, Value::Null);
                    }
                }
                record.status = status;
                record.error = Some(e.to_string());
                record.error_kind = Some(e.kind().to_string());
                NodeOutcome {
                    status,
                    error: Some(e),
                }
            }
        };

        record.completed_at = Some(Utc::now());
        run.record(record).await;
        outcome
    })
}

async fn attempt_once(
    run: &Arc<RunState>,
    node: &SkillNode,
    ctx: &ExecutionContext,
    embedded: Option<Embedded<'_>>,
    args_resolved: &mut Option<Value>,
) -> Result<Value> {
    let work = dispatch(run, node, ctx, embedded, args_resolved);
    let Some(ms) = node.timeout_ms else {
        return work.await;
    };
    match tokio::time::timeout(Duration::from_millis(ms), work).await {
        Ok(result) => result,
        Err(_) => {
            let (server, method) = match &node.kind {
                NodeKind::ToolCall { server, tool } => (server.clone(), tool.clone()),
                NodeKind::SkillCall { skill, .. } => (skill.clone(), "skill_call".to_string()),
                other => (node.id.clone(), other.name().to_string()),
            };
            Err(FlowError::CallTimeout {
                server,
                method,
                timeout_ms: ms,
            })
        }
    }
}

async fn dispatch(
    run: &Arc<RunState>,
    node: &SkillNode,
    ctx: &ExecutionContext,
    embedded: Option<Embedded<'_>>,
    args_resolved: &mut Option<Value>,
) -> Result<Value> {
    match &node.kind {
        NodeKind::ToolCall { server, tool } => {
            let args = prepare_args(node, ctx, args_resolved)?;
            call_tool(run, server, tool, args).await
        }
        NodeKind::SkillCall { skill, version } => {
            let args = prepare_args(node, ctx, args_resolved)?;
            call_skill(run, skill, *version, args, ctx).await
        }
        NodeKind::Conditional { conditional } => run_conditional(run, node, conditional, ctx, embedded).await,
        NodeKind::Loop { spec } => run_loop(run, node, spec, ctx).await,
        NodeKind::Control => prepare_args(node, ctx, args_resolved),
    }
}

/// Resolve the template, remember the resolved value, then apply the
/// node's transform.
fn prepare_args(node: &SkillNode, ctx: &ExecutionContext, args_resolved: &mut Option<Value>) -> Result<Value> {
    let resolved = resolve(&node.args_template, ctx)?;
    *args_resolved = Some(resolved.clone());
    match &node.parameter_transform {
        Some(transform) => transform.apply(resolved, &ctx.transform_scope()),
        None => Ok(resolved),
    }
}

// ── Tool and skill calls ───────────────────────────────────────

/// Invoke a tool. Once the run is cancelled the call gets `cancel_grace`
/// to finish before its own token fires.
async fn call_tool(run: &Arc<RunState>, server: &str, tool: &str, args: Value) -> Result<Value> {
    let call_token = CancellationToken::new();
    let call = run.engine.invoker().invoke(server, tool, args, call_token.clone());
    tokio::pin!(call);

    tokio::select! {
        result = &mut call => result,
        _ = run.cancel.cancelled() => {
            let grace = run.engine.settings().cancel_grace;
            match tokio::time::timeout(grace, &mut call).await {
                Ok(result) => result,
                Err(_) => {
                    debug!(run_id = %run.run_id, server, tool, "cancelling in-flight call");
                    call_token.cancel();
                    let _ = call.await;
                    Err(FlowError::Cancelled(format!("{tool} on {server}")))
                }
            }
        }
    }
}

async fn call_skill(
    run: &Arc<RunState>,
    skill: &str,
    version: Option<u32>,
    inputs: Value,
    ctx: &ExecutionContext,
) -> Result<Value> {
    let max = run.engine.settings().max_skill_depth;
    let depth = ctx.depth() + 1;
    if depth > max {
        return Err(FlowError::DepthExceeded { depth, max });
    }

    let def = run.engine.loader().load(skill, VersionSpec::from(version)).await?;
    info!(run_id = %run.run_id, skill, version = def.version, depth, "starting nested skill");
    let result = run
        .engine
        .run_nested(def, inputs, ctx, run.cancel.child_token())
        .await?;

    match result.summary.status {
        RunStatus::Success => Ok(result.summary.outputs),
        RunStatus::Cancelled => Err(FlowError::Cancelled(format!("nested skill '{skill}'"))),
        status => Err(FlowError::SkillFailed {
            skill: skill.to_string(),
            reason: format!(
                "run {} finished {status}: {}",
                result.summary.run_id,
                result.summary.error.as_deref().unwrap_or("no error reported")
            ),
        }),
    }
}

// ── Embedded sub-runs ──────────────────────────────────────────

/// Run `members` one at a time in topological order, sharing `ctx`.
///
/// Member failures are contained according to each member's strategy; an
/// uncontained failure stops the sub-run and becomes the owner's error.
async fn sub_run(
    run: &Arc<RunState>,
    owner: &SkillNode,
    members: &[NodeId],
    ctx: &ExecutionContext,
    iteration: Option<u32>,
) -> Result<Map<String, Value>> {
    let order = run.plan.sorted(members);
    let scope = Embedded {
        owner: &owner.id,
        iteration,
    };
    let mut blocked: HashSet<&str> = HashSet::new();
    let mut outputs = Map::new();

    for (i, id) in order.iter().enumerate() {
        if run.cancel.is_cancelled() {
            for rest in &order[i..] {
                run.mark_unrun(rest, NodeStatus::Cancelled, "run cancelled", Some(scope)).await;
            }
            return Err(FlowError::Cancelled(format!("sub-run of '{}'", owner.id)));
        }

        let Some(member) = run.def.node(id) else {
            continue;
        };
        if let Some(dep) = member.depends_on.iter().find(|d| blocked.contains(d.as_str())) {
            blocked.insert(id);
            run.mark_unrun(id, NodeStatus::Skipped, format!("dependency '{dep}' did not succeed"), Some(scope))
                .await;
            continue;
        }

        let outcome = execute(run, id, ctx, Some(scope)).await;
        match outcome.status {
            NodeStatus::Success => {
                let value = ctx.output(id).map(|v| (*v).clone()).unwrap_or(Value::Null);
                outputs.insert(id.clone(), value);
            }
            NodeStatus::Failed => match member.terminal_strategy() {
                ErrorStrategy::Continue => {
                    outputs.insert(id.clone(), Value::Null);
                }
                ErrorStrategy::SkipDependents => {
                    blocked.insert(id);
                }
                ErrorStrategy::FailFast | ErrorStrategy::Retry => {
                    for rest in &order[i + 1..] {
                        run.mark_unrun(rest, NodeStatus::Skipped, format!("'{id}' failed"), Some(scope))
                            .await;
                    }
                    return Err(outcome.into_error(id));
                }
            },
            NodeStatus::Cancelled => {
                for rest in &order[i + 1..] {
                    run.mark_unrun(rest, NodeStatus::Cancelled, "run cancelled", Some(scope)).await;
                }
                return Err(outcome.into_error(id));
            }
            NodeStatus::Skipped | NodeStatus::Pending | NodeStatus::Running => {
                blocked.insert(id);
            }
        }
    }
    Ok(outputs)
}

/// Skip a member list and everything nested under it.
async fn skip_members(run: &Arc<RunState>, owner: &SkillNode, members: &[NodeId], iteration: Option<u32>, reason: &str) {
    let scope = Embedded {
        owner: &owner.id,
        iteration,
    };
    for id in run.plan.sorted(members) {
        run.mark_unrun(&id, NodeStatus::Skipped, reason, Some(scope)).await;
        for nested in run.plan.members_of(&id) {
            run.mark_unrun(&nested, NodeStatus::Skipped, reason, Some(scope)).await;
        }
    }
}

async fn run_conditional(
    run: &Arc<RunState>,
    node: &SkillNode,
    spec: &ConditionalSpec,
    ctx: &ExecutionContext,
    embedded: Option<Embedded<'_>>,
) -> Result<Value> {
    let iteration = embedded.and_then(|e| e.iteration);

    let mut chosen: Option<usize> = None;
    for (i, branch) in spec.branches.iter().enumerate() {
        let predicate = Predicate::parse(&branch.condition)?;
        if predicate.eval(ctx)? {
            chosen = Some(i);
            break;
        }
    }

    // Branch lists in declaration order, the default branch last.
    let mut lists: Vec<&[NodeId]> = spec.branches.iter().map(|b| b.nodes.as_slice()).collect();
    if let Some(default) = &spec.default_branch {
        lists.push(default.as_slice());
    }
    let (label, taken) = match chosen {
        Some(i) => (json!(i), Some(i)),
        None if spec.default_branch.is_some() => (json!("default"), Some(lists.len() - 1)),
        None => (Value::Null, None),
    };
    debug!(run_id = %run.run_id, node = %node.id, branch = %label, "conditional evaluated");

    for (i, list) in lists.iter().enumerate() {
        if Some(i) != taken {
            skip_members(run, node, list, iteration, "branch not taken").await;
        }
    }

    let results = match taken {
        Some(i) => sub_run(run, node, lists[i], ctx, iteration).await?,
        None => Map::new(),
    };
    Ok(json!({
        "branch_executed": label,
        "results": results,
    }))
}

async fn run_loop(run: &Arc<RunState>, node: &SkillNode, spec: &LoopSpec, ctx: &ExecutionContext) -> Result<Value> {
    let limit = || FlowError::LoopLimitExceeded {
        node: node.id.clone(),
        max_iterations: spec.max_iterations,
    };
    let bind = |index: u32, item: Value| {
        let mut vars = HashMap::new();
        vars.insert(spec.var.clone(), item);
        vars.insert("index".to_string(), json!(index));
        ctx.with_loop(vars)
    };

    let mut iterations = Vec::new();
    match spec.loop_type {
        LoopType::For => {
            let source = spec
                .collection
                .as_deref()
                .ok_or_else(|| FlowError::Resolution(format!("loop '{}' has no collection", node.id)))?;
            let collection = match Reference::parse(source) {
                Some(reference) => resolve_reference(&reference?, ctx)?,
                None => {
                    return Err(FlowError::Resolution(format!(
                        "loop '{}' collection '{source}' is not a reference",
                        node.id
                    )));
                }
            };
            let Value::Array(items) = collection else {
                return Err(FlowError::Resolution(format!(
                    "loop '{}' collection '{source}' is not an array",
                    node.id
                )));
            };
            for (i, item) in items.into_iter().enumerate() {
                let index = i as u32;
                if index >= spec.max_iterations {
                    return Err(limit());
                }
                iterations.push(iterate(run, node, spec, &bind(index, item), index).await?);
            }
        }
        LoopType::ForRange => {
            let range = spec
                .range
                .ok_or_else(|| FlowError::Resolution(format!("loop '{}' has no range", node.id)))?;
            for (i, value) in range.values().enumerate() {
                let index = i as u32;
                if index >= spec.max_iterations {
                    return Err(limit());
                }
                iterations.push(iterate(run, node, spec, &bind(index, json!(value)), index).await?);
            }
        }
        LoopType::While => {
            let source = spec
                .condition
                .as_deref()
                .ok_or_else(|| FlowError::Resolution(format!("loop '{}' has no condition", node.id)))?;
            let condition = Predicate::parse(source)?;
            let mut index = 0u32;
            loop {
                let scope = bind(index, json!(index));
                let view = WhileView {
                    scope: &scope,
                    plan: &run.plan,
                    owner: &node.id,
                };
                if !condition.eval(&view)? {
                    break;
                }
                if index >= spec.max_iterations {
                    return Err(limit());
                }
                iterations.push(iterate(run, node, spec, &scope, index).await?);
                index += 1;
            }
        }
    }

    let total = iterations.len();
    debug!(run_id = %run.run_id, node = %node.id, iterations = total, "loop finished");
    Ok(json!({
        "loop_type": spec.loop_type,
        "iterations": iterations,
        "total_iterations": total,
    }))
}

/// What a while condition sees: body nodes that have not run yet read as
/// `null`, everything else as in the iteration scope.
struct WhileView<'a> {
    scope: &'a ExecutionContext,
    plan: &'a ExecutionPlan,
    owner: &'a str,
}

impl ResolveContext for WhileView<'_> {
    fn inputs(&self) -> &Value {
        self.scope.inputs()
    }

    fn node_output(&self, node: &str) -> Option<Arc<Value>> {
        self.scope
            .output(node)
            .or_else(|| self.plan.is_member_of(node, self.owner).then(|| Arc::new(Value::Null)))
    }

    fn loop_var(&self, name: &str) -> Option<Value> {
        self.scope.loop_var(name)
    }

    fn in_loop(&self) -> bool {
        self.scope.in_loop()
    }
}

async fn iterate(
    run: &Arc<RunState>,
    node: &SkillNode,
    spec: &LoopSpec,
    scope: &ExecutionContext,
    index: u32,
) -> Result<Value> {
    if run.cancel.is_cancelled() {
        return Err(FlowError::Cancelled(format!("loop '{}' at iteration {index}", node.id)));
    }
    let outputs = sub_run(run, node, &spec.body, scope, Some(index)).await?;
    Ok(Value::Object(outputs))
}
