//! The [`SkillEngine`]: validates a skill version against its inputs, runs it
//! and hands the finished [`RunResult`] back.

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use skillflow_config::EngineConfig;
use skillflow_core::{EventBus, Result, RunEvent, RunId, ToolInvoker, VersionSpec};
use skillflow_skills::{ExecutionPlan, MemoryRunLog, RunLogSink, RunResult, SkillDefinition, SkillLoader};

use crate::context::ExecutionContext;
use crate::run::RunState;
use crate::runs::TrackedRun;
use crate::scheduler;

/// Engine-wide limits.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// Concurrency cap for skills that do not declare `max_parallel`.
    pub max_parallel: usize,
    /// Deepest allowed chain of nested skill_call runs.
    pub max_skill_depth: usize,
    /// How long an in-flight tool call may still finish after cancellation.
    pub cancel_grace: Duration,
    /// Finished background runs kept in the run table.
    pub retained_runs: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_parallel: 8,
            max_skill_depth: 8,
            cancel_grace: Duration::from_millis(1_000),
            retained_runs: 256,
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_parallel: config.max_parallel.max(1),
            max_skill_depth: config.max_skill_depth,
            cancel_grace: config.cancel_grace(),
            retained_runs: config.retained_runs,
        }
    }
}

/// Per-run knobs.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Use this id instead of a fresh one.
    pub run_id: Option<RunId>,
    /// Cancel the run through this token.
    pub cancel: Option<CancellationToken>,
}

pub(crate) struct EngineInner {
    invoker: Arc<dyn ToolInvoker>,
    loader: Arc<dyn SkillLoader>,
    run_log: Arc<dyn RunLogSink>,
    events: EventBus,
    settings: EngineSettings,
    pub(crate) runs: DashMap<RunId, TrackedRun>,
}

/// Runs skill graphs. Cheap to clone; clones share the run table.
#[derive(Clone)]
pub struct SkillEngine {
    inner: Arc<EngineInner>,
}

/// Builder for [`SkillEngine`].
pub struct EngineBuilder {
    invoker: Arc<dyn ToolInvoker>,
    loader: Arc<dyn SkillLoader>,
    run_log: Option<Arc<dyn RunLogSink>>,
    events: Option<EventBus>,
    settings: EngineSettings,
}

impl EngineBuilder {
    pub fn run_log(mut self, sink: Arc<dyn RunLogSink>) -> Self {
        self.run_log = Some(sink);
        self
    }

    pub fn events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> SkillEngine {
        SkillEngine {
            inner: Arc::new(EngineInner {
                invoker: self.invoker,
                loader: self.loader,
                run_log: self.run_log.unwrap_or_else(|| Arc::new(MemoryRunLog::new())),
                events: self.events.unwrap_or_default(),
                settings: self.settings,
                runs: DashMap::new(),
            }),
        }
    }
}

impl SkillEngine {
    /// `invoker` carries out tool_call nodes; `loader` resolves skill_call
    /// targets and skills started by id.
    pub fn builder(invoker: Arc<dyn ToolInvoker>, loader: Arc<dyn SkillLoader>) -> EngineBuilder {
        EngineBuilder {
            invoker,
            loader,
            run_log: None,
            events: None,
            settings: EngineSettings::default(),
        }
    }

    pub fn new(invoker: Arc<dyn ToolInvoker>, loader: Arc<dyn SkillLoader>) -> Self {
        Self::builder(invoker, loader).build()
    }

    pub fn invoker(&self) -> &Arc<dyn ToolInvoker> {
        &self.inner.invoker
    }

    pub fn loader(&self) -> &Arc<dyn SkillLoader> {
        &self.inner.loader
    }

    pub fn run_log(&self) -> &Arc<dyn RunLogSink> {
        &self.inner.run_log
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn settings(&self) -> EngineSettings {
        self.inner.settings
    }

    pub(crate) fn inner(&self) -> &EngineInner {
        &self.inner
    }

    /// Run `def` to completion.
    ///
    /// Returns `Err` only when nothing ran: the graph is invalid or the inputs
    /// do not match `inputs_schema`. Node failures are reported in the
    /// returned run summary.
    pub async fn run(&self, def: Arc<SkillDefinition>, inputs: Value) -> Result<RunResult> {
        self.run_with(def, inputs, RunOptions::default()).await
    }

    pub async fn run_with(&self, def: Arc<SkillDefinition>, inputs: Value, opts: RunOptions) -> Result<RunResult> {
        let (state, ctx) = self.prepare(def, inputs, None, opts)?;
        Ok(execute(state, ctx).await)
    }

    /// Load a stored skill and run it.
    pub async fn run_skill(&self, skill_id: &str, version: VersionSpec, inputs: Value) -> Result<RunResult> {
        let def = self.inner.loader.load(skill_id, version).await?;
        self.run(def, inputs).await
    }

    /// Validate and set up a run without starting it.
    pub(crate) fn prepare(
        &self,
        def: Arc<SkillDefinition>,
        inputs: Value,
        parent: Option<&ExecutionContext>,
        opts: RunOptions,
    ) -> Result<(Arc<RunState>, ExecutionContext)> {
        let plan = ExecutionPlan::build(&def)?;
        def.validate_inputs(&inputs)?;

        let run_id = opts.run_id.unwrap_or_else(Uuid::new_v4);
        let cancel = opts.cancel.unwrap_or_default();
        let ctx = match parent {
            Some(p) => p.child(run_id, inputs),
            None => ExecutionContext::new(run_id, inputs),
        };
        debug!(run_id = %run_id, skill = %def.id, order = ?plan.order, "execution plan ready");
        let state = RunState::new(
            self.clone(),
            run_id,
            ctx.parent_run_id(),
            def,
            Arc::new(plan),
            cancel,
        );
        Ok((Arc::new(state), ctx))
    }

    /// Run a skill on behalf of a skill_call node.
    pub(crate) fn run_nested(
        &self,
        def: Arc<SkillDefinition>,
        inputs: Value,
        parent: &ExecutionContext,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<RunResult>> {
        let prepared = self.prepare(
            def,
            inputs,
            Some(parent),
            RunOptions {
                run_id: None,
                cancel: Some(cancel),
            },
        );
        Box::pin(async move {
            let (state, ctx) = prepared?;
            Ok(execute(state, ctx).await)
        })
    }
}

/// Drive a prepared run to its summary.
pub(crate) async fn execute(state: Arc<RunState>, ctx: ExecutionContext) -> RunResult {
    state.publish(RunEvent::RunStarted {
        run_id: state.run_id,
        skill_id: state.def.id.clone(),
        version: state.def.version,
        parent_run_id: state.parent_run_id,
        at: state.started_at,
    });
    info!(
        run_id = %state.run_id,
        skill = %state.def.id,
        version = state.def.version,
        mode = ?state.plan.mode,
        nodes = state.def.graph.nodes.len(),
        depth = ctx.depth(),
        "run started"
    );

    scheduler::run_top_level(&state, &ctx).await;
    state.finish(&ctx).await
}
