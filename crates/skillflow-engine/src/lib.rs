//! # skillflow-engine
//!
//! Executes skill graphs against upstream tool servers.
//!
//! ## Architecture
//!
//! ```text
//!   SkillDefinition + inputs
//!              │ validate, plan
//!              ▼
//!      ┌──────────────┐   phases / semaphore    ┌──────────────┐
//!      │  scheduler   │ ──────────────────────▶ │     node     │
//!      └──────────────┘                         │  retry loop  │
//!              ▲                                └──────┬───────┘
//!              │ statuses, records                     │
//!      ┌──────────────┐        ┌──────────────┬────────┴──────┬─────────────┐
//!      │   RunState   │        ▼              ▼               ▼             ▼
//!      └──────────────┘    tool_call      skill_call    conditional/loop  control
//!              │          (ToolInvoker)  (nested run)   (embedded sub-run)
//!              ▼
//!    RunSummary → RunLogSink, EventBus
//! ```
//!
//! [`SkillEngine::run`] runs to completion; [`SkillEngine::start`] runs in the
//! background and is observed through [`SkillEngine::status`],
//! [`SkillEngine::cancel`] and [`SkillEngine::wait`]. [`SkillService`] exposes
//! stored skills as tools over stdio.

pub mod context;
pub mod engine;
pub(crate) mod node;
pub(crate) mod run;
pub mod runs;
pub(crate) mod scheduler;
pub mod service;

pub use context::ExecutionContext;
pub use engine::{EngineBuilder, EngineSettings, RunOptions, SkillEngine};
pub use runs::RunSnapshot;
pub use service::{CANCEL_RUN_TOOL, RUN_STATUS_TOOL, SkillService};
