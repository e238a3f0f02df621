//! # skillflow-skills
//!
//! The static side of a skill: its graph model, the validation that turns a
//! definition into an [`ExecutionPlan`], the Parameter Resolver that fills in
//! node arguments, and the stores that keep skill versions and run logs.
//!
//! ## Skill JSON
//!
//! ```json
//! {
//!   "id": "mirror",
//!   "inputs_schema": { "type": "object", "required": ["url"] },
//!   "graph": {
//!     "nodes": [
//!       { "id": "fetch", "kind": "tool_call", "server": "web", "tool": "fetch",
//!         "args_template": { "url": "$inputs.url" } },
//!       { "id": "save", "kind": "tool_call", "server": "fs", "tool": "write",
//!         "depends_on": ["fetch"],
//!         "args_template": { "data": "@fetch.outputs.body" } }
//!     ],
//!     "concurrency": { "mode": "sequential" }
//!   }
//! }
//! ```
//!
//! ## Template references
//!
//! | Form | Resolves to |
//! |---|---|
//! | `$inputs.a.b[0]` | a path into the run's inputs |
//! | `@node.outputs.x` | a path into a finished node's output |
//! | `$loop.item` / `$loop.index` | the innermost loop binding |
//!
//! A string that is exactly one reference is replaced by the referenced value,
//! keeping its JSON type. Anything else is a literal.

pub mod definition;
pub mod expr;
pub mod graph;
pub mod jsonpath;
pub mod path;
pub mod record;
pub mod resolver;
pub mod runlog;
pub mod store;
pub mod transform;

pub use definition::{
    Branch, Concurrency, ConcurrencyMode, ConditionalSpec, ErrorStrategy, LoopSpec, LoopType,
    NodeKind, RangeSpec, RetryConfig, SkillDefinition, SkillGraph, SkillNode,
};
pub use expr::Predicate;
pub use graph::ExecutionPlan;
pub use path::Reference;
pub use record::{NodeExecutionRecord, RunResult, RunSummary, StatusCounts};
pub use resolver::{ResolveContext, StaticContext, resolve, resolve_reference};
pub use runlog::{JsonlRunLog, LogLine, MemoryRunLog, RunLogSink, TeeRunLog};
pub use store::{FileSkillStore, InMemorySkillStore, SkillLoader};
pub use transform::{ParameterTransform, TransformEngine, TransformScope};
