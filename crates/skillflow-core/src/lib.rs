//! # skillflow-core
//!
//! Shared vocabulary for the SkillFlow runtime: the error taxonomy, run and
//! node status types, progress events and the tool invocation seam used by
//! the execution engine.

pub mod error;
pub mod event;
pub mod tool;
pub mod types;

pub use error::{FlowError, Result};
pub use event::{EventBus, RunEvent};
pub use tool::{PromptDescriptor, ResourceDescriptor, ToolDescriptor, ToolInvoker};
pub use types::*;
