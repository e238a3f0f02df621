//! # skillflow-config
//!
//! Configuration for the SkillFlow runtime. Reads `skillflow.toml`, then applies
//! environment variable overrides.
//!
//! Supports hot-reload via filesystem watcher.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::FlowConfig;
pub use schema::{
    ConfigWarning, EngineConfig, LoggingConfig, ServerEntry, StorageConfig, Timeouts,
    UpstreamConfig, WarningSeverity,
};
