//! # skillflow-cli
//!
//! Command-line interface for the SkillFlow runtime.
//!
//! ## Commands
//!
//! - `skillflow run` runs a stored skill or a skill file
//! - `skillflow check` validates a skill file and prints its plan
//! - `skillflow skills` lists, saves and inspects stored skills
//! - `skillflow servers` / `tools` / `call` talk to configured upstreams
//! - `skillflow config` prints the effective configuration
//! - `skillflow serve` serves stored skills as tools over stdio

pub mod commands;

pub use commands::Cli;
