//! # skillflow-mcp
//!
//! Talks to upstream tool servers over their stdio: newline-delimited
//! JSON-RPC 2.0, one child process per endpoint.
//!
//! - [`Connection`] owns one process: handshake, request correlation,
//!   server-initiated requests, timeouts and shutdown.
//! - [`ConnectionRegistry`] keys connections by server id, starts them on
//!   first use and implements [`skillflow_core::ToolInvoker`] for the engine.
//!
//! The protocol tests live with the scriptable upstream in
//! `test-fixtures/mock-upstream`.

pub mod connection;
pub mod framing;
pub mod handlers;
pub mod jsonrpc;
pub mod registry;

pub use connection::{ConnectOptions, Connection, ConnectionState, ServerSnapshot};
pub use framing::{Frame, FrameReader};
pub use handlers::{HandlerTable, SamplingHandler, ServerRequestHandler};
pub use jsonrpc::{Message, RequestId, RpcError};
pub use registry::{ConnectionRegistry, ServerStatus, tool_output};
