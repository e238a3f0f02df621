use thiserror::Error;

/// Unified error type for the entire SkillFlow runtime.
#[derive(Error, Debug)]
pub enum FlowError {
    // ── Definition errors (abort before any node runs) ─────────
    #[error("validation error: {0}")]
    Validation(String),

    #[error("graph error: {0}")]
    Graph(String),

    // ── Resolution errors ──────────────────────────────────────
    #[error("resolution error: {0}")]
    Resolution(String),

    #[error("parameter transform failed: {0}")]
    Transform(String),

    // ── Upstream / protocol errors ─────────────────────────────
    #[error("connection error: {server}: {reason}")]
    Connection { server: String, reason: String },

    #[error("call timed out: {server}: {method} after {timeout_ms}ms")]
    CallTimeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    #[error("protocol error: {server}: [{code}] {message}")]
    Protocol {
        server: String,
        code: i64,
        message: String,
    },

    #[error("upstream server not found: {0}")]
    ServerNotFound(String),

    // ── Node execution errors ──────────────────────────────────
    #[error("tool error: {tool}: {reason}")]
    Tool { tool: String, reason: String },

    #[error("loop limit exceeded: {node} reached {max_iterations} iterations")]
    LoopLimitExceeded { node: String, max_iterations: u32 },

    #[error("skill not found: {0}")]
    SkillNotFound(String),

    #[error("nested skill failed: {skill}: {reason}")]
    SkillFailed { skill: String, reason: String },

    #[error("skill call depth {depth} exceeds limit {max}")]
    DepthExceeded { depth: usize, max: usize },

    #[error("cancelled: {0}")]
    Cancelled(String),

    // ── Storage errors ─────────────────────────────────────────
    #[error("storage error: {0}")]
    Storage(String),

    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    #[error("config validation failed: {field}: {reason}")]
    ConfigValidation { field: String, reason: String },

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl FlowError {
    /// Stable tag written into node records and run summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            FlowError::Validation(_) => "validation_error",
            FlowError::Graph(_) => "graph_error",
            FlowError::Resolution(_) => "resolution_error",
            FlowError::Transform(_) => "transform_error",
            FlowError::Connection { .. } => "connection_error",
            FlowError::CallTimeout { .. } => "call_timeout",
            FlowError::Protocol { .. } => "protocol_error",
            FlowError::ServerNotFound(_) => "server_not_found",
            FlowError::Tool { .. } => "tool_error",
            FlowError::LoopLimitExceeded { .. } => "loop_limit_exceeded",
            FlowError::SkillNotFound(_) => "skill_not_found",
            FlowError::SkillFailed { .. } => "skill_failed",
            FlowError::DepthExceeded { .. } => "depth_exceeded",
            FlowError::Cancelled(_) => "cancelled",
            FlowError::Storage(_) => "storage_error",
            FlowError::Config(_) => "config_error",
            FlowError::ConfigValidation { .. } => "config_validation",
            FlowError::Io(_) => "io_error",
            FlowError::Serialization(_) => "serialization_error",
            FlowError::Other(_) => "other",
        }
    }

    /// Errors that abort a run before any node is launched.
    pub fn is_definition_error(&self) -> bool {
        matches!(self, FlowError::Validation(_) | FlowError::Graph(_))
    }

    /// Transport-level failures that mean the upstream process is unusable.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, FlowError::Connection { .. })
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
