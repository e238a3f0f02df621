use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// A tool advertised by an upstream server or exported from a skill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema of the arguments object.
    #[serde(rename = "inputSchema", alias = "input_schema", default = "empty_object_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// A prompt template advertised by an upstream server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Vec<Value>,
}

/// A resource (or resource template) advertised by an upstream server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    #[serde(default, alias = "uriTemplate")]
    pub uri: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Anything that can carry out a named tool call on a named upstream.
///
/// The engine only talks to upstreams through this trait, which keeps the
/// scheduler testable with scripted invokers.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Invoke `tool` on `server` and return its structured result.
    ///
    /// Implementations must return promptly with [`crate::FlowError::Cancelled`]
    /// once `cancel` fires.
    async fn invoke(
        &self,
        server: &str,
        tool: &str,
        args: Value,
        cancel: CancellationToken,
    ) -> crate::Result<Value>;

    /// Tools currently known for `server`.
    async fn tools(&self, server: &str) -> crate::Result<Vec<ToolDescriptor>>;
}
