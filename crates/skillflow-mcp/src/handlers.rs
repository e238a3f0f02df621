//! Handlers for requests an upstream sends to us.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use skillflow_core::Result;

use crate::jsonrpc::{INTERNAL_ERROR, RpcError};

/// Answers one server-initiated method. An `Err` is written back as the
/// JSON-RPC error of the response.
#[async_trait]
pub trait ServerRequestHandler: Send + Sync {
    async fn handle(&self, params: Value) -> std::result::Result<Value, RpcError>;
}

/// Produces a completion for `sampling/createMessage`.
#[async_trait]
pub trait SamplingHandler: Send + Sync {
    /// Return the generated text for the request.
    async fn create_message(&self, params: Value) -> Result<String>;
}

/// Method name → handler.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<String, Arc<dyn ServerRequestHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// `roots/list` answered from `roots`, and `sampling/createMessage`
    /// rejected unless a sampling handler is supplied.
    pub fn with_defaults(roots: Vec<PathBuf>, sampling: Option<Arc<dyn SamplingHandler>>) -> Self {
        let mut table = Self::new();
        table.insert("roots/list", Arc::new(RootsHandler { roots }));
        table.insert("sampling/createMessage", Arc::new(SamplingAdapter { inner: sampling }));
        table
    }

    pub fn insert(&mut self, method: impl Into<String>, handler: Arc<dyn ServerRequestHandler>) {
        self.handlers.insert(method.into(), handler);
    }

    pub fn get(&self, method: &str) -> Option<Arc<dyn ServerRequestHandler>> {
        self.handlers.get(method).cloned()
    }

    pub fn methods(&self) -> Vec<&str> {
        let mut m: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        m.sort_unstable();
        m
    }
}

struct RootsHandler {
    roots: Vec<PathBuf>,
}

#[async_trait]
impl ServerRequestHandler for RootsHandler {
    async fn handle(&self, _params: Value) -> std::result::Result<Value, RpcError> {
        let roots: Vec<Value> = self
            .roots
            .iter()
            .map(|p| {
                let raw = p.to_string_lossy();
                let uri = if raw.starts_with("file://") {
                    raw.to_string()
                } else {
                    format!("file://{raw}")
                };
                let name = p
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| raw.to_string());
                json!({ "uri": uri, "name": name })
            })
            .collect();
        Ok(json!({ "roots": roots }))
    }
}

struct SamplingAdapter {
    inner: Option<Arc<dyn SamplingHandler>>,
}

#[async_trait]
impl ServerRequestHandler for SamplingAdapter {
    async fn handle(&self, params: Value) -> std::result::Result<Value, RpcError> {
        let Some(handler) = &self.inner else {
            return Err(RpcError::new(
                INTERNAL_ERROR,
                "sampling not supported: no handler configured",
            ));
        };
        let text = handler
            .create_message(params)
            .await
            .map_err(|e| RpcError::new(INTERNAL_ERROR, e.to_string()))?;
        Ok(json!({
            "role": "assistant",
            "content": { "type": "text", "text": text }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl SamplingHandler for Echo {
        async fn create_message(&self, params: Value) -> Result<String> {
            Ok(format!("echo {}", params["prompt"].as_str().unwrap_or_default()))
        }
    }

    #[tokio::test]
    async fn roots_become_file_uris() {
        let table = HandlerTable::with_defaults(vec![PathBuf::from("/srv/data"), PathBuf::from("file:///tmp")], None);
        let out = table.get("roots/list").unwrap().handle(Value::Null).await.unwrap();
        assert_eq!(out["roots"][0], json!({"uri": "file:///srv/data", "name": "data"}));
        assert_eq!(out["roots"][1]["uri"], "file:///tmp");
    }

    #[tokio::test]
    async fn sampling_requires_handler() {
        let table = HandlerTable::with_defaults(vec![], None);
        let err = table.get("sampling/createMessage").unwrap().handle(json!({})).await.unwrap_err();
        assert_eq!(err.code, INTERNAL_ERROR);

        let table = HandlerTable::with_defaults(vec![], Some(Arc::new(Echo)));
        let out = table
            .get("sampling/createMessage")
            .unwrap()
            .handle(json!({"prompt": "hi"}))
            .await
            .unwrap();
        assert_eq!(out["content"]["text"], "echo hi");
        assert_eq!(table.methods(), vec!["roots/list", "sampling/createMessage"]);
    }
}
