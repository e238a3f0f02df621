//! Connection Registry: one lazily started [`Connection`] per configured
//! upstream, shared by every caller that targets it.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use skillflow_config::{FlowConfig, ServerEntry, UpstreamConfig};
use skillflow_core::{
    EventBus, FlowError, PromptDescriptor, ResourceDescriptor, Result, RunEvent, ToolDescriptor,
    ToolInvoker,
};

use crate::connection::{ConnectOptions, Connection, ConnectionState};
use crate::handlers::SamplingHandler;

type Slot = Arc<tokio::sync::Mutex<Option<Arc<Connection>>>>;

/// Registry view of one endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub id: String,
    pub name: Option<String>,
    pub command: String,
    pub enabled: bool,
    /// `None` until the first connection attempt.
    pub state: Option<ConnectionState>,
    pub tool_count: usize,
}

pub struct ConnectionRegistry {
    servers: RwLock<BTreeMap<String, ServerEntry>>,
    upstream: RwLock<UpstreamConfig>,
    slots: DashMap<String, Slot>,
    sampling: Option<Arc<dyn SamplingHandler>>,
    events: Option<EventBus>,
}

impl ConnectionRegistry {
    pub fn new(upstream: UpstreamConfig, servers: BTreeMap<String, ServerEntry>) -> Self {
        Self {
            servers: RwLock::new(servers),
            upstream: RwLock::new(upstream),
            slots: DashMap::new(),
            sampling: None,
            events: None,
        }
    }

    pub fn from_config(config: &FlowConfig) -> Self {
        Self::new(config.upstream.clone(), config.servers.clone())
    }

    /// Answer upstream `sampling/createMessage` requests with `handler`.
    pub fn with_sampling_handler(mut self, handler: Arc<dyn SamplingHandler>) -> Self {
        self.sampling = Some(handler);
        self
    }

    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    // ── Endpoint table ─────────────────────────────────────────

    /// Add or replace an endpoint. A live connection to a replaced endpoint
    /// is closed; the next call starts the new command.
    pub async fn register_server(&self, id: &str, entry: ServerEntry) {
        let previous = self.servers.write().insert(id.to_string(), entry);
        if previous.is_some() {
            self.disconnect(id).await;
        }
        info!(server = %id, "registered upstream");
    }

    /// Remove an endpoint and close its connection. Returns whether it existed.
    pub async fn unregister_server(&self, id: &str) -> bool {
        let existed = self.servers.write().remove(id).is_some();
        self.disconnect(id).await;
        self.slots.remove(id);
        if existed {
            info!(server = %id, "unregistered upstream");
        }
        existed
    }

    /// Bring the endpoint table in line with a reloaded config.
    pub async fn apply_config(&self, config: &FlowConfig) {
        *self.upstream.write() = config.upstream.clone();
        let current = self.servers.read().clone();

        for id in current.keys() {
            if !config.servers.contains_key(id) {
                self.unregister_server(id).await;
            }
        }
        for (id, entry) in &config.servers {
            let changed = current.get(id).is_none_or(|old| !same_launch(old, entry));
            if changed {
                self.register_server(id, entry.clone()).await;
            }
        }
    }

    pub fn list_servers(&self) -> Vec<ServerStatus> {
        let servers = self.servers.read().clone();
        servers
            .into_iter()
            .map(|(id, entry)| {
                let conn = self.current(&id);
                ServerStatus {
                    name: entry.name.clone(),
                    command: entry.command.clone(),
                    enabled: entry.enabled,
                    state: conn.as_ref().map(|c| c.state()),
                    tool_count: conn.as_ref().map_or(0, |c| c.tools().len()),
                    id,
                }
            })
            .collect()
    }

    pub fn has_server(&self, id: &str) -> bool {
        self.servers.read().contains_key(id)
    }

    /// The live connection for `id`, without connecting.
    pub fn current(&self, id: &str) -> Option<Arc<Connection>> {
        let slot = self.slots.get(id)?.clone();
        let guard = slot.try_lock().ok()?;
        guard.clone()
    }

    // ── Connections ────────────────────────────────────────────

    /// Connected session for `id`, starting the process if needed. A session
    /// that is no longer `connected` is closed and replaced.
    pub async fn connection(&self, id: &str) -> Result<Arc<Connection>> {
        let entry = self
            .servers
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| FlowError::ServerNotFound(id.to_string()))?;
        if !entry.enabled {
            return Err(FlowError::ServerNotFound(format!("{id} (disabled)")));
        }

        let slot = self.slots.entry(id.to_string()).or_default().clone();
        let mut guard = slot.lock().await;
        if let Some(conn) = guard.as_ref() {
            if conn.is_connected() {
                return Ok(Arc::clone(conn));
            }
            debug!(server = %id, state = %conn.state(), "replacing stale connection");
            conn.close().await;
            *guard = None;
        }

        let opts = {
            let upstream = self.upstream.read();
            ConnectOptions::from_config(id, &entry, &upstream, self.sampling.clone())
        };
        let conn = Connection::connect(opts).await?;
        if let Some(bus) = &self.events {
            bus.publish(RunEvent::UpstreamConnected {
                server_id: id.to_string(),
                tool_count: conn.tools().len(),
            });
        }
        *guard = Some(Arc::clone(&conn));
        Ok(conn)
    }

    /// Close the connection to `id`, if any. The endpoint stays registered.
    pub async fn disconnect(&self, id: &str) {
        let Some(slot) = self.slots.get(id).map(|s| s.clone()) else {
            return;
        };
        let taken = slot.lock().await.take();
        if let Some(conn) = taken {
            conn.close().await;
            if let Some(bus) = &self.events {
                bus.publish(RunEvent::UpstreamDisconnected {
                    server_id: id.to_string(),
                    reason: conn.exit_reason(),
                });
            }
        }
    }

    pub async fn close_all(&self) {
        let ids: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.disconnect(&id).await;
        }
        info!("all upstream connections closed");
    }

    /// Bound a whole registry operation, connection included.
    async fn bounded<T>(&self, server: &str, method: &str, op: impl Future<Output = Result<T>>) -> Result<T> {
        let limit = self.upstream.read().registry_timeout();
        match tokio::time::timeout(limit, op).await {
            Ok(result) => result,
            Err(_) => {
                warn!(server = %server, %method, "registry operation timed out");
                Err(FlowError::CallTimeout {
                    server: server.to_string(),
                    method: method.to_string(),
                    timeout_ms: limit.as_millis() as u64,
                })
            }
        }
    }

    // ── Operations ─────────────────────────────────────────────

    /// Call a tool and return its output. `isError` results become
    /// [`FlowError::Tool`].
    pub async fn call(&self, server: &str, tool: &str, args: Value, cancel: CancellationToken) -> Result<Value> {
        self.bounded(server, "tools/call", async {
            let conn = self.connection(server).await?;
            debug!(server = %server, %tool, "calling tool");
            let raw = conn.call_tool(tool, args, &cancel).await?;
            tool_output(tool, raw)
        })
        .await
    }

    pub async fn list_tools(&self, server: &str) -> Result<Vec<ToolDescriptor>> {
        self.bounded(server, "tools/list", async {
            Ok(self.connection(server).await?.tools())
        })
        .await
    }

    pub async fn list_prompts(&self, server: &str) -> Result<Vec<PromptDescriptor>> {
        self.bounded(server, "prompts/list", async {
            Ok(self.connection(server).await?.prompts())
        })
        .await
    }

    pub async fn list_resources(&self, server: &str) -> Result<Vec<ResourceDescriptor>> {
        self.bounded(server, "resources/list", async {
            Ok(self.connection(server).await?.resources())
        })
        .await
    }

    pub async fn list_resource_templates(&self, server: &str) -> Result<Vec<ResourceDescriptor>> {
        self.bounded(server, "resources/templates/list", async {
            Ok(self.connection(server).await?.resource_templates())
        })
        .await
    }

    pub async fn get_prompt(&self, server: &str, name: &str, args: Value) -> Result<Value> {
        self.bounded(server, "prompts/get", async {
            self.connection(server).await?.get_prompt(name, args).await
        })
        .await
    }

    pub async fn read_resource(&self, server: &str, uri: &str) -> Result<Value> {
        self.bounded(server, "resources/read", async {
            self.connection(server).await?.read_resource(uri).await
        })
        .await
    }
}

fn same_launch(a: &ServerEntry, b: &ServerEntry) -> bool {
    a.command == b.command
        && a.args == b.args
        && a.env == b.env
        && a.cwd == b.cwd
        && a.enabled == b.enabled
        && a.start_timeout_ms == b.start_timeout_ms
        && a.handshake_timeout_ms == b.handshake_timeout_ms
        && a.call_timeout_ms == b.call_timeout_ms
}

/// Turn a raw `tools/call` result into a node output.
///
/// `structuredContent` wins when present; otherwise the result object itself
/// is the output.
pub fn tool_output(tool: &str, result: Value) -> Result<Value> {
    if result.get("isError").and_then(Value::as_bool) == Some(true) {
        return Err(FlowError::Tool {
            tool: tool.to_string(),
            reason: content_text(&result).unwrap_or_else(|| "tool reported an error".into()),
        });
    }
    match result.get("structuredContent") {
        Some(structured) if !structured.is_null() => Ok(structured.clone()),
        _ => Ok(result),
    }
}

fn content_text(result: &Value) -> Option<String> {
    let parts: Vec<&str> = result
        .get("content")?
        .as_array()?
        .iter()
        .filter(|c| c["type"] == "text")
        .filter_map(|c| c["text"].as_str())
        .collect();
    if parts.is_empty() { None } else { Some(parts.join("\n")) }
}

#[async_trait]
impl ToolInvoker for ConnectionRegistry {
    async fn invoke(&self, server: &str, tool: &str, args: Value, cancel: CancellationToken) -> Result<Value> {
        self.call(server, tool, args, cancel).await
    }

    async fn tools(&self, server: &str) -> Result<Vec<ToolDescriptor>> {
        self.list_tools(server).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn structured_content_preferred() {
        let raw = json!({"content": [{"type": "text", "text": "{}"}], "structuredContent": {"body": "abc"}});
        assert_eq!(tool_output("fetch", raw).unwrap(), json!({"body": "abc"}));

        let plain = json!({"content": [{"type": "text", "text": "hi"}]});
        assert_eq!(tool_output("echo", plain.clone()).unwrap(), plain);
    }

    #[test]
    fn is_error_becomes_tool_error() {
        let raw = json!({
            "isError": true,
            "content": [{"type": "text", "text": "disk full"}, {"type": "image"}, {"type": "text", "text": "retry later"}]
        });
        let err = tool_output("write", raw).unwrap_err();
        match err {
            FlowError::Tool { tool, reason } => {
                assert_eq!(tool, "write");
                assert_eq!(reason, "disk full\nretry later");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(tool_output("x", json!({"isError": true})).is_err());
    }

    #[tokio::test]
    async fn unknown_and_disabled_servers() {
        let mut servers = BTreeMap::new();
        let mut off = ServerEntry::new("true", vec![]);
        off.enabled = false;
        servers.insert("off".to_string(), off);
        let reg = ConnectionRegistry::new(UpstreamConfig::default(), servers);

        assert!(matches!(reg.connection("nope").await, Err(FlowError::ServerNotFound(_))));
        assert!(matches!(reg.connection("off").await, Err(FlowError::ServerNotFound(_))));
        let listed = reg.list_servers();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].state.is_none());
        assert!(reg.unregister_server("off").await);
        assert!(!reg.has_server("off"));
    }
}
