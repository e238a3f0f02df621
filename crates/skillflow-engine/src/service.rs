//! Tool-facing server: exposes stored skills as `skill__<id>` tools over the
//! same newline-delimited JSON-RPC framing the upstream client speaks.

use dashmap::DashMap;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use skillflow_core::{FlowError, RunId, RunStatus, VersionSpec, skill_id_from_tool_name};
use skillflow_mcp::framing::{Frame, FrameReader, encode};
use skillflow_mcp::jsonrpc::{
    INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, Message, PROTOCOL_VERSION,
    RequestId, RpcError,
};

use crate::engine::SkillEngine;

pub const RUN_STATUS_TOOL: &str = "skillflow_run_status";
pub const CANCEL_RUN_TOOL: &str = "skillflow_cancel_run";

/// Serves skills to a tool-calling client.
pub struct SkillService {
    engine: SkillEngine,
    server_name: String,
    server_version: String,
    /// Client request id → the run it started, for `notifications/cancelled`.
    inflight: DashMap<String, RunId>,
}

impl SkillService {
    pub fn new(engine: SkillEngine) -> Self {
        Self {
            engine,
            server_name: "skillflow".into(),
            server_version: env!("CARGO_PKG_VERSION").into(),
            inflight: DashMap::new(),
        }
    }

    pub fn with_server_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.server_name = name.into();
        self.server_version = version.into();
        self
    }

    pub fn engine(&self) -> &SkillEngine {
        &self.engine
    }

    /// Serve on the process's stdin/stdout until stdin closes.
    pub async fn serve_stdio(self: Arc<Self>) -> std::io::Result<()> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve one client until `reader` reaches end of stream. Requests are
    /// handled concurrently; responses may arrive out of order.
    pub async fn serve<R, W>(self: Arc<Self>, reader: R, mut writer: W) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let writer_task = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                writer.write_all(encode(&message).as_bytes()).await?;
                writer.flush().await?;
            }
            Ok::<_, std::io::Error>(())
        });

        info!(server = %self.server_name, "skill service listening");
        let mut frames = FrameReader::new(reader);
        while let Some(frame) = frames.next().await? {
            let message = match frame {
                Frame::Message(m) => m,
                Frame::Malformed { line, reason } => {
                    warn!(%line, %reason, "dropping malformed frame");
                    continue;
                }
            };
            match message {
                Message::Request { id: Some(id), method, params } => {
                    let service = Arc::clone(&self);
                    let out = out.clone();
                    tokio::spawn(async move {
                        let outcome = service.handle(&id, &method, params).await;
                        let _ = out.send(Message::response(Some(id), outcome));
                    });
                }
                Message::Request { id: None, method, .. } => {
                    debug!(%method, "request with null id");
                    let _ = out.send(Message::response(None, Err(RpcError::new(INVALID_REQUEST, "null id"))));
                }
                Message::Notification { method, params } => self.on_notification(&method, &params),
                Message::Response { id, .. } => {
                    debug!(id = ?id, "ignoring unsolicited response");
                }
            }
        }

        drop(out);
        info!(server = %self.server_name, "client disconnected");
        match writer_task.await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::other(e)),
        }
    }

    fn on_notification(&self, method: &str, params: &Value) {
        match method {
            "notifications/cancelled" => {
                let key = request_key(&params["requestId"]);
                if let Some((_, run_id)) = self.inflight.remove(&key) {
                    info!(request = %key, run_id = %run_id, "client cancelled request");
                    self.engine.cancel(run_id);
                }
            }
            "notifications/initialized" => debug!("client initialized"),
            other => debug!(method = %other, "ignoring notification"),
        }
    }

    async fn handle(&self, id: &RequestId, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "initialize" => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": { "listChanged": false } },
                "serverInfo": { "name": self.server_name, "version": self.server_version },
            })),
            "ping" => Ok(json!({})),
            "tools/list" => self.list_tools().await,
            "tools/call" => {
                let name = params["name"]
                    .as_str()
                    .ok_or_else(|| RpcError::new(INVALID_PARAMS, "missing tool name"))?;
                let args = match &params["arguments"] {
                    Value::Null => json!({}),
                    other => other.clone(),
                };
                self.call_tool(id, name, args).await
            }
            other => Err(RpcError::new(METHOD_NOT_FOUND, format!("method not found: {other}"))),
        }
    }

    async fn list_tools(&self) -> Result<Value, RpcError> {
        let skills = self
            .engine
            .loader()
            .list(None, &[])
            .await
            .map_err(|e| RpcError::new(INTERNAL_ERROR, e.to_string()))?;
        let mut tools: Vec<Value> = skills
            .iter()
            .map(|def| serde_json::to_value(def.tool_descriptor()).unwrap_or(Value::Null))
            .collect();
        tools.push(json!({
            "name": RUN_STATUS_TOOL,
            "description": "Status of a skill run, or of every run when run_id is omitted",
            "inputSchema": {
                "type": "object",
                "properties": { "run_id": { "type": "string" } },
            },
        }));
        tools.push(json!({
            "name": CANCEL_RUN_TOOL,
            "description": "Cancel a running skill",
            "inputSchema": {
                "type": "object",
                "properties": { "run_id": { "type": "string" } },
                "required": ["run_id"],
            },
        }));
        Ok(json!({ "tools": tools }))
    }

    async fn call_tool(&self, id: &RequestId, name: &str, args: Value) -> Result<Value, RpcError> {
        match name {
            RUN_STATUS_TOOL => self.run_status(&args),
            CANCEL_RUN_TOOL => {
                let run_id = run_id_arg(&args)?;
                let cancelled = self.engine.cancel(run_id);
                Ok(tool_result(json!({ "run_id": run_id, "cancelled": cancelled }), false))
            }
            _ => {
                let skill = skill_id_from_tool_name(name)
                    .ok_or_else(|| RpcError::new(INVALID_PARAMS, format!("unknown tool: {name}")))?;
                self.run_skill(id, skill, args).await
            }
        }
    }

    fn run_status(&self, args: &Value) -> Result<Value, RpcError> {
        if args.get("run_id").is_none_or(Value::is_null) {
            let runs = serde_json::to_value(self.engine.list_runs())
                .map_err(|e| RpcError::new(INTERNAL_ERROR, e.to_string()))?;
            return Ok(tool_result(json!({ "runs": runs }), false));
        }
        let run_id = run_id_arg(args)?;
        let snapshot = self
            .engine
            .status(run_id)
            .ok_or_else(|| RpcError::new(INVALID_PARAMS, format!("unknown run: {run_id}")))?;
        let value = serde_json::to_value(snapshot).map_err(|e| RpcError::new(INTERNAL_ERROR, e.to_string()))?;
        Ok(tool_result(value, false))
    }

    async fn run_skill(&self, id: &RequestId, skill: &str, inputs: Value) -> Result<Value, RpcError> {
        let def = match self.engine.loader().load(skill, VersionSpec::Latest).await {
            Ok(def) => def,
            Err(e @ FlowError::SkillNotFound(_)) => return Err(RpcError::new(INVALID_PARAMS, e.to_string())),
            Err(e) => return Err(RpcError::new(INTERNAL_ERROR, e.to_string())),
        };

        let run_id = match self.engine.start(def, inputs) {
            Ok(run_id) => run_id,
            // Invalid inputs fail the call, not the request.
            Err(e) => {
                return Ok(tool_result(
                    json!({ "skill": skill, "error": e.to_string(), "kind": e.kind() }),
                    true,
                ));
            }
        };

        let key = id.to_string();
        self.inflight.insert(key.clone(), run_id);
        let finished = self.engine.wait(run_id).await;
        self.inflight.remove(&key);

        let result = finished.map_err(|e| RpcError::new(INTERNAL_ERROR, e.to_string()))?;
        let summary = &result.summary;
        let mut body = json!({
            "run_id": summary.run_id,
            "status": summary.status,
            "outputs": summary.outputs,
        });
        if let Some(error) = &summary.error {
            body["error"] = json!(error);
        }
        Ok(tool_result(body, summary.status != RunStatus::Success))
    }
}

fn tool_result(body: Value, is_error: bool) -> Value {
    json!({
        "content": [ { "type": "text", "text": body.to_string() } ],
        "structuredContent": body,
        "isError": is_error,
    })
}

fn run_id_arg(args: &Value) -> Result<RunId, RpcError> {
    args["run_id"]
        .as_str()
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| RpcError::new(INVALID_PARAMS, "run_id must be a run id string"))
}

/// Request ids arrive as numbers or strings; key both the same way
/// [`RequestId`]'s `Display` does.
fn request_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_keys_match_display() {
        assert_eq!(request_key(&json!(7)), RequestId::Number(7).to_string());
        assert_eq!(request_key(&json!("abc")), RequestId::String("abc".into()).to_string());
    }

    #[test]
    fn run_id_must_parse() {
        let id = Uuid::new_v4();
        assert_eq!(run_id_arg(&json!({ "run_id": id.to_string() })).unwrap(), id);
        assert_eq!(run_id_arg(&json!({ "run_id": 5 })).unwrap_err().code, INVALID_PARAMS);
    }
}
