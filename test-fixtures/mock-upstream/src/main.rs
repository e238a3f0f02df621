//! Scriptable upstream tool server speaking the stdio protocol.
//!
//! Flags switch on misbehaviour: staying silent, never answering
//! `initialize`, or prefixing every response with a malformed frame.

use clap::Parser;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, mpsc};

use skillflow_mcp::framing::{Frame, FrameReader, encode};
use skillflow_mcp::jsonrpc::{INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, Message, PROTOCOL_VERSION, RequestId, RpcError};

#[derive(Parser, Debug, Clone)]
#[command(name = "skillflow-mock-upstream")]
struct Args {
    /// Read stdin but never write a byte.
    #[arg(long)]
    silent: bool,

    /// Never answer `initialize` (other traffic is still handled).
    #[arg(long)]
    stall_handshake: bool,

    /// Write a malformed line before each response.
    #[arg(long)]
    garbage: bool,

    /// Write a line that is not valid UTF-8 before each response.
    #[arg(long)]
    invalid_utf8: bool,

    /// Advertise no capabilities at all.
    #[arg(long)]
    bare: bool,

    #[arg(long, default_value = "mock-upstream")]
    name: String,
}

struct Mock {
    args: Args,
    out: mpsc::UnboundedSender<Vec<u8>>,
    /// Our request id → the tool call waiting on the client's answer.
    awaiting: Mutex<HashMap<Option<RequestId>, RequestId>>,
    cancelled: Mutex<Vec<Value>>,
    calls: AtomicU64,
    next_server_id: AtomicU64,
}

impl Mock {
    fn send(&self, message: &Message) {
        if self.args.garbage {
            let _ = self.out.send(b"{this is not json\n".to_vec());
        }
        if self.args.invalid_utf8 {
            let _ = self.out.send(b"\xff\xfe\x80 not text\n".to_vec());
        }
        let _ = self.out.send(encode(message).into_bytes());
    }

    fn reply(&self, id: RequestId, outcome: Result<Value, RpcError>) {
        self.send(&Message::response(Some(id), outcome));
    }

    fn capabilities(&self) -> Value {
        if self.args.bare {
            json!({})
        } else {
            json!({ "tools": {}, "prompts": {}, "resources": {}, "logging": {} })
        }
    }

    async fn on_request(self: Arc<Self>, id: RequestId, method: String, params: Value) {
        match method.as_str() {
            "initialize" => {
                if self.args.stall_handshake {
                    // Prove we are alive without ever completing the handshake.
                    self.send(&Message::notification(
                        "notifications/message",
                        json!({ "level": "info", "data": "stalling" }),
                    ));
                    return;
                }
                self.reply(
                    id,
                    Ok(json!({
                        "protocolVersion": PROTOCOL_VERSION,
                        "capabilities": self.capabilities(),
                        "serverInfo": { "name": self.args.name, "version": "0.0.1" },
                    })),
                );
            }
            "ping" => self.reply(id, Ok(json!({}))),
            "tools/list" => self.reply(id, Ok(json!({ "tools": tool_catalogue() }))),
            "prompts/list" => self.reply(
                id,
                Ok(json!({ "prompts": [
                    { "name": "greet", "description": "Say hello", "arguments": [ { "name": "who", "required": true } ] }
                ] })),
            ),
            "prompts/get" => {
                let who = params["arguments"]["who"].as_str().unwrap_or("world").to_string();
                self.reply(
                    id,
                    Ok(json!({ "messages": [
                        { "role": "user", "content": { "type": "text", "text": format!("Hello, {who}!") } }
                    ] })),
                );
            }
            "resources/list" => self.reply(
                id,
                Ok(json!({ "resources": [
                    { "uri": "mem://notes", "name": "notes", "mimeType": "text/plain" }
                ] })),
            ),
            "resources/templates/list" => self.reply(
                id,
                Ok(json!({ "resourceTemplates": [
                    { "uriTemplate": "mem://{key}", "name": "entry" }
                ] })),
            ),
            "resources/read" => {
                let uri = params["uri"].as_str().unwrap_or_default().to_string();
                self.reply(
                    id,
                    Ok(json!({ "contents": [ { "uri": uri, "mimeType": "text/plain", "text": "remember the milk" } ] })),
                );
            }
            "tools/call" => self.call_tool(id, params).await,
            other => self.reply(
                id,
                Err(RpcError::new(METHOD_NOT_FOUND, format!("method not found: {other}"))),
            ),
        }
    }

    async fn call_tool(self: Arc<Self>, id: RequestId, params: Value) {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let name = params["name"].as_str().unwrap_or_default().to_string();
        let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        let output = match name.as_str() {
            "echo" => args,
            "add" => json!({ "sum": args["a"].as_f64().unwrap_or(0.0) + args["b"].as_f64().unwrap_or(0.0) }),
            "sleep" => {
                let ms = args["ms"].as_u64().unwrap_or(100);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                json!({ "slept_ms": ms })
            }
            "fail" => {
                let message = args["message"].as_str().unwrap_or("failed on purpose");
                self.reply(
                    id,
                    Ok(json!({ "isError": true, "content": [ { "type": "text", "text": message } ] })),
                );
                return;
            }
            "exit" => {
                let code = args["code"].as_i64().unwrap_or(3) as i32;
                std::process::exit(code);
            }
            "stats" => {
                let cancelled = self.cancelled.lock().await.clone();
                json!({ "calls": n, "pid": std::process::id(), "cancelled": cancelled })
            }
            "log" => {
                self.send(&Message::notification(
                    "notifications/message",
                    json!({ "level": args["level"].as_str().unwrap_or("info"), "logger": "mock", "data": args["data"] }),
                ));
                eprintln!("mock stderr: {}", args["data"]);
                json!({ "logged": true })
            }
            "roots" | "unknown_method" | "null_id" => {
                let method = if name == "unknown_method" { "bogus/method" } else { "roots/list" };
                let server_id = if name == "null_id" {
                    None
                } else {
                    let k = self.next_server_id.fetch_add(1, Ordering::SeqCst);
                    Some(RequestId::String(format!("srv-{k}")))
                };
                self.awaiting
                    .lock()
                    .await
                    .insert(server_id.clone(), id);
                let request = Message::Request {
                    id: server_id,
                    method: method.to_string(),
                    params: json!({}),
                };
                self.send(&request);
                return;
            }
            other => {
                self.reply(
                    id,
                    Err(RpcError::new(INVALID_PARAMS, format!("unknown tool: {other}"))),
                );
                return;
            }
        };

        self.reply(
            id,
            Ok(json!({
                "content": [ { "type": "text", "text": output.to_string() } ],
                "structuredContent": output,
            })),
        );
    }

    /// The client answered one of our requests; forward its answer.
    async fn on_response(&self, id: Option<RequestId>, outcome: Result<Value, RpcError>) {
        let Some(call_id) = self.awaiting.lock().await.remove(&id) else {
            return;
        };
        let forwarded = match outcome {
            Ok(result) => json!({ "result": result }),
            Err(err) => json!({ "error": { "code": err.code, "message": err.message } }),
        };
        self.reply(
            call_id,
            Ok(json!({
                "content": [ { "type": "text", "text": forwarded.to_string() } ],
                "structuredContent": forwarded,
            })),
        );
    }
}

fn tool_catalogue() -> Value {
    json!([
        { "name": "echo", "description": "Return the arguments", "inputSchema": { "type": "object" } },
        { "name": "add", "description": "Add a and b",
          "inputSchema": { "type": "object", "properties": { "a": { "type": "number" }, "b": { "type": "number" } } } },
        { "name": "sleep", "description": "Sleep for ms milliseconds",
          "inputSchema": { "type": "object", "properties": { "ms": { "type": "integer" } } } },
        { "name": "fail", "description": "Return an error result" },
        { "name": "exit", "description": "Terminate the process" },
        { "name": "stats", "description": "Call counter, pid and received cancellations" },
        { "name": "log", "description": "Emit a log notification and a stderr line" },
        { "name": "roots", "description": "Ask the client for its roots" },
        { "name": "unknown_method", "description": "Send the client a request it cannot handle" },
        { "name": "null_id", "description": "Send the client a request with a null id" }
    ])
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let (out, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(&line).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });

    let silent = args.silent;
    let mock = Arc::new(Mock {
        args,
        out,
        awaiting: Mutex::new(HashMap::new()),
        cancelled: Mutex::new(Vec::new()),
        calls: AtomicU64::new(0),
        next_server_id: AtomicU64::new(1),
    });

    let mut frames = FrameReader::new(tokio::io::stdin());
    while let Ok(Some(frame)) = frames.next().await {
        if silent {
            continue;
        }
        let Frame::Message(message) = frame else {
            continue;
        };
        match message {
            Message::Request { id: Some(id), method, params } => {
                tokio::spawn(Arc::clone(&mock).on_request(id, method, params));
            }
            Message::Request { id: None, .. } => {
                let reply = Message::response(None, Err(RpcError::new(INVALID_REQUEST, "null id")));
                let _ = mock.out.send(encode(&reply).into_bytes());
            }
            Message::Notification { method, params } => {
                if method == "notifications/cancelled" {
                    mock.cancelled.lock().await.push(params["requestId"].clone());
                }
            }
            Message::Response { id, outcome } => mock.on_response(id, outcome).await,
        }
    }
}
