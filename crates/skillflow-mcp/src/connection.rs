//! One upstream process and the protocol session running over its stdio.
//!
//! ```text
//! starting ──first byte──▶ handshaking ──initialize ok──▶ connected
//!     │                        │                            │
//!     └────── timeout ─────────┴──────── process exit ──────┴──▶ failed
//!                                                           │
//!                                               close() ──▶ closing ──▶ closed
//! ```
//!
//! Three tasks run per connection: a writer draining an outbound queue into
//! stdin, a reader decoding stdout frames, and a drain that logs stderr.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Value, json};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use skillflow_config::{ServerEntry, Timeouts, UpstreamConfig};
use skillflow_core::{FlowError, PromptDescriptor, ResourceDescriptor, Result, ToolDescriptor};

use crate::framing::{Frame, FrameReader, encode};
use crate::handlers::{HandlerTable, SamplingHandler};
use crate::jsonrpc::{INVALID_REQUEST, METHOD_NOT_FOUND, Message, PROTOCOL_VERSION, RequestId, RpcError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Starting,
    Handshaking,
    Connected,
    Closing,
    Closed,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Starting => "starting",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Everything needed to start one upstream.
#[derive(Clone)]
pub struct ConnectOptions {
    pub server_id: String,
    pub entry: ServerEntry,
    pub timeouts: Timeouts,
    pub client_name: String,
    pub client_version: String,
    pub handlers: HandlerTable,
}

impl ConnectOptions {
    pub fn from_config(
        server_id: &str,
        entry: &ServerEntry,
        upstream: &UpstreamConfig,
        sampling: Option<Arc<dyn SamplingHandler>>,
    ) -> Self {
        Self {
            server_id: server_id.to_string(),
            entry: entry.clone(),
            timeouts: upstream.timeouts_for(entry),
            client_name: upstream.client_name.clone(),
            client_version: upstream.client_version.clone(),
            handlers: HandlerTable::with_defaults(upstream.roots.clone(), sampling),
        }
    }
}

/// What the upstream told us about itself.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerSnapshot {
    pub protocol_version: String,
    pub server_info: Value,
    pub capabilities: Value,
    pub tools: Vec<ToolDescriptor>,
    pub prompts: Vec<PromptDescriptor>,
    pub resources: Vec<ResourceDescriptor>,
    pub resource_templates: Vec<ResourceDescriptor>,
}

type PendingCall = oneshot::Sender<Result<Value>>;

struct Shared {
    server_id: String,
    state: RwLock<ConnectionState>,
    pending: DashMap<i64, PendingCall>,
    outbound: mpsc::UnboundedSender<String>,
    tasks: CancellationToken,
    shutting_down: AtomicBool,
    child: tokio::sync::Mutex<Option<Child>>,
    shutdown_grace: Duration,
    exit_reason: Mutex<Option<String>>,
    term_signals: AtomicUsize,
}

impl Shared {
    fn connection_error(&self, reason: impl Into<String>) -> FlowError {
        FlowError::Connection {
            server: self.server_id.clone(),
            reason: reason.into(),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.write();
        if *current != state {
            debug!(server = %self.server_id, from = %*current, to = %state, "connection state");
            *current = state;
        }
    }

    fn send_frame(&self, message: &Message) -> Result<()> {
        self.outbound
            .send(encode(message))
            .map_err(|_| self.connection_error("connection closed"))
    }

    fn dispatch(self: &Arc<Self>, message: Message, handlers: &HandlerTable) {
        match message {
            Message::Response {
                id: Some(RequestId::Number(id)),
                outcome,
            } => match self.pending.remove(&id) {
                Some((_, tx)) => {
                    let result = outcome.map_err(|e| FlowError::Protocol {
                        server: self.server_id.clone(),
                        code: e.code,
                        message: e.message,
                    });
                    let _ = tx.send(result);
                }
                None => debug!(server = %self.server_id, id, "response for unknown or expired request"),
            },
            Message::Response { id, .. } => {
                debug!(server = %self.server_id, ?id, "response with an id we never issued");
            }
            Message::Request { id: None, method, .. } => {
                warn!(server = %self.server_id, %method, "server request with null id");
                let reply = Message::response(
                    None,
                    Err(RpcError::new(INVALID_REQUEST, "request id must not be null")),
                );
                let _ = self.send_frame(&reply);
            }
            Message::Request {
                id: Some(id),
                method,
                params,
            } => {
                let Some(handler) = handlers.get(&method) else {
                    debug!(server = %self.server_id, %method, "unknown server request");
                    let reply = Message::response(
                        Some(id),
                        Err(RpcError::new(METHOD_NOT_FOUND, format!("method not found: {method}"))),
                    );
                    let _ = self.send_frame(&reply);
                    return;
                };
                let shared = Arc::clone(self);
                tokio::spawn(async move {
                    let outcome = handler.handle(params).await;
                    if let Err(e) = &outcome {
                        warn!(server = %shared.server_id, %method, error = %e, "server request handler failed");
                    }
                    let _ = shared.send_frame(&Message::response(Some(id), outcome));
                });
            }
            Message::Notification { method, params } => self.on_notification(&method, &params),
        }
    }

    fn on_notification(&self, method: &str, params: &Value) {
        if method != "notifications/message" {
            debug!(server = %self.server_id, %method, "notification");
            return;
        }
        let level = params["level"].as_str().unwrap_or("info");
        let logger = params["logger"].as_str().unwrap_or_default();
        let data = match &params["data"] {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let server = &self.server_id;
        match level {
            "debug" => debug!(server = %server, logger, "{data}"),
            "warning" => warn!(server = %server, logger, "{data}"),
            "error" | "critical" | "alert" | "emergency" => error!(server = %server, logger, "{data}"),
            _ => info!(server = %server, logger, "{data}"),
        }
    }

    /// Tear down tasks, pending calls and the process. Runs once; later
    /// calls return immediately.
    async fn shutdown(&self, final_state: ConnectionState, reason: Option<String>) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if final_state == ConnectionState::Closed {
            self.set_state(ConnectionState::Closing);
        }
        self.tasks.cancel();

        let message = match &reason {
            Some(r) => format!("connection closed: {r}"),
            None => "connection closed".to_string(),
        };
        let ids: Vec<i64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(self.connection_error(message.clone())));
            }
        }

        if let Some(mut child) = self.child.lock().await.take() {
            if matches!(child.try_wait(), Ok(None)) {
                self.terminate(&mut child);
                if tokio::time::timeout(self.shutdown_grace, child.wait()).await.is_err() {
                    warn!(server = %self.server_id, "upstream ignored SIGTERM, killing");
                    let _ = child.kill().await;
                }
            }
        }

        *self.exit_reason.lock() = reason;
        self.set_state(final_state);
        info!(server = %self.server_id, state = %final_state, "upstream stopped");
    }

    #[cfg(unix)]
    fn terminate(&self, child: &mut Child) {
        if let Some(pid) = child.id() {
            // SAFETY: pid belongs to a child we spawned and have not reaped.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            self.term_signals.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self, child: &mut Child) {
        let _ = child.start_kill();
        self.term_signals.fetch_add(1, Ordering::SeqCst);
    }
}

/// A live protocol session with one upstream.
pub struct Connection {
    shared: Arc<Shared>,
    next_id: AtomicI64,
    timeouts: Timeouts,
    pid: Option<u32>,
    snapshot: RwLock<ServerSnapshot>,
}

impl Connection {
    /// Spawn the upstream, run the handshake and fetch its catalogues.
    pub async fn connect(opts: ConnectOptions) -> Result<Arc<Self>> {
        let ConnectOptions {
            server_id,
            entry,
            timeouts,
            client_name,
            client_version,
            handlers,
        } = opts;

        info!(server = %server_id, command = %entry.command, args = ?entry.args, "starting upstream");
        let spawn_err = |reason: String| FlowError::Connection {
            server: server_id.clone(),
            reason,
        };

        let mut cmd = Command::new(&entry.command);
        cmd.args(&entry.args)
            .envs(&entry.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &entry.cwd {
            cmd.current_dir(cwd);
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| spawn_err(format!("failed to spawn '{}': {e}", entry.command)))?;

        let stdin = child.stdin.take().ok_or_else(|| spawn_err("stdin not piped".into()))?;
        let stdout = child.stdout.take().ok_or_else(|| spawn_err("stdout not piped".into()))?;
        let stderr = child.stderr.take().ok_or_else(|| spawn_err("stderr not piped".into()))?;
        let pid = child.id();

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            server_id: server_id.clone(),
            state: RwLock::new(ConnectionState::Starting),
            pending: DashMap::new(),
            outbound,
            tasks: CancellationToken::new(),
            shutting_down: AtomicBool::new(false),
            child: tokio::sync::Mutex::new(Some(child)),
            shutdown_grace: timeouts.shutdown_grace,
            exit_reason: Mutex::new(None),
            term_signals: AtomicUsize::new(0),
        });

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(write_loop(Arc::clone(&shared), stdin, outbound_rx));
        tokio::spawn(stderr_loop(Arc::clone(&shared), stderr));
        tokio::spawn(read_loop(Arc::clone(&shared), stdout, handlers, ready_tx));

        let conn = Arc::new(Self {
            shared,
            next_id: AtomicI64::new(1),
            timeouts,
            pid,
            snapshot: RwLock::new(ServerSnapshot::default()),
        });

        match conn.handshake(ready_rx, &client_name, &client_version).await {
            Ok(()) => Ok(conn),
            Err(e) => {
                warn!(server = %server_id, error = %e, "upstream failed to start");
                conn.shared.shutdown(ConnectionState::Failed, Some(e.to_string())).await;
                Err(e)
            }
        }
    }

    async fn handshake(
        &self,
        ready: oneshot::Receiver<()>,
        client_name: &str,
        client_version: &str,
    ) -> Result<()> {
        let sent_at = tokio::time::Instant::now();
        let (id, rx) = self.register()?;
        self.shared.send_frame(&Message::request(
            id,
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "roots": { "listChanged": true }, "sampling": {} },
                "clientInfo": { "name": client_name, "version": client_version },
            }),
        ))?;

        match tokio::time::timeout(self.timeouts.start, ready).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                let reason = self.shared.exit_reason.lock().clone();
                return Err(self.shared.connection_error(
                    reason.unwrap_or_else(|| "process exited before producing output".into()),
                ));
            }
            Err(_) => {
                return Err(self.shared.connection_error(format!(
                    "no output within start timeout of {}ms",
                    self.timeouts.start.as_millis()
                )));
            }
        }

        self.shared.set_state(ConnectionState::Handshaking);
        let result = match tokio::time::timeout_at(sent_at + self.timeouts.handshake, rx).await {
            Ok(Ok(Ok(v))) => v,
            Ok(Ok(Err(e))) => {
                return Err(self.shared.connection_error(format!("initialize rejected: {e}")));
            }
            Ok(Err(_)) => return Err(self.shared.connection_error("closed during handshake")),
            Err(_) => {
                self.shared.pending.remove(&id);
                return Err(self.shared.connection_error(format!(
                    "handshake timed out after {}ms",
                    self.timeouts.handshake.as_millis()
                )));
            }
        };

        let Value::Object(init) = result else {
            return Err(self.shared.connection_error("malformed initialize result"));
        };
        let capabilities = init.get("capabilities").cloned().unwrap_or_else(|| json!({}));
        if !capabilities.is_object() {
            return Err(self.shared.connection_error("malformed capabilities in initialize result"));
        }
        {
            let mut snap = self.snapshot.write();
            snap.protocol_version = init
                .get("protocolVersion")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            snap.server_info = init.get("serverInfo").cloned().unwrap_or(Value::Null);
            snap.capabilities = capabilities.clone();
        }

        self.notify("notifications/initialized", Value::Null)?;
        self.shared.set_state(ConnectionState::Connected);
        info!(
            server = %self.shared.server_id,
            pid = ?self.pid,
            capabilities = ?capabilities.as_object().map(|c| c.keys().cloned().collect::<Vec<_>>()),
            "upstream connected"
        );

        self.fetch_catalogues(&capabilities).await;
        Ok(())
    }

    async fn fetch_catalogues(&self, capabilities: &Value) {
        let has = |key: &str| capabilities.get(key).is_some_and(|v| !v.is_null());
        let none = CancellationToken::new();

        if has("tools") {
            match self.list("tools/list", "tools", &none).await {
                Ok(tools) => self.snapshot.write().tools = tools,
                Err(e) => warn!(server = %self.shared.server_id, error = %e, "failed to list tools"),
            }
        }
        if has("prompts") {
            match self.list("prompts/list", "prompts", &none).await {
                Ok(prompts) => self.snapshot.write().prompts = prompts,
                Err(e) => warn!(server = %self.shared.server_id, error = %e, "failed to list prompts"),
            }
        }
        if has("resources") {
            match self.list("resources/list", "resources", &none).await {
                Ok(resources) => self.snapshot.write().resources = resources,
                Err(e) => warn!(server = %self.shared.server_id, error = %e, "failed to list resources"),
            }
            match self.list("resources/templates/list", "resourceTemplates", &none).await {
                Ok(templates) => self.snapshot.write().resource_templates = templates,
                Err(e) => debug!(server = %self.shared.server_id, error = %e, "no resource templates"),
            }
        }

        let snap = self.snapshot.read();
        info!(
            server = %self.shared.server_id,
            tools = snap.tools.len(),
            prompts = snap.prompts.len(),
            resources = snap.resources.len(),
            "catalogues loaded"
        );
    }

    async fn list<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<T>> {
        let result = self.request(method, Value::Null, self.timeouts.call, cancel).await?;
        let items = match result.get(key) {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        };
        Ok(items
            .into_iter()
            .filter_map(|item| match serde_json::from_value(item) {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!(server = %self.shared.server_id, %method, error = %e, "skipping malformed entry");
                    None
                }
            })
            .collect())
    }

    fn register(&self) -> Result<(i64, oneshot::Receiver<Result<Value>>)> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(id, tx);
        // Shutdown may have drained the map between the caller's state check
        // and the insert above.
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            self.shared.pending.remove(&id);
            return Err(self.shared.connection_error("connection closed"));
        }
        Ok((id, rx))
    }

    /// Send a request and wait for its response.
    ///
    /// On timeout the pending entry is evicted and the connection stays up.
    /// On cancellation the upstream is told via `notifications/cancelled`.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(self.shared.connection_error(format!("connection is {state}")));
        }
        let (id, rx) = self.register()?;
        if let Err(e) = self.shared.send_frame(&Message::request(id, method, params)) {
            self.shared.pending.remove(&id);
            return Err(e);
        }

        tokio::select! {
            res = rx => match res {
                Ok(outcome) => outcome,
                Err(_) => Err(self.shared.connection_error("connection closed")),
            },
            _ = tokio::time::sleep(timeout) => {
                self.shared.pending.remove(&id);
                warn!(server = %self.shared.server_id, %method, id, "call timed out");
                Err(FlowError::CallTimeout {
                    server: self.shared.server_id.clone(),
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            _ = cancel.cancelled() => {
                self.shared.pending.remove(&id);
                let _ = self.notify(
                    "notifications/cancelled",
                    json!({ "requestId": id, "reason": "cancelled by client" }),
                );
                debug!(server = %self.shared.server_id, %method, id, "call cancelled");
                Err(FlowError::Cancelled(format!("{method} on {}", self.shared.server_id)))
            }
        }
    }

    pub fn notify(&self, method: &str, params: Value) -> Result<()> {
        self.shared.send_frame(&Message::notification(method, params))
    }

    /// Raw `tools/call` result (`content`, `isError`, `structuredContent`).
    pub async fn call_tool(&self, name: &str, args: Value, cancel: &CancellationToken) -> Result<Value> {
        self.request(
            "tools/call",
            json!({ "name": name, "arguments": args }),
            self.timeouts.call,
            cancel,
        )
        .await
    }

    pub async fn get_prompt(&self, name: &str, args: Value) -> Result<Value> {
        let args = if args.is_null() { json!({}) } else { args };
        self.request(
            "prompts/get",
            json!({ "name": name, "arguments": args }),
            self.timeouts.call,
            &CancellationToken::new(),
        )
        .await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<Value> {
        self.request(
            "resources/read",
            json!({ "uri": uri }),
            self.timeouts.call,
            &CancellationToken::new(),
        )
        .await
    }

    pub async fn ping(&self) -> Result<()> {
        self.request("ping", Value::Null, self.timeouts.call, &CancellationToken::new())
            .await
            .map(|_| ())
    }

    /// Re-fetch `tools/list`.
    pub async fn refresh_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let tools: Vec<ToolDescriptor> =
            self.list("tools/list", "tools", &CancellationToken::new()).await?;
        self.snapshot.write().tools = tools.clone();
        Ok(tools)
    }

    /// Close the session. Safe to call any number of times.
    pub async fn close(&self) {
        self.shared.shutdown(ConnectionState::Closed, None).await;
    }

    pub fn server_id(&self) -> &str {
        &self.shared.server_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn snapshot(&self) -> ServerSnapshot {
        self.snapshot.read().clone()
    }

    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.snapshot.read().tools.clone()
    }

    pub fn prompts(&self) -> Vec<PromptDescriptor> {
        self.snapshot.read().prompts.clone()
    }

    pub fn resources(&self) -> Vec<ResourceDescriptor> {
        self.snapshot.read().resources.clone()
    }

    pub fn resource_templates(&self) -> Vec<ResourceDescriptor> {
        self.snapshot.read().resource_templates.clone()
    }

    /// Number of in-flight requests.
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }

    /// Why the session ended, if it has.
    pub fn exit_reason(&self) -> Option<String> {
        self.shared.exit_reason.lock().clone()
    }

    /// Termination signals sent to the process so far.
    pub fn termination_signals(&self) -> usize {
        self.shared.term_signals.load(Ordering::SeqCst)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Lets the tasks release the process, which is killed on drop.
        self.shared.tasks.cancel();
    }
}

async fn write_loop(shared: Arc<Shared>, mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<String>) {
    loop {
        let line = tokio::select! {
            _ = shared.tasks.cancelled() => break,
            line = rx.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!(server = %shared.server_id, error = %e, "write to upstream failed");
            break;
        }
    }
}

async fn stderr_loop(shared: Arc<Shared>, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        tokio::select! {
            _ = shared.tasks.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        warn!(server = %shared.server_id, "stderr: {line}");
                    }
                }
                Ok(None) | Err(_) => break,
            },
        }
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    stdout: ChildStdout,
    handlers: HandlerTable,
    ready: oneshot::Sender<()>,
) {
    let mut frames = FrameReader::new(stdout);

    let first = tokio::select! {
        _ = shared.tasks.cancelled() => return,
        r = frames.wait_readable() => r,
    };
    let reason = match first {
        Ok(true) => {
            let _ = ready.send(());
            read_frames(&shared, &mut frames, &handlers).await
        }
        Ok(false) => {
            *shared.exit_reason.lock() = Some("process exited before producing output".into());
            drop(ready);
            Some("process exited before producing output".to_string())
        }
        Err(e) => {
            drop(ready);
            Some(format!("stdout read failed: {e}"))
        }
    };

    if let Some(reason) = reason {
        if !shared.shutting_down.load(Ordering::SeqCst) {
            warn!(server = %shared.server_id, %reason, "upstream went away");
        }
        shared.shutdown(ConnectionState::Failed, Some(reason)).await;
    }
}

/// Returns the reason the stream ended, or `None` when cancelled.
async fn read_frames(
    shared: &Arc<Shared>,
    frames: &mut FrameReader<ChildStdout>,
    handlers: &HandlerTable,
) -> Option<String> {
    loop {
        let next = tokio::select! {
            _ = shared.tasks.cancelled() => return None,
            next = frames.next() => next,
        };
        match next {
            Ok(Some(Frame::Message(message))) => shared.dispatch(message, handlers),
            Ok(Some(Frame::Malformed { line, reason })) => {
                warn!(server = %shared.server_id, %reason, %line, "dropping malformed frame");
            }
            Ok(None) => return Some("process closed stdout".into()),
            Err(e) => return Some(format!("stdout read failed: {e}")),
        }
    }
}
