#[cfg(test)]
mod tests {
    use serde_json::{Value, json};
    use skillflow_config::{ServerEntry, Timeouts, UpstreamConfig};
    use skillflow_core::{EventBus, FlowError, RunEvent, ToolInvoker};
    use skillflow_mcp::{ConnectOptions, Connection, ConnectionRegistry, ConnectionState, HandlerTable, tool_output};
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tokio_util::sync::CancellationToken;

    const MOCK: &str = env!("CARGO_BIN_EXE_skillflow-mock-upstream");

    fn entry(flags: &[&str]) -> ServerEntry {
        ServerEntry::new(MOCK, flags.iter().map(|s| s.to_string()).collect())
    }

    fn timeouts(start_ms: u64, handshake_ms: u64, call_ms: u64) -> Timeouts {
        Timeouts {
            start: Duration::from_millis(start_ms),
            handshake: Duration::from_millis(handshake_ms),
            call: Duration::from_millis(call_ms),
            shutdown_grace: Duration::from_millis(500),
        }
    }

    fn options(flags: &[&str], t: Timeouts) -> ConnectOptions {
        ConnectOptions {
            server_id: "mock".into(),
            entry: entry(flags),
            timeouts: t,
            client_name: "skillflow-tests".into(),
            client_version: "0.0.0".into(),
            handlers: HandlerTable::with_defaults(vec![PathBuf::from("/srv/data")], None),
        }
    }

    async fn connect(flags: &[&str]) -> Arc<Connection> {
        Connection::connect(options(flags, timeouts(5_000, 5_000, 5_000)))
            .await
            .unwrap()
    }

    async fn call(conn: &Connection, tool: &str, args: Value) -> skillflow_core::Result<Value> {
        let raw = conn.call_tool(tool, args, &CancellationToken::new()).await?;
        tool_output(tool, raw)
    }

    async fn wait_for_state(conn: &Connection, want: ConnectionState) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while conn.state() != want {
            assert!(Instant::now() < deadline, "state stuck at {}", conn.state());
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    // ── Handshake ──────────────────────────────────────────────

    mod handshake {
        use super::*;

        #[tokio::test]
        async fn test_connect_loads_catalogues() {
            let conn = connect(&[]).await;
            assert_eq!(conn.state(), ConnectionState::Connected);
            assert!(conn.pid().is_some());

            let snap = conn.snapshot();
            assert_eq!(snap.protocol_version, "2024-11-05");
            assert_eq!(snap.server_info["name"], "mock-upstream");

            let tools: Vec<String> = conn.tools().into_iter().map(|t| t.name).collect();
            assert!(tools.contains(&"echo".to_string()));
            assert!(tools.contains(&"sleep".to_string()));
            assert_eq!(conn.prompts()[0].name, "greet");
            assert_eq!(conn.resources()[0].uri, "mem://notes");
            assert_eq!(conn.resource_templates()[0].uri, "mem://{key}");
            conn.close().await;
        }

        #[tokio::test]
        async fn test_bare_server_has_empty_catalogues() {
            let conn = connect(&["--bare"]).await;
            assert!(conn.is_connected());
            assert!(conn.tools().is_empty());
            assert!(conn.prompts().is_empty());
            conn.close().await;
        }

        #[tokio::test]
        async fn test_silent_process_hits_start_timeout() {
            let started = Instant::now();
            let err = Connection::connect(options(&["--silent"], timeouts(300, 5_000, 5_000)))
                .await
                .err()
                .unwrap();
            let elapsed = started.elapsed();
            assert!(matches!(err, FlowError::Connection { .. }), "{err:?}");
            assert!(err.to_string().contains("start timeout"), "{err}");
            assert!(elapsed >= Duration::from_millis(300));
            assert!(elapsed < Duration::from_secs(5));
        }

        #[tokio::test]
        async fn test_stalled_initialize_hits_handshake_timeout() {
            let err = Connection::connect(options(&["--stall-handshake"], timeouts(5_000, 400, 5_000)))
                .await
                .err()
                .unwrap();
            assert!(err.to_string().contains("handshake timed out"), "{err}");
        }

        #[tokio::test]
        async fn test_missing_binary_is_connection_error() {
            let mut opts = options(&[], timeouts(500, 500, 500));
            opts.entry = ServerEntry::new("/definitely/not/a/binary", vec![]);
            let err = Connection::connect(opts).await.err().unwrap();
            assert_eq!(err.kind(), "connection_error");
        }

        #[tokio::test]
        async fn test_malformed_frames_are_dropped() {
            let conn = connect(&["--garbage"]).await;
            let out = call(&conn, "echo", json!({"text": "still works"})).await.unwrap();
            assert_eq!(out, json!({"text": "still works"}));
            conn.close().await;
        }

        #[tokio::test]
        async fn test_invalid_utf8_lines_are_dropped() {
            let conn = connect(&["--invalid-utf8"]).await;
            for text in ["first", "second"] {
                let out = call(&conn, "echo", json!({"text": text})).await.unwrap();
                assert_eq!(out, json!({"text": text}));
            }
            assert_eq!(conn.state(), ConnectionState::Connected);
            conn.close().await;
        }
    }

    // ── Calls ──────────────────────────────────────────────────

    mod calls {
        use super::*;

        #[tokio::test]
        async fn test_echo_and_add() {
            let conn = connect(&[]).await;
            assert_eq!(call(&conn, "echo", json!({"a": [1, 2]})).await.unwrap(), json!({"a": [1, 2]}));
            assert_eq!(call(&conn, "add", json!({"a": 2, "b": 3.5})).await.unwrap()["sum"], 5.5);
            assert_eq!(conn.pending_calls(), 0);
            conn.ping().await.unwrap();
            conn.close().await;
        }

        #[tokio::test]
        async fn test_prompt_and_resource() {
            let conn = connect(&[]).await;
            let prompt = conn.get_prompt("greet", json!({"who": "Ada"})).await.unwrap();
            assert_eq!(prompt["messages"][0]["content"]["text"], "Hello, Ada!");
            let res = conn.read_resource("mem://notes").await.unwrap();
            assert_eq!(res["contents"][0]["text"], "remember the milk");
            conn.close().await;
        }

        #[tokio::test]
        async fn test_is_error_result_becomes_tool_error() {
            let conn = connect(&[]).await;
            let err = call(&conn, "fail", json!({"message": "nope"})).await.unwrap_err();
            assert!(matches!(&err, FlowError::Tool { reason, .. } if reason == "nope"), "{err:?}");
            assert!(conn.is_connected());
            conn.close().await;
        }

        #[tokio::test]
        async fn test_unknown_tool_is_protocol_error() {
            let conn = connect(&[]).await;
            let err = call(&conn, "no_such_tool", json!({})).await.unwrap_err();
            assert!(matches!(err, FlowError::Protocol { code: -32602, .. }), "{err:?}");
            conn.close().await;
        }

        #[tokio::test]
        async fn test_call_timeout_keeps_connection() {
            let conn = Connection::connect(options(&[], timeouts(5_000, 5_000, 300))).await.unwrap();
            let err = call(&conn, "sleep", json!({"ms": 1_500})).await.unwrap_err();
            assert!(matches!(err, FlowError::CallTimeout { timeout_ms: 300, .. }), "{err:?}");
            assert_eq!(conn.pending_calls(), 0);

            assert!(conn.is_connected());
            assert_eq!(call(&conn, "echo", json!({"x": 1})).await.unwrap(), json!({"x": 1}));
            conn.close().await;
        }

        #[tokio::test]
        async fn test_cancel_notifies_upstream() {
            let conn = connect(&[]).await;
            let token = CancellationToken::new();
            let trigger = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                trigger.cancel();
            });

            let err = conn.call_tool("sleep", json!({"ms": 3_000}), &token).await.unwrap_err();
            assert_eq!(err.kind(), "cancelled");
            assert_eq!(conn.pending_calls(), 0);

            let stats = call(&conn, "stats", json!({})).await.unwrap();
            let cancelled = stats["cancelled"].as_array().unwrap();
            assert_eq!(cancelled.len(), 1);
            assert!(cancelled[0].is_number());
            conn.close().await;
        }

        #[tokio::test]
        async fn test_concurrent_calls_are_correlated() {
            let conn = connect(&[]).await;
            let mut handles = Vec::new();
            for i in 0..8 {
                let conn = Arc::clone(&conn);
                handles.push(tokio::spawn(async move {
                    let ms = 80 - i * 10;
                    let out = call(&conn, "sleep", json!({"ms": ms})).await.unwrap();
                    (ms, out["slept_ms"].as_u64().unwrap())
                }));
            }
            for h in handles {
                let (sent, got) = h.await.unwrap();
                assert_eq!(sent, got);
            }
            conn.close().await;
        }
    }

    // ── Server-initiated requests ──────────────────────────────

    mod server_requests {
        use super::*;

        #[tokio::test]
        async fn test_roots_list_is_answered() {
            let conn = connect(&[]).await;
            let out = call(&conn, "roots", json!({})).await.unwrap();
            assert_eq!(
                out["result"]["roots"],
                json!([{"uri": "file:///srv/data", "name": "data"}])
            );
            conn.close().await;
        }

        #[tokio::test]
        async fn test_unknown_method_gets_method_not_found() {
            let conn = connect(&[]).await;
            let out = call(&conn, "unknown_method", json!({})).await.unwrap();
            assert_eq!(out["error"]["code"], -32601);
            conn.close().await;
        }

        #[tokio::test]
        async fn test_null_id_gets_invalid_request() {
            let conn = connect(&[]).await;
            let out = call(&conn, "null_id", json!({})).await.unwrap();
            assert_eq!(out["error"]["code"], -32600);
            conn.close().await;
        }

        #[tokio::test]
        async fn test_log_notifications_do_not_disturb_calls() {
            let conn = connect(&[]).await;
            let out = call(&conn, "log", json!({"level": "warning", "data": "careful"})).await.unwrap();
            assert_eq!(out["logged"], true);
            assert!(conn.is_connected());
            conn.close().await;
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────

    mod lifecycle {
        use super::*;

        #[tokio::test]
        async fn test_process_exit_fails_pending_call() {
            let conn = connect(&[]).await;
            let err = call(&conn, "exit", json!({"code": 4})).await.unwrap_err();
            assert_eq!(err.kind(), "connection_error");
            wait_for_state(&conn, ConnectionState::Failed).await;
            assert!(conn.exit_reason().is_some());

            let err = call(&conn, "echo", json!({})).await.unwrap_err();
            assert_eq!(err.kind(), "connection_error");
        }

        #[tokio::test]
        async fn test_close_is_idempotent() {
            let conn = connect(&[]).await;
            conn.close().await;
            conn.close().await;
            assert_eq!(conn.state(), ConnectionState::Closed);
            assert_eq!(conn.termination_signals(), 1);
            assert_eq!(conn.pending_calls(), 0);
            assert!(call(&conn, "echo", json!({})).await.is_err());
        }

        #[tokio::test]
        async fn test_close_fails_in_flight_calls() {
            let conn = connect(&[]).await;
            let inflight = {
                let conn = Arc::clone(&conn);
                tokio::spawn(async move { call(&conn, "sleep", json!({"ms": 5_000})).await })
            };
            tokio::time::sleep(Duration::from_millis(100)).await;
            conn.close().await;
            let err = inflight.await.unwrap().unwrap_err();
            assert!(err.to_string().contains("connection closed"), "{err}");
        }
    }

    // ── Registry ───────────────────────────────────────────────

    mod registry {
        use super::*;

        fn registry(flags: &[&str]) -> ConnectionRegistry {
            let mut servers = BTreeMap::new();
            servers.insert("mock".to_string(), entry(flags));
            let upstream = UpstreamConfig {
                start_timeout_ms: 5_000,
                handshake_timeout_ms: 5_000,
                call_timeout_ms: 5_000,
                registry_timeout_ms: 10_000,
                shutdown_grace_ms: 500,
                ..UpstreamConfig::default()
            };
            ConnectionRegistry::new(upstream, servers)
        }

        async fn stats_pid(reg: &ConnectionRegistry) -> u64 {
            let stats = reg
                .call("mock", "stats", json!({}), CancellationToken::new())
                .await
                .unwrap();
            stats["pid"].as_u64().unwrap()
        }

        #[tokio::test]
        async fn test_lazy_connect_is_shared() {
            let reg = registry(&[]);
            assert!(reg.current("mock").is_none());

            let first = stats_pid(&reg).await;
            let second = stats_pid(&reg).await;
            assert_eq!(first, second);

            let conn = reg.current("mock").unwrap();
            assert_eq!(conn.pid().map(u64::from), Some(first));
            let listed = reg.list_servers();
            assert_eq!(listed[0].state, Some(ConnectionState::Connected));
            assert!(listed[0].tool_count > 0);
            reg.close_all().await;
        }

        #[tokio::test]
        async fn test_concurrent_first_calls_spawn_once() {
            let reg = Arc::new(registry(&[]));
            let mut handles = Vec::new();
            for _ in 0..4 {
                let reg = Arc::clone(&reg);
                handles.push(tokio::spawn(async move { stats_pid(&reg).await }));
            }
            let mut pids = Vec::new();
            for h in handles {
                pids.push(h.await.unwrap());
            }
            pids.dedup();
            assert_eq!(pids.len(), 1);
            reg.close_all().await;
        }

        #[tokio::test]
        async fn test_failed_connection_is_replaced() {
            let reg = registry(&[]);
            let before = stats_pid(&reg).await;

            let err = reg
                .call("mock", "exit", json!({}), CancellationToken::new())
                .await
                .unwrap_err();
            assert_eq!(err.kind(), "connection_error");
            let stale = reg.current("mock").unwrap();
            wait_for_state(&stale, ConnectionState::Failed).await;

            let after = stats_pid(&reg).await;
            assert_ne!(before, after);
            reg.close_all().await;
        }

        #[tokio::test]
        async fn test_tool_invoker_surface() {
            let reg = registry(&[]);
            let invoker: &dyn ToolInvoker = &reg;
            let out = invoker
                .invoke("mock", "echo", json!({"k": "v"}), CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(out, json!({"k": "v"}));
            assert!(invoker.tools("mock").await.unwrap().iter().any(|t| t.name == "add"));
            let err = invoker
                .invoke("ghost", "echo", json!({}), CancellationToken::new())
                .await
                .unwrap_err();
            assert_eq!(err.kind(), "server_not_found");
            reg.close_all().await;
        }

        #[tokio::test]
        async fn test_events_and_disconnect() {
            let bus = EventBus::new(16);
            let mut rx = bus.subscribe();
            let reg = registry(&[]).with_events(bus);

            assert_eq!(reg.list_prompts("mock").await.unwrap()[0].name, "greet");
            match rx.recv().await.unwrap() {
                RunEvent::UpstreamConnected { server_id, tool_count } => {
                    assert_eq!(server_id, "mock");
                    assert!(tool_count > 0);
                }
                other => panic!("unexpected {other:?}"),
            }

            reg.disconnect("mock").await;
            assert!(matches!(
                rx.recv().await.unwrap(),
                RunEvent::UpstreamDisconnected { .. }
            ));
            assert!(reg.current("mock").is_none());
        }

        #[tokio::test]
        async fn test_reregister_restarts_process() {
            let reg = registry(&[]);
            let before = stats_pid(&reg).await;
            reg.register_server("mock", entry(&["--name", "renamed"])).await;
            let after = stats_pid(&reg).await;
            assert_ne!(before, after);
            let conn = reg.current("mock").unwrap();
            assert_eq!(conn.snapshot().server_info["name"], "renamed");
            reg.close_all().await;
        }
    }
}
