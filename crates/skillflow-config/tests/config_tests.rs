#[cfg(test)]
mod tests {
    use skillflow_config::ConfigLoader;
    use skillflow_config::schema::*;
    use std::io::Write;
    use std::time::Duration;

    // ── Default tests ──────────────────────────────────────────

    #[test]
    fn test_flow_config_defaults() {
        let config = FlowConfig::default();
        assert_eq!(config.engine.max_parallel, 8);
        assert_eq!(config.engine.max_skill_depth, 8);
        assert_eq!(config.engine.cancel_grace_ms, 1_000);
        assert_eq!(config.engine.retained_runs, 256);
        assert!(config.servers.is_empty());
    }

    #[test]
    fn test_upstream_config_defaults() {
        let config = UpstreamConfig::default();
        assert_eq!(config.start_timeout_ms, 10_000);
        assert_eq!(config.handshake_timeout_ms, 30_000);
        assert_eq!(config.call_timeout_ms, 60_000);
        assert_eq!(config.registry_timeout_ms, 120_000);
        assert_eq!(config.shutdown_grace_ms, 5_000);
        assert_eq!(config.client_name, "skillflow");
    }

    #[test]
    fn test_logging_config_defaults() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, "pretty");
    }

    #[test]
    fn test_storage_dirs() {
        let storage = StorageConfig {
            data_dir: "/tmp/sf".into(),
        };
        assert_eq!(storage.skills_dir(), std::path::PathBuf::from("/tmp/sf/skills"));
        assert_eq!(storage.runs_dir(), std::path::PathBuf::from("/tmp/sf/runs"));
    }

    // ── TOML tests ─────────────────────────────────────────────

    #[test]
    fn test_config_toml_roundtrip() {
        let mut config = FlowConfig::default();
        config
            .servers
            .insert("fetch".into(), ServerEntry::new("uvx", vec!["mcp-server-fetch".into()]));
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let restored: FlowConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(restored.engine.max_parallel, config.engine.max_parallel);
        assert_eq!(restored.servers["fetch"].command, "uvx");
    }

    #[test]
    fn test_partial_toml_applies_defaults() {
        let toml_str = r#"
[engine]
max_parallel = 3

[servers.files]
command = "mcp-files"
args = ["--root", "/srv"]
call_timeout_ms = 500
"#;
        let config: FlowConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.max_parallel, 3);
        assert_eq!(config.engine.max_skill_depth, 8);
        let files = &config.servers["files"];
        assert!(files.enabled);
        assert_eq!(files.args, vec!["--root", "/srv"]);

        let t = config.upstream.timeouts_for(files);
        assert_eq!(t.call, Duration::from_millis(500));
        assert_eq!(t.start, Duration::from_millis(10_000));
    }

    #[test]
    fn test_disabled_server_filtered() {
        let toml_str = r#"
[servers.a]
command = "a"

[servers.b]
command = "b"
enabled = false
"#;
        let config: FlowConfig = toml::from_str(toml_str).unwrap();
        let ids: Vec<&String> = config.enabled_servers().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["a"]);
    }

    // ── Validation tests ───────────────────────────────────────

    #[test]
    fn test_default_config_is_valid() {
        let warnings = FlowConfig::default().validate().unwrap();
        assert!(warnings.iter().all(|w| w.severity != WarningSeverity::Error));
    }

    #[test]
    fn test_zero_max_parallel_is_error() {
        let mut config = FlowConfig::default();
        config.engine.max_parallel = 0;
        let err = config.validate().unwrap_err();
        assert!(err.contains("engine.max_parallel"));
    }

    #[test]
    fn test_empty_server_command_is_error() {
        let mut config = FlowConfig::default();
        config.servers.insert("broken".into(), ServerEntry::default());
        let err = config.validate().unwrap_err();
        assert!(err.contains("servers.broken.command"));
    }

    #[test]
    fn test_short_handshake_is_warning() {
        let mut config = FlowConfig::default();
        config.upstream.handshake_timeout_ms = 1_000;
        let warnings = config.validate().unwrap();
        assert!(warnings
            .iter()
            .any(|w| w.field == "upstream.handshake_timeout_ms" && w.severity == WarningSeverity::Warning));
    }

    #[test]
    fn test_warning_display_has_hint() {
        let w = ConfigWarning {
            field: "logging.level".into(),
            message: "unknown".into(),
            severity: WarningSeverity::Warning,
            hint: Some("use info".into()),
        };
        let s = w.to_string();
        assert!(s.contains("logging.level"));
        assert!(s.contains("use info"));
    }

    // ── ConfigLoader tests ─────────────────────────────────────

    #[test]
    fn test_config_loader_with_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("skillflow.toml");
        let mut f = std::fs::File::create(&config_path).unwrap();
        writeln!(
            f,
            r#"
[upstream]
start_timeout_ms = 2000
handshake_timeout_ms = 4000
roots = ["/work"]

[servers.fetch]
command = "mcp-fetch"
name = "Fetcher"

[storage]
data_dir = "/tmp/skillflow-data"
"#
        )
        .unwrap();

        let loader = ConfigLoader::load(Some(config_path.as_path())).unwrap();
        let config = loader.get();
        assert_eq!(config.upstream.start_timeout_ms, 2000);
        assert_eq!(config.upstream.roots, vec![std::path::PathBuf::from("/work")]);
        assert_eq!(config.servers["fetch"].name.as_deref(), Some("Fetcher"));
        assert_eq!(loader.path(), config_path.as_path());
    }

    #[test]
    fn test_config_loader_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("skillflow.toml");
        std::fs::write(&config_path, "[engine]\nmax_parallel = 0\n").unwrap();
        assert!(ConfigLoader::load(Some(config_path.as_path())).is_err());
    }

    #[test]
    fn test_config_loader_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("skillflow.toml");
        std::fs::write(&config_path, "[engine\nmax_parallel = ").unwrap();
        let err = ConfigLoader::load(Some(config_path.as_path())).err().unwrap();
        assert_eq!(err.kind(), "config_error");
    }

    #[test]
    fn test_config_loader_reload() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("skillflow.toml");

        std::fs::write(&config_path, "[engine]\nmax_skill_depth = 2\n").unwrap();
        let loader = ConfigLoader::load(Some(config_path.as_path())).unwrap();
        assert_eq!(loader.get().engine.max_skill_depth, 2);

        std::fs::write(&config_path, "[engine]\nmax_skill_depth = 5\n").unwrap();
        loader.reload().unwrap();
        assert_eq!(loader.get().engine.max_skill_depth, 5);

        // An invalid edit keeps the previous config.
        std::fs::write(&config_path, "[engine]\nmax_parallel = 0\n").unwrap();
        assert!(loader.reload().is_err());
        assert_eq!(loader.get().engine.max_skill_depth, 5);
    }

    #[test]
    fn test_from_config_snapshot() {
        let mut config = FlowConfig::default();
        config.engine.max_parallel = 2;
        let loader = ConfigLoader::from_config(config);
        assert_eq!(loader.shared().read().engine.max_parallel, 2);
    }

    // ── JSON roundtrip ─────────────────────────────────────────

    #[test]
    fn test_config_json_roundtrip() {
        let config = FlowConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let restored: FlowConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.upstream.call_timeout_ms, config.upstream.call_timeout_ms);
    }
}
