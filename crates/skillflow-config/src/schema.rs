use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration, read from `skillflow.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub engine: EngineConfig,
    pub upstream: UpstreamConfig,
    pub servers: BTreeMap<String, ServerEntry>,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

// ── Engine ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Concurrency cap used when a skill's concurrency block omits `max_parallel`.
    pub max_parallel: usize,
    /// Maximum nesting depth of skill_call nodes.
    pub max_skill_depth: usize,
    /// How long an in-flight call may still complete after a run is cancelled.
    pub cancel_grace_ms: u64,
    /// Finished background runs kept for status queries; older ones are
    /// dropped from memory (their logs stay on disk).
    pub retained_runs: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel: 8,
            max_skill_depth: 8,
            cancel_grace_ms: 1_000,
            retained_runs: 256,
        }
    }
}

impl EngineConfig {
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

// ── Upstream ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Time allowed for a spawned process to produce its first output.
    pub start_timeout_ms: u64,
    /// Time allowed for the initialize response, measured from the request.
    pub handshake_timeout_ms: u64,
    /// Per-request deadline once connected.
    pub call_timeout_ms: u64,
    /// Outer deadline of one registry operation, including a lazy connect.
    pub registry_timeout_ms: u64,
    /// Grace period between SIGTERM and a forced kill on shutdown.
    pub shutdown_grace_ms: u64,
    /// Name reported in `clientInfo` during the handshake.
    pub client_name: String,
    pub client_version: String,
    /// Filesystem roots answered to `roots/list`.
    pub roots: Vec<PathBuf>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            start_timeout_ms: 10_000,
            handshake_timeout_ms: 30_000,
            call_timeout_ms: 60_000,
            registry_timeout_ms: 120_000,
            shutdown_grace_ms: 5_000,
            client_name: "skillflow".into(),
            client_version: env!("CARGO_PKG_VERSION").into(),
            roots: vec![],
        }
    }
}

/// One upstream endpoint, keyed by server id under `[servers]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerEntry {
    /// Executable to spawn.
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Working directory for the child process.
    pub cwd: Option<PathBuf>,
    pub enabled: bool,
    /// Human-readable label.
    pub name: Option<String>,
    pub start_timeout_ms: Option<u64>,
    pub handshake_timeout_ms: Option<u64>,
    pub call_timeout_ms: Option<u64>,
}

impl Default for ServerEntry {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: vec![],
            env: HashMap::new(),
            cwd: None,
            enabled: true,
            name: None,
            start_timeout_ms: None,
            handshake_timeout_ms: None,
            call_timeout_ms: None,
        }
    }
}

impl ServerEntry {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            ..Default::default()
        }
    }
}

/// Effective timeouts for one endpoint after per-server overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub start: Duration,
    pub handshake: Duration,
    pub call: Duration,
    pub shutdown_grace: Duration,
}

impl UpstreamConfig {
    pub fn timeouts_for(&self, entry: &ServerEntry) -> Timeouts {
        Timeouts {
            start: Duration::from_millis(entry.start_timeout_ms.unwrap_or(self.start_timeout_ms)),
            handshake: Duration::from_millis(
                entry.handshake_timeout_ms.unwrap_or(self.handshake_timeout_ms),
            ),
            call: Duration::from_millis(entry.call_timeout_ms.unwrap_or(self.call_timeout_ms)),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
        }
    }

    pub fn registry_timeout(&self) -> Duration {
        Duration::from_millis(self.registry_timeout_ms)
    }
}

// ── Storage ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of `skills/` and `runs/`.
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".skillflow")
                .join("data"),
        }
    }
}

impl StorageConfig {
    pub fn skills_dir(&self) -> PathBuf {
        self.data_dir.join("skills")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.data_dir.join("runs")
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty", "json", "compact".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A single validation finding.
#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let icon = match self.severity {
            WarningSeverity::Error => "❌",
            WarningSeverity::Warning => "⚠️ ",
            WarningSeverity::Info => "💡",
        };
        write!(f, "{} {}: {}", icon, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, "\n   ↳ {}", h)?;
        }
        Ok(())
    }
}

impl FlowConfig {
    /// Validate the config and return a list of warnings/errors.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        // ── Engine ───
        if self.engine.max_parallel == 0 {
            warnings.push(ConfigWarning {
                field: "engine.max_parallel".into(),
                message: "max_parallel is 0, no node could ever run".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 8".into()),
            });
        }
        if self.engine.max_skill_depth == 0 {
            warnings.push(ConfigWarning {
                field: "engine.max_skill_depth".into(),
                message: "max_skill_depth is 0, every skill_call node will fail".into(),
                severity: WarningSeverity::Warning,
                hint: Some("Set to e.g. 8 to allow nested skills".into()),
            });
        }

        // ── Upstream timeouts ───
        let timeouts = [
            ("upstream.start_timeout_ms", self.upstream.start_timeout_ms),
            ("upstream.handshake_timeout_ms", self.upstream.handshake_timeout_ms),
            ("upstream.call_timeout_ms", self.upstream.call_timeout_ms),
            ("upstream.registry_timeout_ms", self.upstream.registry_timeout_ms),
        ];
        for (field, value) in timeouts {
            if value == 0 {
                warnings.push(ConfigWarning {
                    field: field.into(),
                    message: "timeout is 0, every operation would time out".into(),
                    severity: WarningSeverity::Error,
                    hint: None,
                });
            }
        }
        if self.upstream.handshake_timeout_ms < self.upstream.start_timeout_ms {
            warnings.push(ConfigWarning {
                field: "upstream.handshake_timeout_ms".into(),
                message: format!(
                    "handshake timeout ({}ms) is shorter than start timeout ({}ms)",
                    self.upstream.handshake_timeout_ms, self.upstream.start_timeout_ms
                ),
                severity: WarningSeverity::Warning,
                hint: Some("The handshake covers the start window; make it the longer of the two".into()),
            });
        }
        if self.upstream.registry_timeout_ms < self.upstream.call_timeout_ms {
            warnings.push(ConfigWarning {
                field: "upstream.registry_timeout_ms".into(),
                message: "registry timeout is shorter than the per-call timeout".into(),
                severity: WarningSeverity::Info,
                hint: Some("Calls will be cut off by the registry before the client gives up".into()),
            });
        }
        if self.upstream.client_name.is_empty() {
            warnings.push(ConfigWarning {
                field: "upstream.client_name".into(),
                message: "client_name is empty".into(),
                severity: WarningSeverity::Warning,
                hint: Some("Upstreams see this in clientInfo".into()),
            });
        }

        // ── Servers ───
        for (id, server) in &self.servers {
            if server.command.trim().is_empty() {
                warnings.push(ConfigWarning {
                    field: format!("servers.{id}.command"),
                    message: "command is empty".into(),
                    severity: WarningSeverity::Error,
                    hint: Some("Set the executable that speaks the protocol over stdio".into()),
                });
            }
            if id.starts_with(skillflow_core::SKILL_TOOL_PREFIX) {
                warnings.push(ConfigWarning {
                    field: format!("servers.{id}"),
                    message: "server id uses the reserved skill__ prefix".into(),
                    severity: WarningSeverity::Error,
                    hint: None,
                });
            }
            for (name, value) in [
                ("start_timeout_ms", server.start_timeout_ms),
                ("handshake_timeout_ms", server.handshake_timeout_ms),
                ("call_timeout_ms", server.call_timeout_ms),
            ] {
                if value == Some(0) {
                    warnings.push(ConfigWarning {
                        field: format!("servers.{id}.{name}"),
                        message: "timeout override is 0".into(),
                        severity: WarningSeverity::Error,
                        hint: Some("Remove the override to use the [upstream] default".into()),
                    });
                }
            }
        }
        if !self.servers.is_empty() && self.servers.values().all(|s| !s.enabled) {
            warnings.push(ConfigWarning {
                field: "servers".into(),
                message: "every configured server is disabled".into(),
                severity: WarningSeverity::Info,
                hint: None,
            });
        }

        // ── Logging ───
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_levels.join(", "))),
            });
        }
        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_formats.join(", "))),
            });
        }

        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("Configuration errors:\n  • {}", errors.join("\n  • ")));
        }

        Ok(warnings)
    }

    /// Enabled upstream endpoints.
    pub fn enabled_servers(&self) -> impl Iterator<Item = (&String, &ServerEntry)> {
        self.servers.iter().filter(|(_, s)| s.enabled)
    }
}
