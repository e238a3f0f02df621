use notify::{Event as NotifyEvent, EventKind, RecursiveMode, Watcher};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use skillflow_core::{FlowError, Result};

use crate::schema::FlowConfig;

/// Loads and optionally hot-reloads the SkillFlow configuration.
pub struct ConfigLoader {
    config: Arc<RwLock<FlowConfig>>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > SKILLFLOW_CONFIG env > ~/.skillflow/skillflow.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("SKILLFLOW_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".skillflow")
            .join("skillflow.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            Self::read_file(&config_path)?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            FlowConfig::default()
        };

        let config = Self::apply_env_overrides(config);

        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
            }
            Err(e) => return Err(FlowError::Config(e)),
        }

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Wrap an already-built config (tests, embedding applications).
    pub fn from_config(config: FlowConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            config_path: PathBuf::new(),
        }
    }

    fn read_file(path: &Path) -> Result<FlowConfig> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str::<FlowConfig>(&raw).map_err(|e| {
            FlowError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> FlowConfig {
        self.config.read().clone()
    }

    /// Get a shared reference for subscription.
    pub fn shared(&self) -> Arc<RwLock<FlowConfig>> {
        Arc::clone(&self.config)
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Apply env var overrides (SKILLFLOW_LOG_LEVEL, SKILLFLOW_DATA_DIR, etc.)
    pub fn apply_env_overrides(mut config: FlowConfig) -> FlowConfig {
        if let Ok(v) = std::env::var("SKILLFLOW_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Ok(v) = std::env::var("SKILLFLOW_DATA_DIR") {
            config.storage.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SKILLFLOW_MAX_PARALLEL") {
            match v.parse::<usize>() {
                Ok(n) => config.engine.max_parallel = n,
                Err(_) => warn!(value = %v, "ignoring non-numeric SKILLFLOW_MAX_PARALLEL"),
            }
        }
        if let Ok(v) = std::env::var("SKILLFLOW_CALL_TIMEOUT_MS") {
            match v.parse::<u64>() {
                Ok(ms) => config.upstream.call_timeout_ms = ms,
                Err(_) => warn!(value = %v, "ignoring non-numeric SKILLFLOW_CALL_TIMEOUT_MS"),
            }
        }
        config
    }

    /// Reload the config from disk. The current config is kept if the new one is invalid.
    pub fn reload(&self) -> Result<()> {
        if !self.config_path.exists() {
            return Err(FlowError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let new_config = Self::apply_env_overrides(Self::read_file(&self.config_path)?);
        new_config.validate().map_err(FlowError::Config)?;
        *self.config.write() = new_config;
        info!("configuration reloaded");
        Ok(())
    }

    /// Start a background file watcher that reloads the config when the file changes.
    /// The returned watcher must be kept alive for watching to continue.
    pub fn watch(&self) -> Result<notify::RecommendedWatcher> {
        let config = Arc::clone(&self.config);
        let config_path = self.config_path.clone();

        info!(?config_path, "starting config file watcher");

        let path_for_event = config_path.clone();
        let mut watcher = notify::recommended_watcher(
            move |res: std::result::Result<NotifyEvent, notify::Error>| match res {
                Ok(event) => {
                    if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                        return;
                    }
                    let is_our_file = event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == path_for_event.file_name());
                    if !is_our_file {
                        return;
                    }

                    info!("config file changed, reloading");
                    match ConfigLoader::read_file(&path_for_event) {
                        Ok(new_config) => {
                            let new_config = ConfigLoader::apply_env_overrides(new_config);
                            match new_config.validate() {
                                Ok(_) => {
                                    *config.write() = new_config;
                                    info!(
                                        servers = config.read().servers.len(),
                                        "configuration hot-reloaded successfully"
                                    );
                                }
                                Err(e) => {
                                    warn!(error = %e, "config file is invalid, keeping current config");
                                }
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "config file has errors, keeping current config");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "file watcher error");
                }
            },
        )
        .map_err(|e| FlowError::Config(format!("failed to create file watcher: {}", e)))?;

        // Watch the parent directory (some editors create temp files + rename)
        let watch_path = self.config_path.parent().unwrap_or(Path::new("."));
        watcher
            .watch(watch_path, RecursiveMode::NonRecursive)
            .map_err(|e| FlowError::Config(format!("failed to watch config directory: {}", e)))?;

        Ok(watcher)
    }
}
