use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;

use skillflow_config::{ConfigLoader, FlowConfig};
use skillflow_core::{FlowError, Result};
use skillflow_engine::{EngineSettings, SkillEngine};
use skillflow_mcp::ConnectionRegistry;
use skillflow_skills::{FileSkillStore, JsonlRunLog};

mod run;
mod serve;
mod servers;
mod skills;

/// SkillFlow: replay recorded tool calls as versioned skill graphs
#[derive(Parser)]
#[command(name = "skillflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to skillflow.toml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a stored skill, or a skill document with --file
    Run {
        /// Skill id in the store
        #[arg(required_unless_present = "file")]
        skill: Option<String>,
        /// Run this skill document instead of a stored skill
        #[arg(short, long, conflicts_with = "skill")]
        file: Option<PathBuf>,
        /// Exact version to run (default: latest)
        #[arg(id = "skill_version", long = "skill-version")]
        version: Option<u32>,
        /// Inputs as a JSON object
        #[arg(short, long)]
        input: Option<String>,
        /// Single inputs as key=value (values are parsed as JSON when possible)
        #[arg(short, long, value_parser = parse_key_val)]
        param: Vec<(String, String)>,
        /// Print the full run result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate a skill document and print its execution plan
    Check {
        file: PathBuf,
    },
    /// Manage stored skills
    Skills {
        #[command(subcommand)]
        action: SkillAction,
    },
    /// List configured upstream servers
    Servers {
        /// Connect to every enabled server and report its state
        #[arg(long)]
        connect: bool,
    },
    /// List the tools of an upstream server
    Tools {
        server: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Call one tool on an upstream server
    Call {
        server: String,
        tool: String,
        /// Arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,
    },
    /// Show current configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Serve stored skills as tools over stdin/stdout
    Serve,
}

#[derive(Subcommand)]
enum SkillAction {
    /// List the latest version of every stored skill
    List {
        /// Free-text filter on id, name and description
        query: Option<String>,
        /// Require this tag (repeatable)
        #[arg(short, long)]
        tag: Vec<String>,
    },
    /// Store a skill document as the next version of its id
    Save { file: PathBuf },
    /// Show a stored skill
    Show {
        id: String,
        #[arg(id = "skill_version", long = "skill-version")]
        version: Option<u32>,
    },
    /// List the stored versions of a skill
    Versions { id: String },
}

/// Parse "key=value" CLI arguments.
fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no `=` found in `{s}`"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

/// Merge `--input` and `--param` into one inputs object.
fn build_inputs(input: Option<&str>, params: &[(String, String)]) -> Result<Value> {
    let mut inputs = match input {
        Some(raw) => match serde_json::from_str::<Value>(raw)? {
            Value::Object(map) => map,
            _ => return Err(FlowError::Validation("--input must be a JSON object".into())),
        },
        None => Map::new(),
    };
    for (key, raw) in params {
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()));
        inputs.insert(key.clone(), value);
    }
    Ok(Value::Object(inputs))
}

/// Upstream registry, skill store and engine wired from one config.
struct Runtime {
    registry: Arc<ConnectionRegistry>,
    store: Arc<FileSkillStore>,
    engine: SkillEngine,
}

impl Runtime {
    fn new(config: &FlowConfig) -> Self {
        let engine_events = skillflow_core::EventBus::default();
        let registry = Arc::new(ConnectionRegistry::from_config(config).with_events(engine_events.clone()));
        let store = Arc::new(FileSkillStore::new(config.storage.skills_dir()));
        let engine = SkillEngine::builder(registry.clone(), store.clone())
            .run_log(Arc::new(JsonlRunLog::new(config.storage.runs_dir())))
            .events(engine_events)
            .settings(EngineSettings::from_config(&config.engine))
            .build();
        Self {
            registry,
            store,
            engine,
        }
    }
}

fn init_tracing(level: &str, format: &str, to_stderr: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (format, to_stderr) {
        ("json", true) => builder.json().with_target(true).with_writer(std::io::stderr).init(),
        ("json", false) => builder.json().with_target(true).init(),
        (_, true) => builder.with_target(false).with_writer(std::io::stderr).init(),
        (_, false) => builder.with_target(false).init(),
    }
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        // Load config first so we can use it for log format
        let config_loader = ConfigLoader::load(self.config.as_deref())?;
        let config = config_loader.get();

        // Resolve log level: --verbose > --quiet > --log-level > config
        let log_level = if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            self.log_level.as_deref().unwrap_or(&config.logging.level)
        };
        // stdout carries the protocol in serve mode.
        let serving = matches!(self.command, Commands::Serve);
        init_tracing(log_level, &config.logging.format, serving);

        match self.command {
            Commands::Run {
                skill,
                file,
                version,
                input,
                param,
                json,
            } => {
                let inputs = build_inputs(input.as_deref(), &param)?;
                let target = match (skill, file) {
                    (_, Some(path)) => run::Target::File(path),
                    (Some(id), None) => run::Target::Stored(id, version.into()),
                    (None, None) => {
                        return Err(FlowError::Validation("give a skill id or --file".into()));
                    }
                };
                run::cmd_run(&config, target, inputs, json).await
            }
            Commands::Check { file } => run::cmd_check(&file),
            Commands::Skills { action } => skills::cmd_skills(&config, action).await,
            Commands::Servers { connect } => servers::cmd_servers(&config, connect).await,
            Commands::Tools { server, json } => servers::cmd_tools(&config, &server, json).await,
            Commands::Call { server, tool, args } => servers::cmd_call(&config, &server, &tool, &args).await,
            Commands::Config { json } => Self::cmd_config(&config, json),
            Commands::Serve => serve::cmd_serve(config_loader).await,
        }
    }

    fn cmd_config(config: &FlowConfig, json: bool) -> Result<()> {
        if json {
            println!("{}", serde_json::to_string_pretty(config)?);
        } else {
            println!(
                "{}",
                toml::to_string_pretty(config).map_err(|e| FlowError::Config(e.to_string()))?
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_key_val() {
        assert_eq!(parse_key_val("a=b=c").unwrap(), ("a".into(), "b=c".into()));
        assert!(parse_key_val("novalue").is_err());
    }

    #[test]
    fn test_build_inputs_merges_params() {
        let params = vec![
            ("n".to_string(), "3".to_string()),
            ("name".to_string(), "ada".to_string()),
        ];
        let inputs = build_inputs(Some(r#"{"n": 1, "flag": true}"#), &params).unwrap();
        assert_eq!(inputs, json!({ "n": 3, "flag": true, "name": "ada" }));
        assert!(build_inputs(Some("[1]"), &[]).is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from(["skillflow", "run", "mirror", "-p", "url=http://a", "--json"]).unwrap();
        match cli.command {
            Commands::Run { skill, param, json, .. } => {
                assert_eq!(skill.as_deref(), Some("mirror"));
                assert_eq!(param.len(), 1);
                assert!(json);
            }
            _ => panic!("expected run"),
        }
        assert!(Cli::try_parse_from(["skillflow", "run"]).is_err());
    }
}
