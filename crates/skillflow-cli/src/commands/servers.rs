use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use skillflow_config::FlowConfig;
use skillflow_core::{FlowError, Result};
use skillflow_mcp::ConnectionRegistry;

pub(super) async fn cmd_servers(config: &FlowConfig, connect: bool) -> Result<()> {
    let registry = ConnectionRegistry::from_config(config);
    if registry.list_servers().is_empty() {
        println!("No upstream servers configured.");
        println!("  Add one under [servers.<id>] in skillflow.toml");
        return Ok(());
    }

    if connect {
        for (id, _) in config.enabled_servers() {
            if let Err(e) = registry.connection(id).await {
                warn!(server = %id, error = %e, "connection failed");
            }
        }
    }

    println!("\x1b[1mUpstream servers:\x1b[0m\n");
    for s in registry.list_servers() {
        let state = match (s.enabled, s.state) {
            (false, _) => "disabled".to_string(),
            (true, Some(state)) => format!("{state} ({} tools)", s.tool_count),
            (true, None) => "not connected".to_string(),
        };
        let name = s.name.as_deref().map(|n| format!(" ({n})")).unwrap_or_default();
        println!("  \x1b[36m{}\x1b[0m{name}  {state}", s.id);
        println!("    {}", s.command);
    }

    registry.close_all().await;
    Ok(())
}

pub(super) async fn cmd_tools(config: &FlowConfig, server: &str, json: bool) -> Result<()> {
    let registry = ConnectionRegistry::from_config(config);
    let tools = registry.list_tools(server).await;
    registry.close_all().await;
    let tools = tools?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tools)?);
        return Ok(());
    }
    println!("\x1b[1m{server}: {} tools\x1b[0m\n", tools.len());
    for t in tools {
        println!("  \x1b[36m{}\x1b[0m", t.name);
        if !t.description.is_empty() {
            println!("    {}", t.description);
        }
    }
    Ok(())
}

pub(super) async fn cmd_call(config: &FlowConfig, server: &str, tool: &str, args: &str) -> Result<()> {
    let args: Value = serde_json::from_str(args)?;
    if !args.is_object() {
        return Err(FlowError::Validation("--args must be a JSON object".into()));
    }

    let registry = ConnectionRegistry::from_config(config);
    let cancel = CancellationToken::new();
    let result = tokio::select! {
        result = registry.call(server, tool, args, cancel.clone()) => result,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            Err(FlowError::Cancelled(format!("{tool} on {server}")))
        }
    };
    registry.close_all().await;

    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}
