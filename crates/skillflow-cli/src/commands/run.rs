use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use skillflow_config::FlowConfig;
use skillflow_core::{NodeStatus, Result, RunStatus, VersionSpec};
use skillflow_skills::{ExecutionPlan, RunResult, SkillDefinition, SkillLoader};

use super::Runtime;

pub(super) enum Target {
    Stored(String, VersionSpec),
    File(PathBuf),
}

pub(super) async fn cmd_run(config: &FlowConfig, target: Target, inputs: Value, json: bool) -> Result<()> {
    let runtime = Runtime::new(config);
    let def = match target {
        Target::Stored(id, version) => runtime.store.load(&id, version).await?,
        Target::File(path) => Arc::new(SkillDefinition::from_file(&path)?),
    };

    let outcome = runtime.engine.run(def, inputs).await;
    runtime.registry.close_all().await;
    let result = outcome?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }
    if result.summary.status != RunStatus::Success {
        return Err(skillflow_core::FlowError::SkillFailed {
            skill: result.summary.skill_id.clone(),
            reason: result
                .summary
                .error
                .clone()
                .unwrap_or_else(|| result.summary.status.to_string()),
        });
    }
    Ok(())
}

fn print_result(result: &RunResult) {
    let s = &result.summary;
    let colour = match s.status {
        RunStatus::Success => "32",
        RunStatus::PartialFailure => "33",
        _ => "31",
    };
    println!(
        "\x1b[1m{}\x1b[0m v{}  \x1b[{colour}m{}\x1b[0m  ({} ms)",
        s.skill_id,
        s.version,
        s.status,
        s.duration_ms()
    );
    println!("  run {}", s.run_id);
    println!();

    for (node, status) in &s.node_statuses {
        let mark = match status {
            NodeStatus::Success => "\x1b[32m✓\x1b[0m",
            NodeStatus::Failed => "\x1b[31m✗\x1b[0m",
            NodeStatus::Cancelled => "\x1b[33m⊘\x1b[0m",
            _ => "\x1b[90m·\x1b[0m",
        };
        let error = result
            .records_for(node)
            .last()
            .and_then(|r| r.error.as_deref())
            .map(|e| format!("  {e}"))
            .unwrap_or_default();
        println!("  {mark} {node:<24} {status}{error}");
    }

    println!();
    match serde_json::to_string_pretty(&s.outputs) {
        Ok(outputs) => println!("outputs:\n{outputs}"),
        Err(e) => println!("outputs: <unprintable: {e}>"),
    }
    for e in &s.schema_errors {
        println!("\x1b[33mwarning:\x1b[0m {e}");
    }
}

pub(super) fn cmd_check(file: &Path) -> Result<()> {
    let def = SkillDefinition::from_file(file)?;
    let plan = ExecutionPlan::build(&def)?;

    println!("\x1b[1m{}\x1b[0m v{}  ({} nodes, {:?})", def.display_name(), def.version, def.graph.nodes.len(), plan.mode);
    for (i, phase) in plan.phases.iter().enumerate() {
        println!("  phase {i}: {}", phase.join(", "));
    }
    let embedded: Vec<&str> = plan
        .order
        .iter()
        .filter(|id| plan.owner_of(id).is_some())
        .map(String::as_str)
        .collect();
    if !embedded.is_empty() {
        println!("  embedded: {}", embedded.join(", "));
    }
    println!("\x1b[32m✓\x1b[0m {} is valid", file.display());
    Ok(())
}
