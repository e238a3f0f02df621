use std::path::Path;

use skillflow_config::FlowConfig;
use skillflow_core::Result;
use skillflow_skills::{ExecutionPlan, FileSkillStore, SkillDefinition, SkillLoader};

use super::SkillAction;

pub(super) async fn cmd_skills(config: &FlowConfig, action: SkillAction) -> Result<()> {
    let skills_dir = config.storage.skills_dir();
    let store = FileSkillStore::new(&skills_dir);

    match action {
        SkillAction::List { query, tag } => {
            let skills = store.list(query.as_deref(), &tag).await?;
            if skills.is_empty() {
                println!("No skills found in {}", skills_dir.display());
                println!("  Store one with: skillflow skills save <file.json>");
                return Ok(());
            }
            println!("\x1b[1mStored skills ({}):\x1b[0m\n", skills.len());
            for s in skills {
                let tags = if s.tags.is_empty() {
                    String::new()
                } else {
                    format!(" [{}]", s.tags.join(", "))
                };
                println!("  \x1b[36m{}\x1b[0m v{}{}", s.id, s.version, tags);
                if !s.description.is_empty() {
                    println!("    {}", s.description);
                }
            }
        }
        SkillAction::Save { file } => save(&store, &file).await?,
        SkillAction::Show { id, version } => {
            let def = store.load(&id, version.into()).await?;
            println!("{}", serde_json::to_string_pretty(def.as_ref())?);
        }
        SkillAction::Versions { id } => {
            let versions = store.versions(&id).await?;
            let list: Vec<String> = versions.iter().map(|v| format!("v{v}")).collect();
            println!("{id}: {}", list.join(", "));
        }
    }
    Ok(())
}

async fn save(store: &FileSkillStore, file: &Path) -> Result<()> {
    let def = SkillDefinition::from_file(file)?;
    // Refuse to store a graph that could never run.
    ExecutionPlan::build(&def)?;
    let stored = store.save(def).await?;
    println!(
        "\x1b[32m✓\x1b[0m saved {} v{} to {}",
        stored.id,
        stored.version,
        store.root().display()
    );
    Ok(())
}
