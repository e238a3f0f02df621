//! Versioned skill storage.
//!
//! A skill id owns an ordered list of immutable versions. `save` always
//! creates the next version; older versions are never rewritten.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use skillflow_core::{FlowError, Result, SkillId, VersionSpec};

use crate::definition::SkillDefinition;

/// Read/write access to stored skills.
#[async_trait]
pub trait SkillLoader: Send + Sync {
    /// Load a version of a skill.
    async fn load(&self, id: &str, version: VersionSpec) -> Result<Arc<SkillDefinition>>;

    /// Store `def` as the next version of its id and return the stored copy.
    async fn save(&self, def: SkillDefinition) -> Result<Arc<SkillDefinition>>;

    /// Latest version of every skill matching the filters.
    async fn list(&self, query: Option<&str>, tags: &[String]) -> Result<Vec<Arc<SkillDefinition>>>;

    /// Stored version numbers of a skill, ascending.
    async fn versions(&self, id: &str) -> Result<Vec<u32>>;
}

fn stamp(mut def: SkillDefinition, version: u32, created: Option<chrono::DateTime<Utc>>) -> SkillDefinition {
    let now = Utc::now();
    def.version = version;
    def.created_at = created.unwrap_or(now);
    def.updated_at = now;
    def
}

fn pick(
    id: &str,
    versions: &BTreeMap<u32, Arc<SkillDefinition>>,
    spec: VersionSpec,
) -> Result<Arc<SkillDefinition>> {
    let found = match spec {
        VersionSpec::Latest => versions.values().next_back(),
        VersionSpec::Exact(v) => versions.get(&v),
    };
    found
        .cloned()
        .ok_or_else(|| FlowError::SkillNotFound(format!("{id} ({spec})")))
}

// ── In-memory ──────────────────────────────────────────────────

/// Skill store held entirely in memory.
#[derive(Default, Clone)]
pub struct InMemorySkillStore {
    skills: Arc<RwLock<HashMap<SkillId, BTreeMap<u32, Arc<SkillDefinition>>>>>,
}

impl InMemorySkillStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a definition under its own version number, replacing any
    /// existing copy of that exact version.
    pub fn insert(&self, def: SkillDefinition) {
        let mut skills = self.skills.write();
        skills
            .entry(def.id.clone())
            .or_default()
            .insert(def.version, Arc::new(def));
    }

    pub fn len(&self) -> usize {
        self.skills.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.read().is_empty()
    }
}

#[async_trait]
impl SkillLoader for InMemorySkillStore {
    async fn load(&self, id: &str, version: VersionSpec) -> Result<Arc<SkillDefinition>> {
        let skills = self.skills.read();
        let versions = skills
            .get(id)
            .ok_or_else(|| FlowError::SkillNotFound(id.to_string()))?;
        pick(id, versions, version)
    }

    async fn save(&self, def: SkillDefinition) -> Result<Arc<SkillDefinition>> {
        let mut skills = self.skills.write();
        let versions = skills.entry(def.id.clone()).or_default();
        let next = versions.keys().next_back().map_or(1, |v| v + 1);
        let created = versions.values().next().map(|d| d.created_at);
        let stored = Arc::new(stamp(def, next, created));
        versions.insert(next, stored.clone());
        Ok(stored)
    }

    async fn list(&self, query: Option<&str>, tags: &[String]) -> Result<Vec<Arc<SkillDefinition>>> {
        let skills = self.skills.read();
        let mut out: Vec<_> = skills
            .values()
            .filter_map(|v| v.values().next_back().cloned())
            .filter(|d| d.matches(query, tags))
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn versions(&self, id: &str) -> Result<Vec<u32>> {
        Ok(self
            .skills
            .read()
            .get(id)
            .map(|v| v.keys().copied().collect())
            .unwrap_or_default())
    }
}

// ── Directory ──────────────────────────────────────────────────

/// Skill store rooted at a directory: `<root>/<id>/v0001.json`, `v0002.json`, …
pub struct FileSkillStore {
    root: PathBuf,
}

impl FileSkillStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn skill_dir(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(FlowError::Storage(format!("invalid skill id '{id}'")));
        }
        Ok(self.root.join(id))
    }

    fn version_file(dir: &Path, version: u32) -> PathBuf {
        dir.join(format!("v{version:04}.json"))
    }

    async fn read_versions(dir: &Path) -> Result<Vec<u32>> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let parsed = name
                .strip_prefix('v')
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|n| n.parse::<u32>().ok());
            if let Some(v) = parsed {
                out.push(v);
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    async fn read_file(path: &Path) -> Result<SkillDefinition> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| FlowError::Storage(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| FlowError::Storage(format!("{}: {e}", path.display())))
    }
}

#[async_trait]
impl SkillLoader for FileSkillStore {
    async fn load(&self, id: &str, version: VersionSpec) -> Result<Arc<SkillDefinition>> {
        let dir = self.skill_dir(id)?;
        let v = match version {
            VersionSpec::Exact(v) => v,
            VersionSpec::Latest => *Self::read_versions(&dir)
                .await?
                .last()
                .ok_or_else(|| FlowError::SkillNotFound(id.to_string()))?,
        };
        let path = Self::version_file(&dir, v);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(FlowError::SkillNotFound(format!("{id} ({version})")));
        }
        debug!(skill = %id, version = v, "loading skill");
        Ok(Arc::new(Self::read_file(&path).await?))
    }

    async fn save(&self, def: SkillDefinition) -> Result<Arc<SkillDefinition>> {
        let dir = self.skill_dir(&def.id)?;
        tokio::fs::create_dir_all(&dir).await?;

        let existing = Self::read_versions(&dir).await?;
        let next = existing.last().map_or(1, |v| v + 1);
        let created = match existing.first() {
            Some(first) => Some(Self::read_file(&Self::version_file(&dir, *first)).await?.created_at),
            None => None,
        };
        let def = stamp(def, next, created);

        let body = serde_json::to_vec_pretty(&def)?;
        let target = Self::version_file(&dir, next);
        let tmp = dir.join(format!(".v{next:04}.json.tmp"));
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &target).await?;

        info!(skill = %def.id, version = next, "saved skill");
        Ok(Arc::new(def))
    }

    async fn list(&self, query: Option<&str>, tags: &[String]) -> Result<Vec<Arc<SkillDefinition>>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            match self.load(&id, VersionSpec::Latest).await {
                Ok(def) if def.matches(query, tags) => out.push(def),
                Ok(_) | Err(FlowError::SkillNotFound(_)) => {}
                Err(e) => warn!(skill = %id, error = %e, "skipping unreadable skill"),
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn versions(&self, id: &str) -> Result<Vec<u32>> {
        Self::read_versions(&self.skill_dir(id)?).await
    }
}
