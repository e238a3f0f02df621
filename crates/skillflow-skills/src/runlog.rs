//! Run log sinks. Every node record is appended as it is produced; the
//! summary is written last.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use skillflow_core::{FlowError, Result, RunId};

use crate::record::{NodeExecutionRecord, RunResult, RunSummary};

#[async_trait]
pub trait RunLogSink: Send + Sync {
    async fn append(&self, record: &NodeExecutionRecord) -> Result<()>;
    async fn finish(&self, summary: &RunSummary) -> Result<()>;
}

/// One line of a JSONL run log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogLine {
    Node(NodeExecutionRecord),
    Summary(RunSummary),
}

// ── Memory ─────────────────────────────────────────────────────

#[derive(Default)]
struct RunEntries {
    records: Vec<NodeExecutionRecord>,
    summary: Option<RunSummary>,
}

/// Keeps every run's records in memory. Cheap to clone.
#[derive(Default, Clone)]
pub struct MemoryRunLog {
    runs: Arc<Mutex<HashMap<RunId, RunEntries>>>,
}

impl MemoryRunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self, run_id: RunId) -> Vec<NodeExecutionRecord> {
        self.runs
            .lock()
            .get(&run_id)
            .map(|r| r.records.clone())
            .unwrap_or_default()
    }

    pub fn summary(&self, run_id: RunId) -> Option<RunSummary> {
        self.runs.lock().get(&run_id).and_then(|r| r.summary.clone())
    }

    /// Ids of runs that have a summary.
    pub fn finished_runs(&self) -> Vec<RunId> {
        self.runs
            .lock()
            .iter()
            .filter(|(_, r)| r.summary.is_some())
            .map(|(id, _)| *id)
            .collect()
    }
}

#[async_trait]
impl RunLogSink for MemoryRunLog {
    async fn append(&self, record: &NodeExecutionRecord) -> Result<()> {
        self.runs
            .lock()
            .entry(record.run_id)
            .or_default()
            .records
            .push(record.clone());
        Ok(())
    }

    async fn finish(&self, summary: &RunSummary) -> Result<()> {
        self.runs.lock().entry(summary.run_id).or_default().summary = Some(summary.clone());
        Ok(())
    }
}

// ── JSONL ──────────────────────────────────────────────────────

/// Writes `<dir>/<run_id>.jsonl`, one [`LogLine`] per line.
pub struct JsonlRunLog {
    dir: PathBuf,
    // Serialises appends to the same file from concurrent nodes.
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlRunLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path_for(&self, run_id: RunId) -> PathBuf {
        self.dir.join(format!("{run_id}.jsonl"))
    }

    async fn write_line(&self, run_id: RunId, line: &LogLine) -> Result<()> {
        let mut buf = serde_json::to_vec(line)?;
        buf.push(b'\n');

        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(run_id))
            .await?;
        file.write_all(&buf).await?;
        file.flush().await?;
        Ok(())
    }

    /// Read a run log back. A log without a summary line is an error.
    pub async fn read(path: &Path) -> Result<RunResult> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| FlowError::Storage(format!("{}: {e}", path.display())))?;
        let mut records = Vec::new();
        let mut summary = None;
        for (n, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let parsed: LogLine = serde_json::from_str(line).map_err(|e| {
                FlowError::Storage(format!("{}:{}: {e}", path.display(), n + 1))
            })?;
            match parsed {
                LogLine::Node(r) => records.push(r),
                LogLine::Summary(s) => summary = Some(s),
            }
        }
        let summary = summary.ok_or_else(|| {
            FlowError::Storage(format!("{}: run log has no summary", path.display()))
        })?;
        Ok(RunResult { summary, records })
    }
}

#[async_trait]
impl RunLogSink for JsonlRunLog {
    async fn append(&self, record: &NodeExecutionRecord) -> Result<()> {
        self.write_line(record.run_id, &LogLine::Node(record.clone())).await
    }

    async fn finish(&self, summary: &RunSummary) -> Result<()> {
        self.write_line(summary.run_id, &LogLine::Summary(summary.clone())).await?;
        debug!(run_id = %summary.run_id, status = %summary.status, "run log closed");
        Ok(())
    }
}

/// Fans records out to several sinks.
#[derive(Default, Clone)]
pub struct TeeRunLog {
    sinks: Vec<Arc<dyn RunLogSink>>,
}

impl TeeRunLog {
    pub fn new(sinks: Vec<Arc<dyn RunLogSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl RunLogSink for TeeRunLog {
    async fn append(&self, record: &NodeExecutionRecord) -> Result<()> {
        for sink in &self.sinks {
            sink.append(record).await?;
        }
        Ok(())
    }

    async fn finish(&self, summary: &RunSummary) -> Result<()> {
        for sink in &self.sinks {
            sink.finish(summary).await?;
        }
        Ok(())
    }
}
