use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::types::{NodeStatus, RunId, RunStatus};

/// Progress events emitted while skills execute and upstreams come and go.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunEvent {
    // ── Run lifecycle ──────────────────────────────────────────
    RunStarted {
        run_id: RunId,
        skill_id: String,
        version: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_run_id: Option<RunId>,
        at: DateTime<Utc>,
    },
    RunFinished {
        run_id: RunId,
        status: RunStatus,
        duration_ms: u64,
        at: DateTime<Utc>,
    },

    // ── Node lifecycle ─────────────────────────────────────────
    NodeStarted {
        run_id: RunId,
        node_id: String,
        attempt: u32,
    },
    NodeRetrying {
        run_id: RunId,
        node_id: String,
        attempt: u32,
        backoff_ms: u64,
        error: String,
    },
    NodeFinished {
        run_id: RunId,
        node_id: String,
        status: NodeStatus,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    // ── Upstream lifecycle ─────────────────────────────────────
    UpstreamConnected {
        server_id: String,
        tool_count: usize,
    },
    UpstreamDisconnected {
        server_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl RunEvent {
    /// Run this event belongs to, if any.
    pub fn run_id(&self) -> Option<RunId> {
        match self {
            RunEvent::RunStarted { run_id, .. }
            | RunEvent::RunFinished { run_id, .. }
            | RunEvent::NodeStarted { run_id, .. }
            | RunEvent::NodeRetrying { run_id, .. }
            | RunEvent::NodeFinished { run_id, .. } => Some(*run_id),
            RunEvent::UpstreamConnected { .. } | RunEvent::UpstreamDisconnected { .. } => None,
        }
    }
}

/// A broadcast-based event bus for run progress.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<RunEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn publish(&self, event: RunEvent) {
        // Ignore send errors (no subscribers).
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(4096)
    }
}
