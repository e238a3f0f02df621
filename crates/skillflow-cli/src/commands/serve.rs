use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use skillflow_config::ConfigLoader;
use skillflow_core::{FlowError, Result, RunEvent};
use skillflow_engine::SkillService;

use super::Runtime;

/// How often a hot-reloaded config is pushed into the registry.
const CONFIG_SYNC_INTERVAL: Duration = Duration::from_secs(2);

pub(super) async fn cmd_serve(config_loader: ConfigLoader) -> Result<()> {
    let config = config_loader.get();
    let runtime = Runtime::new(&config);

    let _watcher = match config_loader.watch() {
        Ok(w) => Some(w),
        Err(e) => {
            warn!(error = %e, "config hot-reload disabled");
            None
        }
    };

    let shared = config_loader.shared();
    let registry = Arc::clone(&runtime.registry);
    let sync = tokio::spawn(async move {
        let mut tick = tokio::time::interval(CONFIG_SYNC_INTERVAL);
        tick.tick().await;
        loop {
            tick.tick().await;
            let current = shared.read().clone();
            registry.apply_config(&current).await;
        }
    });

    let mut events = runtime.engine.events().subscribe();
    let progress = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(n)) => debug!(skipped = n, "progress log lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    info!(
        version = env!("CARGO_PKG_VERSION"),
        skills_dir = %config.storage.skills_dir().display(),
        servers = config.servers.len(),
        "serving skills on stdio"
    );
    let service = Arc::new(SkillService::new(runtime.engine.clone()));
    let served = service.serve_stdio().await;

    sync.abort();
    progress.abort();
    runtime.registry.close_all().await;
    served.map_err(FlowError::from)
}

fn log_event(event: &RunEvent) {
    match event {
        RunEvent::NodeFinished {
            run_id,
            node_id,
            status,
            duration_ms,
            ..
        } => debug!(run_id = %run_id, node = %node_id, status = %status, duration_ms, "node finished"),
        RunEvent::NodeRetrying {
            run_id,
            node_id,
            attempt,
            ..
        } => debug!(run_id = %run_id, node = %node_id, attempt, "node retrying"),
        RunEvent::UpstreamDisconnected { server_id, reason } => {
            info!(server = %server_id, ?reason, "upstream disconnected")
        }
        _ => {}
    }
}
