//! Pane poller: keeps the registry in step with `tmux list-panes -a`.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::MuxError;
use crate::sessions::{AgentKind, PaneRegistry};
use crate::tmux::Tmux;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollStats {
    pub panes: usize,
    pub changed: usize,
    pub removed: usize,
}

/// One listing pass: upsert every live pane, drop the ones that vanished.
pub async fn poll_once(tmux: &Tmux, registry: &PaneRegistry) -> Result<PollStats, MuxError> {
    let panes = tmux.list_panes().await?;
    let mut stats = PollStats {
        panes: panes.len(),
        ..PollStats::default()
    };
    let mut live = Vec::with_capacity(panes.len());

    for mut pane in panes {
        // A hooked agent often runs under an interpreter (`node`), so the
        // foreground command alone would demote it to unknown.
        if pane.summary.agent == AgentKind::Unknown {
            if let Some(existing) = registry.get_detail(pane.pane_id()) {
                if existing.agent_session_id.is_some() && existing.pane_pid == pane.pane_pid {
                    pane.summary.agent = existing.summary.agent;
                }
            }
        }
        live.push(pane.summary.pane_id.clone());
        if registry.upsert(pane) {
            stats.changed += 1;
        }
    }

    stats.removed = registry.retain_only(&live);
    Ok(stats)
}

/// Poll forever at `interval`. Repeated identical failures are logged once.
pub async fn run(tmux: Tmux, registry: Arc<PaneRegistry>, interval: Duration) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_error: Option<String> = None;

    loop {
        tick.tick().await;
        match poll_once(&tmux, &registry).await {
            Ok(stats) => {
                if last_error.take().is_some() {
                    info!(panes = stats.panes, "pane polling recovered");
                }
                if stats.changed > 0 || stats.removed > 0 {
                    debug!(panes = stats.panes, changed = stats.changed, removed = stats.removed, "panes refreshed");
                }
            }
            Err(e) => {
                let message = e.to_string();
                if last_error.as_deref() != Some(message.as_str()) {
                    warn!(error = %message, "pane polling failed");
                }
                last_error = Some(message);
            }
        }
    }
}

pub fn spawn(tmux: Tmux, registry: Arc<PaneRegistry>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(run(tmux, registry, interval))
}
