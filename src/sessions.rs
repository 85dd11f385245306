//! Pane registry: the live set of multiplexer panes and the agents in them.
//!
//! The monitor loop and the hook endpoint write into the registry; the bridge
//! reads it and owns a single subscription to its change events, which it
//! fans out to every connected viewer.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Agent running in a pane, detected from its foreground command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Codex,
    #[default]
    #[serde(other)]
    Unknown,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Codex => "codex",
            AgentKind::Unknown => "unknown",
        }
    }

    /// Map a `pane_current_command` value to an agent kind.
    pub fn from_command(command: &str) -> Self {
        let base = command.rsplit('/').next().unwrap_or(command).trim();
        match base {
            "claude" => AgentKind::Claude,
            "codex" => AgentKind::Codex,
            _ => AgentKind::Unknown,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, AgentKind::Unknown)
    }
}

/// What viewers see for a pane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaneSummary {
    pub pane_id: String,
    pub session_name: String,
    pub window_index: u32,
    pub pane_index: u32,
    pub window_name: String,
    pub current_command: String,
    pub current_path: String,
    pub pane_active: bool,
    pub agent: AgentKind,
    pub last_event_at: Option<DateTime<Utc>>,
    pub last_input_at: Option<DateTime<Utc>>,
}

/// Full pane record, including fields only the server needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaneDetail {
    #[serde(flatten)]
    pub summary: PaneSummary,
    pub pane_pid: Option<u32>,
    /// Session id reported by the agent's own hook (Claude only).
    pub agent_session_id: Option<String>,
}

impl PaneDetail {
    pub fn pane_id(&self) -> &str {
        &self.summary.pane_id
    }

    pub fn agent(&self) -> AgentKind {
        self.summary.agent
    }
}

/// Registry change notifications, delivered in change order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Updated(PaneSummary),
    Removed { pane_id: String },
}

pub struct PaneRegistry {
    panes: DashMap<String, PaneDetail>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl PaneRegistry {
    pub fn new() -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            panes: DashMap::new(),
            event_tx,
        })
    }

    pub fn get_detail(&self, pane_id: &str) -> Option<PaneDetail> {
        self.panes.get(pane_id).map(|r| r.clone())
    }

    /// All pane records, ordered by session, window and pane index.
    pub fn values(&self) -> Vec<PaneDetail> {
        let mut panes: Vec<PaneDetail> = self.panes.iter().map(|r| r.clone()).collect();
        panes.sort_by(|a, b| {
            (&a.summary.session_name, a.summary.window_index, a.summary.pane_index).cmp(&(
                &b.summary.session_name,
                b.summary.window_index,
                b.summary.pane_index,
            ))
        });
        panes
    }

    pub fn snapshot(&self) -> Vec<PaneSummary> {
        self.values().into_iter().map(|d| d.summary).collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Insert or refresh a pane. Hook-provided and input-tracking fields the
    /// poller cannot see are carried over. Broadcasts only on change.
    pub fn upsert(&self, mut detail: PaneDetail) -> bool {
        // The event is sent while the entry is locked so per-pane events
        // leave in the same order the changes were applied.
        match self.panes.entry(detail.summary.pane_id.clone()) {
            Entry::Occupied(mut existing) => {
                let current = existing.get();
                if detail.agent_session_id.is_none() && detail.summary.agent == current.summary.agent {
                    detail.agent_session_id = current.agent_session_id.clone();
                }
                if detail.summary.last_event_at.is_none() {
                    detail.summary.last_event_at = current.summary.last_event_at;
                }
                if detail.summary.last_input_at.is_none() {
                    detail.summary.last_input_at = current.summary.last_input_at;
                }
                if *current == detail {
                    return false;
                }
                let summary = detail.summary.clone();
                existing.insert(detail);
                let _ = self.event_tx.send(SessionEvent::Updated(summary));
                true
            }
            Entry::Vacant(slot) => {
                let summary = detail.summary.clone();
                slot.insert(detail);
                let _ = self.event_tx.send(SessionEvent::Updated(summary));
                true
            }
        }
    }

    pub fn remove(&self, pane_id: &str) -> bool {
        if self.panes.remove(pane_id).is_some() {
            let _ = self.event_tx.send(SessionEvent::Removed {
                pane_id: pane_id.to_string(),
            });
            true
        } else {
            false
        }
    }

    /// Drop every pane not in `live`, returning how many were removed.
    pub fn retain_only(&self, live: &[String]) -> usize {
        let stale: Vec<String> = self
            .panes
            .iter()
            .filter(|r| !live.iter().any(|id| id == r.key()))
            .map(|r| r.key().clone())
            .collect();
        stale.iter().filter(|id| self.remove(id)).count()
    }

    /// Note that a viewer sent input to the pane.
    pub fn record_input(&self, pane_id: &str, at: DateTime<Utc>) {
        self.modify(pane_id, |detail| detail.summary.last_input_at = Some(at));
    }

    /// Apply a hook report from the agent running in the pane.
    pub fn record_hook(&self, pane_id: &str, agent: AgentKind, session_id: Option<String>, at: DateTime<Utc>) -> bool {
        self.modify(pane_id, |detail| {
            detail.summary.agent = agent;
            if let Some(id) = session_id.filter(|s| !s.trim().is_empty()) {
                detail.agent_session_id = Some(id);
            }
            detail.summary.last_event_at = Some(at);
        })
    }

    fn modify(&self, pane_id: &str, f: impl FnOnce(&mut PaneDetail)) -> bool {
        let Some(mut entry) = self.panes.get_mut(pane_id) else {
            return false;
        };
        f(&mut entry);
        let summary = entry.summary.clone();
        let _ = self.event_tx.send(SessionEvent::Updated(summary));
        true
    }

    pub fn len(&self) -> usize {
        self.panes.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn pane(id: &str, agent: AgentKind) -> PaneDetail {
        PaneDetail {
            summary: PaneSummary {
                pane_id: id.to_string(),
                session_name: "work".to_string(),
                window_index: 1,
                pane_index: 0,
                window_name: agent.as_str().to_string(),
                current_command: agent.as_str().to_string(),
                current_path: "/home/dev/project".to_string(),
                pane_active: true,
                agent,
                last_event_at: None,
                last_input_at: None,
            },
            pane_pid: Some(4242),
            agent_session_id: None,
        }
    }

    #[test]
    fn agent_detection_from_command() {
        assert_eq!(AgentKind::from_command("claude"), AgentKind::Claude);
        assert_eq!(AgentKind::from_command("/usr/local/bin/codex"), AgentKind::Codex);
        assert_eq!(AgentKind::from_command("zsh"), AgentKind::Unknown);
        let parsed: AgentKind = serde_json::from_str("\"gemini\"").unwrap();
        assert_eq!(parsed, AgentKind::Unknown);
    }

    #[tokio::test]
    async fn upsert_broadcasts_only_on_change() {
        let registry = PaneRegistry::new();
        let mut rx = registry.subscribe();

        assert!(registry.upsert(pane("%1", AgentKind::Claude)));
        assert!(!registry.upsert(pane("%1", AgentKind::Claude)));

        match rx.recv().await.unwrap() {
            SessionEvent::Updated(summary) => assert_eq!(summary.pane_id, "%1"),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn hook_fields_survive_poller_refresh() {
        let registry = PaneRegistry::new();
        registry.upsert(pane("%1", AgentKind::Claude));
        let at = Utc::now();
        registry.record_hook("%1", AgentKind::Claude, Some("sess-abc".into()), at);
        registry.record_input("%1", at);

        registry.upsert(pane("%1", AgentKind::Claude));
        let detail = registry.get_detail("%1").unwrap();
        assert_eq!(detail.agent_session_id.as_deref(), Some("sess-abc"));
        assert_eq!(detail.summary.last_event_at, Some(at));
        assert_eq!(detail.summary.last_input_at, Some(at));
    }

    #[tokio::test]
    async fn retain_only_removes_stale_panes() {
        let registry = PaneRegistry::new();
        registry.upsert(pane("%1", AgentKind::Claude));
        registry.upsert(pane("%2", AgentKind::Codex));
        let mut rx = registry.subscribe();

        assert_eq!(registry.retain_only(&["%2".to_string()]), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(
            rx.recv().await.unwrap(),
            SessionEvent::Removed { pane_id: "%1".to_string() }
        );
    }
}
