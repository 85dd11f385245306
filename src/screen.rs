//! Screen capture and the snapshot cursor cache.
//!
//! Each text capture handed to a client is remembered under an opaque cursor.
//! When the client asks again with that cursor, the new capture is diffed
//! against the remembered one and only the deltas go over the wire.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::screen_diff::{self, ScreenDelta};
use crate::sessions::PaneDetail;
use crate::tmux::Tmux;

/// Snapshots kept per `(pane, line count)`.
pub const SNAPSHOTS_PER_KEY: usize = 10;
/// Distinct `lines` values remembered per pane.
const LINE_COUNTS_PER_PANE: usize = 8;

/// Raw result of a text capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedScreen {
    pub screen: String,
    pub alternate_on: bool,
    pub truncated: Option<bool>,
}

#[async_trait]
pub trait ScreenCapture: Send + Sync {
    async fn capture_text(&self, pane_id: &str, lines: u32) -> Result<CapturedScreen, ApiError>;
}

/// Pixel capture of a pane (PNG bytes). Optional; text is the fallback.
#[async_trait]
pub trait ImageCapture: Send + Sync {
    async fn capture_image(&self, pane: &PaneDetail) -> Result<Vec<u8>, String>;
}

pub struct TmuxScreenCapture {
    tmux: Tmux,
}

impl TmuxScreenCapture {
    pub fn new(tmux: Tmux) -> Self {
        Self { tmux }
    }
}

#[async_trait]
impl ScreenCapture for TmuxScreenCapture {
    async fn capture_text(&self, pane_id: &str, lines: u32) -> Result<CapturedScreen, ApiError> {
        let (raw, alternate_on) = self.tmux.capture_pane(pane_id, lines).await?;
        if alternate_on {
            return Ok(CapturedScreen {
                screen: raw.trim_end_matches('\n').to_string(),
                alternate_on,
                truncated: None,
            });
        }
        // -S -N returns N history lines plus the visible screen; keep the tail.
        let all: Vec<&str> = raw.trim_end_matches('\n').split('\n').collect();
        let keep = lines as usize;
        let truncated = all.len() > keep;
        let tail = if truncated { &all[all.len() - keep..] } else { &all[..] };
        Ok(CapturedScreen {
            screen: tail.join("\n"),
            alternate_on,
            truncated: Some(truncated),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenSnapshot {
    pub cursor: String,
    pub lines: Arc<Vec<String>>,
    pub alternate_on: bool,
    pub truncated: Option<bool>,
}

/// Bounded per-`(pane, line count)` history of delivered snapshots.
pub struct SnapshotCache {
    per_key: usize,
    seq: AtomicU64,
    /// Per pane, one history per line count; least recently stored first.
    snapshots: Mutex<HashMap<String, VecDeque<(u32, VecDeque<ScreenSnapshot>)>>>,
}

impl SnapshotCache {
    pub fn new(per_key: usize) -> Self {
        Self {
            per_key: per_key.max(1),
            seq: AtomicU64::new(1),
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    fn next_cursor(&self, pane_id: &str) -> String {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        URL_SAFE_NO_PAD.encode(format!("{pane_id}:{seq}"))
    }

    pub fn find(&self, pane_id: &str, lines: u32, cursor: &str) -> Option<ScreenSnapshot> {
        let snapshots = self.snapshots.lock().ok()?;
        snapshots
            .get(pane_id)?
            .iter()
            .find(|(n, _)| *n == lines)?
            .1
            .iter()
            .find(|s| s.cursor == cursor)
            .cloned()
    }

    /// Remember a capture and return its freshly minted cursor.
    pub fn store(&self, pane_id: &str, lines: u32, content: Arc<Vec<String>>, alternate_on: bool, truncated: Option<bool>) -> String {
        let cursor = self.next_cursor(pane_id);
        let snapshot = ScreenSnapshot {
            cursor: cursor.clone(),
            lines: content,
            alternate_on,
            truncated,
        };
        let mut snapshots = self
            .snapshots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let keys = snapshots.entry(pane_id.to_string()).or_default();
        let mut queue = match keys.iter().position(|(n, _)| *n == lines) {
            Some(i) => keys.remove(i).map(|(_, q)| q).unwrap_or_default(),
            None => VecDeque::new(),
        };
        queue.push_back(snapshot);
        while queue.len() > self.per_key {
            queue.pop_front();
        }
        keys.push_back((lines, queue));
        while keys.len() > LINE_COUNTS_PER_PANE {
            keys.pop_front();
        }
        cursor
    }

    /// Drop every snapshot of a pane that went away.
    pub fn forget_pane(&self, pane_id: &str) {
        if let Ok(mut snapshots) = self.snapshots.lock() {
            snapshots.remove(pane_id);
        }
    }

    #[cfg(test)]
    fn count(&self, pane_id: &str, lines: u32) -> usize {
        self.snapshots
            .lock()
            .unwrap()
            .get(pane_id)
            .and_then(|keys| keys.iter().find(|(n, _)| *n == lines))
            .map(|(_, q)| q.len())
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn line_counts(&self, pane_id: &str) -> Vec<u32> {
        self.snapshots
            .lock()
            .unwrap()
            .get(pane_id)
            .map(|keys| keys.iter().map(|(n, _)| *n).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScreenMode {
    #[default]
    Text,
    Image,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    ImageDisabled,
    ImageFailed,
}

/// `screen.response` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenResponse {
    pub ok: bool,
    pub pane_id: String,
    pub mode: ScreenMode,
    pub captured_at: DateTime<Utc>,
    pub lines: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deltas: Option<Vec<ScreenDelta>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alternate_on: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<FallbackReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl ScreenResponse {
    fn base(pane_id: &str, mode: ScreenMode, lines: u32) -> Self {
        Self {
            ok: true,
            pane_id: pane_id.to_string(),
            mode,
            captured_at: Utc::now(),
            lines,
            cursor: None,
            full: None,
            screen: None,
            deltas: None,
            alternate_on: None,
            truncated: None,
            image_base64: None,
            fallback_reason: None,
            error: None,
        }
    }

    pub fn failed(pane_id: &str, lines: u32, error: ApiError) -> Self {
        Self {
            ok: false,
            error: Some(error),
            ..Self::base(pane_id, ScreenMode::Text, lines)
        }
    }

    pub fn image(pane_id: &str, lines: u32, png: &[u8]) -> Self {
        Self {
            image_base64: Some(base64::engine::general_purpose::STANDARD.encode(png)),
            ..Self::base(pane_id, ScreenMode::Image, lines)
        }
    }

    /// Build a text response: deltas against the cursor's snapshot when
    /// possible, a full screen otherwise. Always stores a new snapshot.
    pub fn text(cache: &SnapshotCache, pane_id: &str, lines: u32, cursor: Option<&str>, captured: CapturedScreen) -> Self {
        let next: Arc<Vec<String>> = Arc::new(if captured.screen.is_empty() {
            Vec::new()
        } else {
            captured.screen.split('\n').map(str::to_string).collect()
        });

        let previous = cursor.and_then(|c| cache.find(pane_id, lines, c));
        let deltas = match &previous {
            Some(prev)
                if prev.alternate_on == captured.alternate_on && prev.truncated == captured.truncated =>
            {
                let deltas = screen_diff::diff(&prev.lines, &next);
                if screen_diff::should_send_full(prev.lines.len(), next.len(), &deltas) {
                    None
                } else {
                    Some(deltas)
                }
            }
            _ => None,
        };

        let new_cursor = cache.store(pane_id, lines, Arc::clone(&next), captured.alternate_on, captured.truncated);
        let full = deltas.is_none();

        Self {
            cursor: Some(new_cursor),
            full: Some(full),
            screen: full.then(|| captured.screen.clone()),
            deltas,
            alternate_on: Some(captured.alternate_on),
            truncated: captured.truncated,
            ..Self::base(pane_id, ScreenMode::Text, lines)
        }
    }
}
