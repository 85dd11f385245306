//! Recover the agent session id running in a pane, so a new window can
//! resume it.
//!
//! Strategies per agent:
//! - claude: hook-reported id, then the per-project history directory
//!   (`~/.claude/projects/<encoded cwd>/*.jsonl`).
//! - codex: session logs held open by the pane's process tree (`lsof`),
//!   then the dated history directory (`~/.codex/sessions/YYYY/MM/DD`).
//!
//! Heuristic candidates are scored by [`ResumeScoring`]; the strict top score
//! wins and a tie at the top is reported as ambiguous.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use crate::error::MuxError;
use crate::exec::run_command;
use crate::sessions::{AgentKind, PaneDetail};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResumeSource {
    Manual,
    Hook,
    Lsof,
    History,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveFailureReason {
    Unsupported,
    InvalidInput,
    NotFound,
    Ambiguous,
}

impl ResolveFailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unsupported => "unsupported",
            Self::InvalidInput => "invalid_input",
            Self::NotFound => "not_found",
            Self::Ambiguous => "ambiguous",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSession {
    pub session_id: String,
    pub source: ResumeSource,
    pub confidence: Confidence,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveFailure {
    pub reason: ResolveFailureReason,
    pub agent: AgentKind,
}

pub type ResolveOutcome = Result<ResolvedSession, ResolveFailure>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoredCandidate {
    pub session_id: String,
    pub score: i64,
    pub confidence: Confidence,
}

/// Scoring weights for heuristic candidates.
#[derive(Debug, Clone)]
pub struct ResumeScoring {
    pub base: i64,
    pub cwd_match: i64,
    pub recent_window: Duration,
    pub recent_bonus: i64,
    pub warm_window: Duration,
    pub warm_bonus: i64,
    pub high_threshold: i64,
    pub medium_threshold: i64,
}

impl Default for ResumeScoring {
    fn default() -> Self {
        Self {
            base: 0,
            cwd_match: 100,
            recent_window: Duration::from_secs(10 * 60),
            recent_bonus: 30,
            warm_window: Duration::from_secs(30 * 60),
            warm_bonus: 10,
            high_threshold: 100,
            medium_threshold: 30,
        }
    }
}

impl ResumeScoring {
    pub fn confidence(&self, score: i64) -> Confidence {
        if score >= self.high_threshold {
            Confidence::High
        } else if score >= self.medium_threshold {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }

    fn score(&self, header_cwd: Option<&str>, pane_cwd: &str, modified: DateTime<Utc>, last_event: DateTime<Utc>) -> i64 {
        let mut score = self.base;
        if header_cwd.is_some_and(|cwd| normalize_path(cwd) == normalize_path(pane_cwd)) {
            score += self.cwd_match;
        }
        let age = (last_event - modified).abs().to_std().unwrap_or(Duration::MAX);
        if age <= self.recent_window {
            score += self.recent_bonus;
        } else if age <= self.warm_window {
            score += self.warm_bonus;
        }
        score
    }
}

/// Strip trailing slashes (keeping a bare `/`).
pub fn normalize_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && path.starts_with('/') {
        "/"
    } else {
        trimmed
    }
}

/// Claude's project directory name for a working directory.
pub fn encode_claude_project(cwd: &str) -> String {
    normalize_path(cwd)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// OS process tree and open-file inspection.
#[async_trait]
pub trait ProcessInspector: Send + Sync {
    /// `(pid, ppid)` for every process.
    async fn process_edges(&self) -> Result<Vec<(u32, u32)>, MuxError>;
    /// Regular files opened by any of `pids`.
    async fn open_files(&self, pids: &[u32]) -> Result<Vec<PathBuf>, MuxError>;
}

pub struct PsLsofInspector {
    timeout: Duration,
}

impl PsLsofInspector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ProcessInspector for PsLsofInspector {
    async fn process_edges(&self) -> Result<Vec<(u32, u32)>, MuxError> {
        let args = vec!["-A".to_string(), "-o".into(), "pid=,ppid=".into()];
        let out = run_command("ps", &args, None, self.timeout).await?;
        Ok(parse_ps(&out.into_stdout("ps", &args)?))
    }

    async fn open_files(&self, pids: &[u32]) -> Result<Vec<PathBuf>, MuxError> {
        if pids.is_empty() {
            return Ok(Vec::new());
        }
        let list = pids.iter().map(u32::to_string).collect::<Vec<_>>().join(",");
        let args = vec!["-n".to_string(), "-P".into(), "-F".into(), "pn".into(), "-p".into(), list];
        // lsof exits 1 when some pids have vanished; the listing is still usable.
        let out = run_command("lsof", &args, None, self.timeout).await?;
        Ok(parse_lsof(&out.stdout))
    }
}

fn parse_ps(stdout: &str) -> Vec<(u32, u32)> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let pid = fields.next()?.parse().ok()?;
            let ppid = fields.next()?.parse().ok()?;
            Some((pid, ppid))
        })
        .collect()
}

fn parse_lsof(stdout: &str) -> Vec<PathBuf> {
    stdout
        .lines()
        .filter_map(|line| line.strip_prefix('n'))
        .filter(|name| name.starts_with('/'))
        .map(PathBuf::from)
        .collect()
}

/// `root` and every transitive child.
fn descendants(root: u32, edges: &[(u32, u32)]) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for &(pid, ppid) in edges {
        children.entry(ppid).or_default().push(pid);
    }
    let mut seen = HashSet::from([root]);
    let mut queue = VecDeque::from([root]);
    let mut out = Vec::new();
    while let Some(pid) = queue.pop_front() {
        out.push(pid);
        for &child in children.get(&pid).into_iter().flatten() {
            if seen.insert(child) {
                queue.push_back(child);
            }
        }
    }
    out
}

/// First JSONL record of a session log.
#[derive(Debug, Deserialize)]
struct LogRecord {
    #[serde(rename = "type", default)]
    record_type: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    cwd: Option<String>,
}

#[derive(Debug, Default)]
struct LogHeader {
    /// Id from a codex `session_meta` record.
    meta_id: Option<String>,
    cwd: Option<String>,
}

async fn read_header(path: &Path) -> Option<LogHeader> {
    let file = tokio::fs::File::open(path).await.ok()?;
    let mut lines = BufReader::new(file).lines();
    let first = loop {
        let line = lines.next_line().await.ok()??;
        if !line.trim().is_empty() {
            break line;
        }
    };
    let record: LogRecord = serde_json::from_str(&first).ok()?;
    if record.record_type == "session_meta" {
        let field = |k: &str| {
            record
                .payload
                .get(k)
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        return Some(LogHeader {
            meta_id: field("id"),
            cwd: field("cwd"),
        });
    }
    Some(LogHeader {
        meta_id: None,
        cwd: record.cwd,
    })
}

async fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    let modified: SystemTime = meta.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}

async fn list_jsonl(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return out;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "jsonl") {
            out.push(path);
        }
    }
    out
}

#[derive(Clone)]
struct SearchContext {
    inspector: Arc<dyn ProcessInspector>,
    claude_projects_dir: PathBuf,
    codex_sessions_dir: PathBuf,
    scoring: ResumeScoring,
}

impl SearchContext {
    async fn search(&self, pane: &PaneDetail) -> ResolveOutcome {
        let agent = pane.agent();
        match agent {
            AgentKind::Claude => {
                let candidates = self.claude_history(pane).await;
                self.pick(candidates, ResumeSource::History, agent)
            }
            AgentKind::Codex => {
                let candidates = self.codex_open_files(pane).await;
                if !candidates.is_empty() {
                    return self.pick(candidates, ResumeSource::Lsof, agent);
                }
                let candidates = self.codex_history(pane).await;
                self.pick(candidates, ResumeSource::History, agent)
            }
            AgentKind::Unknown => Err(ResolveFailure {
                reason: ResolveFailureReason::Unsupported,
                agent,
            }),
        }
    }

    fn pick(&self, mut candidates: Vec<ScoredCandidate>, source: ResumeSource, agent: AgentKind) -> ResolveOutcome {
        candidates.sort_by(|a, b| b.score.cmp(&a.score));
        let fail = |reason| -> ResolveOutcome { Err(ResolveFailure { reason, agent }) };
        match candidates.as_slice() {
            [] => fail(ResolveFailureReason::NotFound),
            [first, second, ..] if first.score == second.score => {
                debug!(pane_agent = agent.as_str(), score = first.score, "ambiguous resume candidates");
                fail(ResolveFailureReason::Ambiguous)
            }
            [best, ..] => Ok(ResolvedSession {
                session_id: best.session_id.clone(),
                source,
                confidence: best.confidence,
            }),
        }
    }

    fn last_event(pane: &PaneDetail) -> DateTime<Utc> {
        pane.summary.last_event_at.unwrap_or_else(Utc::now)
    }

    /// Files without a usable session id yield nothing.
    async fn score_file(&self, path: &Path, pane: &PaneDetail, require_meta: bool) -> Option<ScoredCandidate> {
        let header = read_header(path).await.unwrap_or_default();
        let session_id = match header.meta_id.clone() {
            Some(id) => id,
            None if require_meta => return None,
            None => path.file_stem()?.to_str()?.to_string(),
        };
        let modified = modified_at(path).await?;
        let score = self.scoring.score(
            header.cwd.as_deref(),
            &pane.summary.current_path,
            modified,
            Self::last_event(pane),
        );
        Some(ScoredCandidate {
            session_id,
            score,
            confidence: self.scoring.confidence(score),
        })
    }

    async fn score_all(&self, paths: Vec<PathBuf>, pane: &PaneDetail, require_meta: bool) -> Vec<ScoredCandidate> {
        let mut best: HashMap<String, ScoredCandidate> = HashMap::new();
        for path in paths {
            let Some(candidate) = self.score_file(&path, pane, require_meta).await else {
                continue;
            };
            match best.get(&candidate.session_id) {
                Some(existing) if existing.score >= candidate.score => {}
                _ => {
                    best.insert(candidate.session_id.clone(), candidate);
                }
            }
        }
        best.into_values().collect()
    }

    async fn claude_history(&self, pane: &PaneDetail) -> Vec<ScoredCandidate> {
        let dir = self
            .claude_projects_dir
            .join(encode_claude_project(&pane.summary.current_path));
        let files = list_jsonl(&dir).await;
        self.score_all(files, pane, false).await
    }

    async fn codex_history(&self, pane: &PaneDetail) -> Vec<ScoredCandidate> {
        let day = Self::last_event(pane).date_naive();
        let mut files = Vec::new();
        for date in [Some(day), day.pred_opt()].into_iter().flatten() {
            let dir = self
                .codex_sessions_dir
                .join(format!("{:04}", date.year()))
                .join(format!("{:02}", date.month()))
                .join(format!("{:02}", date.day()));
            files.extend(list_jsonl(&dir).await);
        }
        self.score_all(files, pane, true).await
    }

    async fn codex_open_files(&self, pane: &PaneDetail) -> Vec<ScoredCandidate> {
        let Some(root) = pane.pane_pid else {
            return Vec::new();
        };
        let files = match self.inspector.process_edges().await {
            Ok(edges) => {
                let pids = descendants(root, &edges);
                self.inspector.open_files(&pids).await
            }
            Err(e) => Err(e),
        };
        let files = match files {
            Ok(files) => files,
            Err(e) => {
                debug!(pane_id = pane.pane_id(), error = %e, "process inspection unavailable");
                return Vec::new();
            }
        };
        let logs: Vec<PathBuf> = files
            .into_iter()
            .filter(|p| p.starts_with(&self.codex_sessions_dir))
            .filter(|p| p.extension().is_some_and(|e| e == "jsonl"))
            .collect();
        self.score_all(logs, pane, true).await
    }
}

type InFlight = Shared<BoxFuture<'static, ResolveOutcome>>;

pub struct SessionResolver {
    ctx: SearchContext,
    in_flight: Arc<Mutex<HashMap<String, InFlight>>>,
}

impl SessionResolver {
    pub fn new(
        inspector: Arc<dyn ProcessInspector>,
        claude_projects_dir: PathBuf,
        codex_sessions_dir: PathBuf,
        scoring: ResumeScoring,
    ) -> Self {
        Self {
            ctx: SearchContext {
                inspector,
                claude_projects_dir,
                codex_sessions_dir,
                scoring,
            },
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn resolve(&self, pane: &PaneDetail, requested: AgentKind) -> ResolveOutcome {
        let agent = pane.agent();
        if !agent.is_supported() {
            return Err(ResolveFailure {
                reason: ResolveFailureReason::Unsupported,
                agent,
            });
        }
        if agent != requested {
            return Err(ResolveFailure {
                reason: ResolveFailureReason::InvalidInput,
                agent,
            });
        }
        if agent == AgentKind::Claude {
            if let Some(id) = pane.agent_session_id.as_deref().filter(|s| !s.trim().is_empty()) {
                return Ok(ResolvedSession {
                    session_id: id.to_string(),
                    source: ResumeSource::Hook,
                    confidence: Confidence::High,
                });
            }
        }

        let key = format!("{}:{}", pane.pane_id(), agent.as_str());
        let shared = {
            let mut in_flight = self
                .in_flight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match in_flight.get(&key) {
                Some(existing) => existing.clone(),
                None => {
                    let ctx = self.ctx.clone();
                    let pane = pane.clone();
                    let map = Arc::clone(&self.in_flight);
                    let map_key = key.clone();
                    let fut = async move {
                        let outcome = ctx.search(&pane).await;
                        if let Ok(mut map) = map.lock() {
                            map.remove(&map_key);
                        }
                        outcome
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(key, fut.clone());
                    fut
                }
            }
        };
        shared.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::tests::pane;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct FakeInspector {
        edges: Vec<(u32, u32)>,
        files: Vec<PathBuf>,
        edge_calls: AtomicUsize,
    }

    #[async_trait]
    impl ProcessInspector for FakeInspector {
        async fn process_edges(&self) -> Result<Vec<(u32, u32)>, MuxError> {
            self.edge_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.edges.clone())
        }

        async fn open_files(&self, _pids: &[u32]) -> Result<Vec<PathBuf>, MuxError> {
            Ok(self.files.clone())
        }
    }

    fn inspector(edges: Vec<(u32, u32)>, files: Vec<PathBuf>) -> Arc<FakeInspector> {
        Arc::new(FakeInspector {
            edges,
            files,
            edge_calls: AtomicUsize::new(0),
        })
    }

    fn resolver(tmp: &TempDir, inspector: Arc<FakeInspector>) -> SessionResolver {
        SessionResolver::new(
            inspector,
            tmp.path().join("claude"),
            tmp.path().join("codex"),
            ResumeScoring::default(),
        )
    }

    fn write(path: &Path, first_line: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, format!("{first_line}\n{{\"type\":\"event_msg\"}}\n")).unwrap();
    }

    fn codex_meta(id: &str, cwd: &str) -> String {
        serde_json::json!({"type": "session_meta", "payload": {"id": id, "cwd": cwd}}).to_string()
    }

    fn codex_day_dir(tmp: &TempDir) -> PathBuf {
        let today = Utc::now().date_naive();
        tmp.path()
            .join("codex")
            .join(format!("{:04}", today.year()))
            .join(format!("{:02}", today.month()))
            .join(format!("{:02}", today.day()))
    }

    #[test]
    fn scoring_thresholds() {
        let s = ResumeScoring::default();
        assert_eq!(s.confidence(130), Confidence::High);
        assert_eq!(s.confidence(30), Confidence::Medium);
        assert_eq!(s.confidence(10), Confidence::Low);

        let now = Utc::now();
        assert_eq!(s.score(Some("/repo/"), "/repo", now, now), 130);
        assert_eq!(s.score(None, "/repo", now - chrono::Duration::minutes(20), now), 10);
        assert_eq!(s.score(Some("/other"), "/repo", now - chrono::Duration::hours(2), now), 0);
    }

    #[test]
    fn process_tree_helpers() {
        let edges = parse_ps("  100     1\n  200   100\n  300   200\n  400     1\n");
        let mut tree = descendants(100, &edges);
        tree.sort();
        assert_eq!(tree, vec![100, 200, 300]);

        let files = parse_lsof("p200\nfcwd\nn/home/dev\nf3\nn/tmp/x.jsonl\n");
        assert_eq!(files, vec![PathBuf::from("/home/dev"), PathBuf::from("/tmp/x.jsonl")]);
    }

    #[test]
    fn claude_project_encoding() {
        assert_eq!(encode_claude_project("/home/dev/my.project/"), "-home-dev-my-project");
    }

    #[tokio::test]
    async fn rejects_unsupported_and_mismatched_agents() {
        let tmp = TempDir::new().unwrap();
        let r = resolver(&tmp, inspector(vec![], vec![]));

        let err = r.resolve(&pane("%1", AgentKind::Unknown), AgentKind::Claude).await.unwrap_err();
        assert_eq!(err.reason, ResolveFailureReason::Unsupported);

        let err = r.resolve(&pane("%1", AgentKind::Claude), AgentKind::Codex).await.unwrap_err();
        assert_eq!(err.reason, ResolveFailureReason::InvalidInput);
    }

    #[tokio::test]
    async fn claude_hook_id_wins() {
        let tmp = TempDir::new().unwrap();
        let r = resolver(&tmp, inspector(vec![], vec![]));
        let mut p = pane("%1", AgentKind::Claude);
        p.agent_session_id = Some("hook-id".into());

        let resolved = r.resolve(&p, AgentKind::Claude).await.unwrap();
        assert_eq!(resolved.session_id, "hook-id");
        assert_eq!(resolved.source, ResumeSource::Hook);
        assert_eq!(resolved.confidence, Confidence::High);
    }

    #[tokio::test]
    async fn claude_history_prefers_matching_cwd() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("claude").join(encode_claude_project("/home/dev/project"));
        write(&dir.join("aaa.jsonl"), r#"{"type":"user","cwd":"/home/dev/project"}"#);
        write(&dir.join("bbb.jsonl"), r#"{"type":"user","cwd":"/elsewhere"}"#);

        let r = resolver(&tmp, inspector(vec![], vec![]));
        let resolved = r.resolve(&pane("%1", AgentKind::Claude), AgentKind::Claude).await.unwrap();
        assert_eq!(resolved.session_id, "aaa");
        assert_eq!(resolved.source, ResumeSource::History);
        assert_eq!(resolved.confidence, Confidence::High);
    }

    #[tokio::test]
    async fn tied_history_is_ambiguous() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("claude").join(encode_claude_project("/home/dev/project"));
        write(&dir.join("one.jsonl"), r#"{"type":"summary"}"#);
        write(&dir.join("two.jsonl"), r#"{"type":"summary"}"#);

        let r = resolver(&tmp, inspector(vec![], vec![]));
        let err = r.resolve(&pane("%1", AgentKind::Claude), AgentKind::Claude).await.unwrap_err();
        assert_eq!(err.reason, ResolveFailureReason::Ambiguous);
    }

    #[tokio::test]
    async fn empty_history_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let r = resolver(&tmp, inspector(vec![], vec![]));
        let err = r.resolve(&pane("%1", AgentKind::Codex), AgentKind::Codex).await.unwrap_err();
        assert_eq!(err.reason, ResolveFailureReason::NotFound);
        assert_eq!(err.agent, AgentKind::Codex);
    }

    #[tokio::test]
    async fn codex_uses_open_session_logs() {
        let tmp = TempDir::new().unwrap();
        let day = codex_day_dir(&tmp);
        let held = day.join("rollout-a.jsonl");
        let no_meta = day.join("rollout-b.jsonl");
        write(&held, &codex_meta("sess-held", "/home/dev/project"));
        write(&no_meta, r#"{"type":"event_msg"}"#);
        let unrelated = tmp.path().join("notes.jsonl");
        write(&unrelated, &codex_meta("sess-unrelated", "/home/dev/project"));

        let fake = inspector(vec![(5000, 4242)], vec![held, no_meta, unrelated]);
        let r = resolver(&tmp, fake.clone());
        let resolved = r.resolve(&pane("%1", AgentKind::Codex), AgentKind::Codex).await.unwrap();
        assert_eq!(resolved.session_id, "sess-held");
        assert_eq!(resolved.source, ResumeSource::Lsof);
        assert_eq!(resolved.confidence, Confidence::High);
        assert_eq!(fake.edge_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn codex_falls_back_to_dated_history() {
        let tmp = TempDir::new().unwrap();
        let day = codex_day_dir(&tmp);
        write(&day.join("rollout-1.jsonl"), &codex_meta("sess-old", "/elsewhere"));
        write(&day.join("rollout-2.jsonl"), &codex_meta("sess-here", "/home/dev/project/"));

        let r = resolver(&tmp, inspector(vec![], vec![]));
        let resolved = r.resolve(&pane("%1", AgentKind::Codex), AgentKind::Codex).await.unwrap();
        assert_eq!(resolved.session_id, "sess-here");
        assert_eq!(resolved.source, ResumeSource::History);
    }

    #[tokio::test]
    async fn ambiguous_open_logs_do_not_fall_through() {
        let tmp = TempDir::new().unwrap();
        write(&codex_day_dir(&tmp).join("rollout-c.jsonl"), &codex_meta("sess-c", "/home/dev/project"));
        let held = tmp.path().join("codex/2020/01/01");
        let a = held.join("rollout-a.jsonl");
        let b = held.join("rollout-b.jsonl");
        write(&a, &codex_meta("sess-a", "/home/dev/project"));
        write(&b, &codex_meta("sess-b", "/home/dev/project"));

        let r = resolver(&tmp, inspector(vec![], vec![a, b]));
        let err = r.resolve(&pane("%1", AgentKind::Codex), AgentKind::Codex).await.unwrap_err();
        assert_eq!(err.reason, ResolveFailureReason::Ambiguous);
    }
}
