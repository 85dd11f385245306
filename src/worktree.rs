//! Git worktree lookup and the external worktree tool.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use crate::error::MuxError;
use crate::exec::run_command;
use crate::resume::normalize_path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head: Option<String>,
}

/// Worktrees of one repository; the first entry is the main worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeSnapshot {
    pub repo_root: PathBuf,
    pub entries: Vec<WorktreeEntry>,
}

impl WorktreeSnapshot {
    pub fn find_by_path(&self, path: &str) -> Option<&WorktreeEntry> {
        let wanted = normalize_path(path);
        self.entries
            .iter()
            .find(|e| e.path.to_str().map(normalize_path) == Some(wanted))
    }

    pub fn find_by_branch(&self, branch: &str) -> Option<&WorktreeEntry> {
        let wanted = branch.strip_prefix("refs/heads/").unwrap_or(branch);
        self.entries
            .iter()
            .find(|e| e.branch.as_deref() == Some(wanted))
    }
}

/// Parse `git worktree list --porcelain`.
pub fn parse_porcelain(text: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;
    for line in text.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            entries.extend(current.take());
            current = Some(WorktreeEntry {
                path: PathBuf::from(path),
                branch: None,
                head: None,
            });
        } else if let Some(entry) = current.as_mut() {
            if let Some(head) = line.strip_prefix("HEAD ") {
                entry.head = Some(head.to_string());
            } else if let Some(branch) = line.strip_prefix("branch ") {
                entry.branch = Some(branch.strip_prefix("refs/heads/").unwrap_or(branch).to_string());
            }
        }
    }
    entries.extend(current);
    entries
}

#[async_trait]
pub trait WorktreeProvider: Send + Sync {
    /// Worktrees of the repository containing `cwd`; `Ok(None)` outside a
    /// repo, `Err` when git itself could not answer.
    async fn resolve(&self, cwd: &Path, refresh: bool) -> Result<Option<WorktreeSnapshot>, MuxError>;
}

pub struct GitWorktreeProvider {
    git: String,
    timeout: Duration,
    ttl: Duration,
    cache: Mutex<HashMap<PathBuf, (Instant, WorktreeSnapshot)>>,
}

impl GitWorktreeProvider {
    pub fn new(git: impl Into<String>, timeout: Duration, ttl: Duration) -> Self {
        Self {
            git: git.into(),
            timeout,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, cwd: &Path) -> Option<WorktreeSnapshot> {
        let cache = self.cache.lock().ok()?;
        let (at, snapshot) = cache.get(cwd)?;
        (at.elapsed() < self.ttl).then(|| snapshot.clone())
    }
}

#[async_trait]
impl WorktreeProvider for GitWorktreeProvider {
    async fn resolve(&self, cwd: &Path, refresh: bool) -> Result<Option<WorktreeSnapshot>, MuxError> {
        if !refresh {
            if let Some(snapshot) = self.cached(cwd) {
                return Ok(Some(snapshot));
            }
        }
        let args = vec!["worktree".to_string(), "list".into(), "--porcelain".into()];
        let out = run_command(&self.git, &args, Some(cwd), self.timeout).await?;
        if !out.success() && out.stderr.contains("not a git repository") {
            debug!(cwd = %cwd.display(), "not a git worktree");
            return Ok(None);
        }
        let stdout = out.into_stdout(&self.git, &args)?;
        let entries = parse_porcelain(&stdout);
        let Some(repo_root) = entries.first().map(|e| e.path.clone()) else {
            return Ok(None);
        };
        let snapshot = WorktreeSnapshot { repo_root, entries };
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(cwd.to_path_buf(), (Instant::now(), snapshot.clone()));
        }
        Ok(Some(snapshot))
    }
}

/// Branch switching/creation tool (`wt`).
#[async_trait]
pub trait WorktreeTool: Send + Sync {
    async fn current_branch(&self, repo: &Path) -> Result<Option<String>, MuxError>;
    /// Create a worktree for `branch` (creating the branch too).
    async fn switch_create(&self, repo: &Path, branch: &str) -> Result<(), MuxError>;
    async fn switch(&self, repo: &Path, branch: &str) -> Result<(), MuxError>;
}

pub struct WtCli {
    program: String,
    git: String,
    timeout: Duration,
}

impl WtCli {
    pub fn new(program: impl Into<String>, git: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            git: git.into(),
            timeout,
        }
    }

    async fn run_wt(&self, repo: &Path, args: Vec<String>) -> Result<(), MuxError> {
        let out = run_command(&self.program, &args, Some(repo), self.timeout).await?;
        out.into_stdout(&self.program, &args).map(|_| ())
    }
}

#[async_trait]
impl WorktreeTool for WtCli {
    async fn current_branch(&self, repo: &Path) -> Result<Option<String>, MuxError> {
        let args = vec!["branch".to_string(), "--show-current".into()];
        let out = run_command(&self.git, &args, Some(repo), self.timeout).await?;
        let branch = out.into_stdout(&self.git, &args)?.trim().to_string();
        Ok((!branch.is_empty()).then_some(branch))
    }

    async fn switch_create(&self, repo: &Path, branch: &str) -> Result<(), MuxError> {
        self.run_wt(repo, vec!["switch".into(), "--create".into(), branch.to_string()])
            .await
    }

    async fn switch(&self, repo: &Path, branch: &str) -> Result<(), MuxError> {
        self.run_wt(repo, vec!["switch".into(), branch.to_string()]).await
    }
}
