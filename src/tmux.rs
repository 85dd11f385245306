//! # Tmux adapter
//!
//! Everything that touches the multiplexer goes through [`MuxRunner::run`]:
//! one tmux invocation per call, exit code plus captured output back. The
//! [`Tmux`] wrapper builds the handful of commands the server needs on top
//! of it, so tests swap in a scripted runner and never spawn tmux.
//!
//! ## Pane listing format
//!
//! `list-panes -a` is asked for tab-separated fields (see [`PANE_FORMAT`]);
//! tab cannot appear in tmux session or window names we create.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{ApiError, MuxError};
use crate::exec::{run_command, CommandOutput};
use crate::sessions::{AgentKind, PaneDetail, PaneSummary};

pub const PANE_FORMAT: &str = "#{pane_id}\t#{session_name}\t#{window_index}\t#{pane_index}\t#{window_name}\t#{pane_current_command}\t#{pane_current_path}\t#{pane_pid}\t#{pane_active}";

/// Delay between a literal send and its submit key, so the agent's input
/// box has consumed the text before Enter lands.
const SUBMIT_DELAY: Duration = Duration::from_millis(100);

/// Run one multiplexer command.
#[async_trait]
pub trait MuxRunner: Send + Sync {
    async fn run(&self, args: &[String]) -> Result<CommandOutput, MuxError>;
}

/// Runs the real `tmux` binary, optionally on a dedicated socket (`-L`).
pub struct TmuxRunner {
    binary: String,
    socket_name: Option<String>,
    timeout: Duration,
}

impl TmuxRunner {
    pub fn new(binary: impl Into<String>, socket_name: Option<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            socket_name,
            timeout,
        }
    }
}

#[async_trait]
impl MuxRunner for TmuxRunner {
    async fn run(&self, args: &[String]) -> Result<CommandOutput, MuxError> {
        let mut full = Vec::with_capacity(args.len() + 2);
        if let Some(socket) = &self.socket_name {
            full.push("-L".to_string());
            full.push(socket.clone());
        }
        full.extend_from_slice(args);
        run_command(&self.binary, &full, None, self.timeout).await
    }
}

/// Window created by `new-window -P`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedWindow {
    pub window_id: String,
    pub window_index: u32,
    pub window_name: String,
    pub pane_id: String,
}

/// Parse `#{window_id}\t#{window_index}\t#{window_name}\t#{pane_id}`.
pub fn parse_created_window(stdout: &str) -> Result<CreatedWindow, ApiError> {
    let line = stdout.lines().find(|l| !l.trim().is_empty()).unwrap_or_default();
    let fields: Vec<&str> = line.trim_end_matches('\r').split('\t').collect();
    let field = |i: usize| fields.get(i).map(|s| s.trim()).filter(|s| !s.is_empty());

    let (Some(window_id), Some(index), Some(window_name), Some(pane_id)) =
        (field(0), field(1), field(2), field(3))
    else {
        return Err(ApiError::internal(format!(
            "unexpected new-window output: {:?}",
            stdout.trim()
        )));
    };
    let window_index = index.parse::<u32>().map_err(|_| {
        ApiError::internal(format!("new-window returned non-numeric window index {index:?}"))
    })?;

    Ok(CreatedWindow {
        window_id: window_id.to_string(),
        window_index,
        window_name: window_name.to_string(),
        pane_id: pane_id.to_string(),
    })
}

/// Parse one [`PANE_FORMAT`] line into a pane record.
pub fn parse_pane_line(line: &str) -> Option<PaneDetail> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < 9 {
        return None;
    }
    let current_command = fields[5].to_string();
    Some(PaneDetail {
        summary: PaneSummary {
            pane_id: fields[0].to_string(),
            session_name: fields[1].to_string(),
            window_index: fields[2].parse().ok()?,
            pane_index: fields[3].parse().ok()?,
            window_name: fields[4].to_string(),
            agent: AgentKind::from_command(&current_command),
            current_command,
            current_path: fields[6].to_string(),
            pane_active: fields[8].trim() == "1",
            last_event_at: None,
            last_input_at: None,
        },
        pane_pid: fields[7].parse().ok(),
        agent_session_id: None,
    })
}

fn is_missing_target(stderr: &str) -> bool {
    stderr.contains("can't find session") || stderr.contains("no server running")
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Typed tmux commands over a [`MuxRunner`].
#[derive(Clone)]
pub struct Tmux {
    runner: Arc<dyn MuxRunner>,
}

impl Tmux {
    pub fn new(runner: Arc<dyn MuxRunner>) -> Self {
        Self { runner }
    }

    pub async fn run(&self, args: Vec<String>) -> Result<CommandOutput, MuxError> {
        self.runner.run(&args).await
    }

    /// Run and require exit code 0.
    pub async fn run_ok(&self, args: Vec<String>) -> Result<String, MuxError> {
        let out = self.runner.run(&args).await?;
        out.into_stdout("tmux", &args)
    }

    pub async fn list_panes(&self) -> Result<Vec<PaneDetail>, MuxError> {
        let cmd = args(&["list-panes", "-a", "-F", PANE_FORMAT]);
        let out = self.run(cmd.clone()).await?;
        // No server running means no panes, not an error.
        if out.stderr.contains("no server running") || out.stderr.contains("error connecting") {
            return Ok(Vec::new());
        }
        let stdout = out.into_stdout("tmux", &cmd)?;
        Ok(stdout.lines().filter_map(parse_pane_line).collect())
    }

    pub async fn has_session(&self, session: &str) -> Result<bool, MuxError> {
        let out = self
            .run(vec!["has-session".into(), "-t".into(), format!("={session}")])
            .await?;
        Ok(out.success())
    }

    /// Working directory of the first pane in `session`; `None` when the
    /// session does not exist.
    pub async fn first_pane_path(&self, session: &str) -> Result<Option<PathBuf>, MuxError> {
        let cmd = vec![
            "list-panes".into(),
            "-s".into(),
            "-t".into(),
            format!("={session}"),
            "-F".into(),
            "#{pane_current_path}".into(),
        ];
        let out = self.run(cmd.clone()).await?;
        if !out.success() && is_missing_target(&out.stderr) {
            return Ok(None);
        }
        let stdout = out.into_stdout("tmux", &cmd)?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(PathBuf::from))
    }

    pub async fn list_window_names(&self, session: &str) -> Result<Vec<String>, MuxError> {
        let stdout = self
            .run_ok(vec![
                "list-windows".into(),
                "-t".into(),
                format!("={session}"),
                "-F".into(),
                "#{window_name}".into(),
            ])
            .await?;
        Ok(stdout.lines().map(|l| l.trim().to_string()).collect())
    }

    /// Create a detached window; returns raw `-P` output for the caller to parse.
    pub async fn new_window(&self, session: &str, name: &str, cwd: Option<&str>) -> Result<String, MuxError> {
        let mut cmd = vec![
            "new-window".to_string(),
            "-d".into(),
            "-P".into(),
            "-F".into(),
            "#{window_id}\t#{window_index}\t#{window_name}\t#{pane_id}".into(),
            "-t".into(),
            format!("={session}:"),
            "-n".into(),
            name.to_string(),
        ];
        if let Some(dir) = cwd {
            cmd.push("-c".into());
            cmd.push(dir.to_string());
        }
        self.run_ok(cmd).await
    }

    pub async fn kill_window(&self, window_id: &str) -> Result<(), MuxError> {
        self.run_ok(args(&["kill-window", "-t", window_id])).await.map(|_| ())
    }

    /// Leave copy/scroll mode if the pane is in it; a no-op otherwise.
    pub async fn exit_copy_mode(&self, pane_id: &str) -> Result<(), MuxError> {
        self.run_ok(args(&["copy-mode", "-q", "-t", pane_id])).await.map(|_| ())
    }

    pub async fn send_literal(&self, pane_id: &str, text: &str) -> Result<(), MuxError> {
        self.run_ok(args(&["send-keys", "-t", pane_id, "-l", "--", text]))
            .await
            .map(|_| ())
    }

    pub async fn send_key(&self, pane_id: &str, key: &str) -> Result<(), MuxError> {
        self.run_ok(args(&["send-keys", "-t", pane_id, key])).await.map(|_| ())
    }

    pub async fn pane_current_command(&self, pane_id: &str) -> Result<String, MuxError> {
        let stdout = self
            .run_ok(args(&["display-message", "-p", "-t", pane_id, "#{pane_current_command}"]))
            .await?;
        Ok(stdout.trim().to_string())
    }

    /// Capture the last `lines` lines with escape sequences preserved.
    pub async fn capture_pane(&self, pane_id: &str, lines: u32) -> Result<(String, bool), MuxError> {
        let alternate = self
            .run_ok(args(&["display-message", "-p", "-t", pane_id, "#{alternate_on}"]))
            .await?;
        let alternate_on = alternate.trim() == "1";
        let start = if alternate_on { "0".to_string() } else { format!("-{lines}") };
        let screen = self
            .run_ok(vec![
                "capture-pane".into(),
                "-p".into(),
                "-e".into(),
                "-J".into(),
                "-t".into(),
                pane_id.to_string(),
                "-S".into(),
                start,
            ])
            .await?;
        Ok((screen, alternate_on))
    }
}

/// Input actions against a pane.
#[async_trait]
pub trait PaneActions: Send + Sync {
    async fn send_text(&self, pane_id: &str, text: &str, enter: bool) -> Result<(), ApiError>;
    async fn send_keys(&self, pane_id: &str, keys: &[String]) -> Result<(), ApiError>;
}

/// [`PaneActions`] backed by `send-keys`.
pub struct TmuxPaneActions {
    tmux: Tmux,
    submit_key: String,
}

impl TmuxPaneActions {
    pub fn new(tmux: Tmux, submit_key: impl Into<String>) -> Self {
        Self {
            tmux,
            submit_key: submit_key.into(),
        }
    }
}

#[async_trait]
impl PaneActions for TmuxPaneActions {
    async fn send_text(&self, pane_id: &str, text: &str, enter: bool) -> Result<(), ApiError> {
        let normalized = text.replace("\r\n", "\n");
        debug!(pane_id, len = normalized.len(), enter, "send text");
        self.tmux.exit_copy_mode(pane_id).await?;
        self.tmux.send_literal(pane_id, &normalized).await?;
        if enter {
            tokio::time::sleep(SUBMIT_DELAY).await;
            self.tmux.send_key(pane_id, &self.submit_key).await?;
        }
        Ok(())
    }

    async fn send_keys(&self, pane_id: &str, keys: &[String]) -> Result<(), ApiError> {
        debug!(pane_id, ?keys, "send keys");
        for key in keys {
            self.tmux.send_key(pane_id, key).await?;
        }
        Ok(())
    }
}
