//! Launch (or resume) an agent in a fresh tmux window.
//!
//! The pipeline is linear: validate, resolve the resume plan and the working
//! directory, check the target session, pick a free window name, create the
//! window, type the agent command, then watch the pane until the agent shows
//! up. Any failure after the window exists kills it again, and the outcome of
//! that rollback is reported with the error.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::BackendKind;
use crate::error::{ApiError, ErrorCode};
use crate::idempotency::Outcome;
use crate::resume::{Confidence, ResolveFailureReason, ResumeSource, SessionResolver};
use crate::sessions::{AgentKind, PaneRegistry};
use crate::tmux::{parse_created_window, Tmux};
use crate::worktree::{WorktreeEntry, WorktreeProvider, WorktreeSnapshot, WorktreeTool};

/// Highest numeric suffix tried when the base window name is taken.
const MAX_WINDOW_SUFFIX: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumePolicy {
    Required,
    BestEffort,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LaunchRequest {
    pub session_name: String,
    pub agent: AgentKind,
    #[serde(default)]
    pub window_name: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub agent_options: Vec<String>,
    #[serde(default)]
    pub worktree_path: Option<String>,
    #[serde(default)]
    pub worktree_branch: Option<String>,
    #[serde(default)]
    pub worktree_create_if_missing: bool,
    #[serde(default)]
    pub resume_session_id: Option<String>,
    #[serde(default)]
    pub resume_from_pane_id: Option<String>,
    #[serde(default)]
    pub resume_policy: Option<ResumePolicy>,
    #[serde(default)]
    pub request_id: Option<String>,
}

impl LaunchRequest {
    fn uses_worktree(&self) -> bool {
        self.worktree_path.is_some() || self.worktree_branch.is_some() || self.worktree_create_if_missing
    }

    fn manual_session_id(&self) -> Option<&str> {
        non_blank(self.resume_session_id.as_deref())
    }

    fn resume_pane_id(&self) -> Option<&str> {
        non_blank(self.resume_from_pane_id.as_deref())
    }

    /// Dedupe key: `session_name:request_id`.
    pub fn dedupe_key(&self) -> Option<String> {
        non_blank(self.request_id.as_deref()).map(|id| format!("{}:{id}", self.session_name))
    }

    /// The request without its request id, for fingerprinting.
    pub fn without_request_id(&self) -> Self {
        Self {
            request_id: None,
            ..self.clone()
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.trim().is_empty())
}

fn has_control_chars(value: &str) -> bool {
    value.chars().any(char::is_control)
}

/// Side-effect-free request checks.
pub fn validate(req: &LaunchRequest) -> Result<(), ApiError> {
    if req.session_name.trim().is_empty() {
        return Err(ApiError::invalid("sessionName is required"));
    }
    if !req.agent.is_supported() {
        return Err(ApiError::invalid("agent must be claude or codex"));
    }
    if let Some(name) = &req.window_name {
        if name.contains(['\0', '\r', '\n', '\t']) {
            return Err(ApiError::invalid("windowName contains control characters"));
        }
    }
    if req.cwd.is_some() && req.uses_worktree() {
        return Err(ApiError::invalid("cwd cannot be combined with worktree options"));
    }
    if req.worktree_create_if_missing && req.worktree_path.is_some() {
        return Err(ApiError::invalid("worktreeCreateIfMissing cannot be combined with worktreePath"));
    }
    if req.worktree_create_if_missing && non_blank(req.worktree_branch.as_deref()).is_none() {
        return Err(ApiError::invalid("worktreeCreateIfMissing requires worktreeBranch"));
    }
    if req.agent_options.iter().any(|o| has_control_chars(o)) {
        return Err(ApiError::invalid("agentOptions contain control characters"));
    }
    if req.manual_session_id().is_some_and(has_control_chars) {
        return Err(ApiError::invalid("resumeSessionId contains control characters"));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeMeta {
    pub requested: bool,
    pub reused: bool,
    pub session_id: Option<String>,
    pub source: Option<ResumeSource>,
    pub confidence: Confidence,
    pub policy: Option<ResumePolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<ResolveFailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<ResolveFailureReason>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaunchResumePlan {
    pub requested: bool,
    pub effective_policy: Option<ResumePolicy>,
    pub resolved_session_id: Option<String>,
    pub meta: Option<ResumeMeta>,
    pub error: Option<ApiError>,
}

impl LaunchResumePlan {
    fn none() -> Self {
        Self {
            requested: false,
            effective_policy: None,
            resolved_session_id: None,
            meta: None,
            error: None,
        }
    }
}

fn failure_code(reason: ResolveFailureReason) -> ErrorCode {
    match reason {
        ResolveFailureReason::NotFound => ErrorCode::NotFound,
        ResolveFailureReason::Unsupported
        | ResolveFailureReason::InvalidInput
        | ResolveFailureReason::Ambiguous => ErrorCode::InvalidPayload,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Verified,
    Mismatch,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchVerification {
    pub status: VerificationStatus,
    pub observed_command: Option<String>,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchAgentResult {
    pub session_name: String,
    pub agent: AgentKind,
    pub window_id: String,
    pub window_index: u32,
    pub window_name: String,
    pub pane_id: String,
    pub command: String,
    pub cwd: Option<String>,
    pub worktree_path: Option<String>,
    pub worktree_branch: Option<String>,
    pub verification: LaunchVerification,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackOutcome {
    pub attempted: bool,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<LaunchAgentResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume: Option<ResumeMeta>,
    pub rollback: RollbackOutcome,
}

impl LaunchResult {
    pub fn failed(error: ApiError, resume: Option<ResumeMeta>) -> Self {
        Self {
            ok: false,
            error: Some(error),
            result: None,
            resume,
            rollback: RollbackOutcome::default(),
        }
    }
}

impl Outcome for LaunchResult {
    fn is_success(&self) -> bool {
        self.ok
    }
}

/// POSIX shell quoting for one argument.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Command line typed into the new pane.
pub fn compose_command(agent: AgentKind, options: &[String], resume_id: Option<&str>) -> String {
    let mut parts = vec![agent.as_str().to_string()];
    parts.extend(options.iter().cloned());
    if let Some(id) = resume_id {
        match agent {
            AgentKind::Codex => parts.extend(["resume".to_string(), id.to_string()]),
            _ => parts.extend(["--resume".to_string(), id.to_string()]),
        }
    }
    parts.iter().map(|p| shell_quote(p)).collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub backend: BackendKind,
    pub submit_key: String,
    pub verify_attempts: u32,
    pub verify_interval: Duration,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Tmux,
            submit_key: "Enter".to_string(),
            verify_attempts: 5,
            verify_interval: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Default)]
struct ResolvedCwd {
    cwd: Option<String>,
    worktree_path: Option<String>,
    worktree_branch: Option<String>,
}

impl ResolvedCwd {
    fn from_worktree(entry: &WorktreeEntry) -> Self {
        let path = entry.path.to_string_lossy().into_owned();
        Self {
            cwd: Some(path.clone()),
            worktree_path: Some(path),
            worktree_branch: entry.branch.clone(),
        }
    }
}

pub struct LaunchOrchestrator {
    tmux: Tmux,
    registry: Arc<PaneRegistry>,
    resolver: Arc<SessionResolver>,
    worktrees: Arc<dyn WorktreeProvider>,
    worktree_tool: Arc<dyn WorktreeTool>,
    settings: LaunchSettings,
}

impl LaunchOrchestrator {
    pub fn new(
        tmux: Tmux,
        registry: Arc<PaneRegistry>,
        resolver: Arc<SessionResolver>,
        worktrees: Arc<dyn WorktreeProvider>,
        worktree_tool: Arc<dyn WorktreeTool>,
        settings: LaunchSettings,
    ) -> Self {
        Self {
            tmux,
            registry,
            resolver,
            worktrees,
            worktree_tool,
            settings,
        }
    }

    /// Run the launch pipeline. Always returns a well-formed result.
    pub async fn launch(&self, req: LaunchRequest) -> LaunchResult {
        if let Err(e) = validate(&req) {
            return LaunchResult::failed(e, None);
        }

        let plan = self.plan_resume(&req).await;
        if plan.requested {
            debug!(session = %req.session_name, policy = ?plan.effective_policy, "resume requested");
        }
        if let Some(error) = plan.error {
            return LaunchResult::failed(error, plan.meta);
        }
        let meta = plan.meta;

        let dir = match self.resolve_cwd(&req).await {
            Ok(dir) => dir,
            Err(e) => return LaunchResult::failed(e, meta),
        };
        if let Some(cwd) = &dir.cwd {
            if let Err(e) = validate_cwd(cwd).await {
                return LaunchResult::failed(e, meta);
            }
        }

        match self.tmux.has_session(&req.session_name).await {
            Ok(true) => {}
            Ok(false) => {
                return LaunchResult::failed(
                    ApiError::not_found(format!("tmux session {:?} not found", req.session_name)),
                    meta,
                )
            }
            Err(e) => return LaunchResult::failed(e.into(), meta),
        }

        let base = non_blank(req.window_name.as_deref())
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|| req.agent.as_str().to_string());
        let window_name = match self.unique_window_name(&req.session_name, &base).await {
            Ok(name) => name,
            Err(e) => return LaunchResult::failed(e, meta),
        };

        let stdout = match self
            .tmux
            .new_window(&req.session_name, &window_name, dir.cwd.as_deref())
            .await
        {
            Ok(stdout) => stdout,
            Err(e) => return LaunchResult::failed(e.into(), meta),
        };
        let window = match parse_created_window(&stdout) {
            Ok(window) => window,
            Err(e) => {
                // The id is the first field even when the rest is unusable.
                let window_id = stdout.split('\t').next().map(str::trim).filter(|id| id.starts_with('@'));
                let rollback = match window_id {
                    Some(id) => self.rollback(id).await,
                    None => RollbackOutcome::default(),
                };
                return LaunchResult {
                    rollback,
                    ..LaunchResult::failed(e, meta)
                };
            }
        };
        info!(
            session = %req.session_name,
            window_id = %window.window_id,
            pane_id = %window.pane_id,
            agent = req.agent.as_str(),
            "created agent window"
        );

        let command = compose_command(req.agent, &req.agent_options, plan.resolved_session_id.as_deref());
        if let Err(e) = self.send_command(&window.pane_id, &command).await {
            let rollback = self.rollback(&window.window_id).await;
            return LaunchResult {
                rollback,
                ..LaunchResult::failed(e, meta)
            };
        }

        let verification = self.verify(&window.pane_id, req.agent).await;
        if verification.status != VerificationStatus::Verified {
            warn!(
                pane_id = %window.pane_id,
                status = ?verification.status,
                observed = ?verification.observed_command,
                "launch not verified"
            );
        }

        LaunchResult {
            ok: true,
            error: None,
            result: Some(LaunchAgentResult {
                session_name: req.session_name.clone(),
                agent: req.agent,
                window_id: window.window_id,
                window_index: window.window_index,
                window_name: window.window_name,
                pane_id: window.pane_id,
                command,
                cwd: dir.cwd,
                worktree_path: dir.worktree_path,
                worktree_branch: dir.worktree_branch,
                verification,
            }),
            resume: meta,
            rollback: RollbackOutcome::default(),
        }
    }

    pub async fn plan_resume(&self, req: &LaunchRequest) -> LaunchResumePlan {
        let manual = req.manual_session_id();
        let from_pane = req.resume_pane_id();
        if manual.is_none() && from_pane.is_none() {
            return LaunchResumePlan::none();
        }
        let policy = req.resume_policy.unwrap_or(if manual.is_some() {
            ResumePolicy::Required
        } else {
            ResumePolicy::BestEffort
        });

        if self.settings.backend != BackendKind::Tmux {
            return LaunchResumePlan {
                requested: true,
                effective_policy: Some(policy),
                resolved_session_id: None,
                meta: Some(ResumeMeta {
                    requested: true,
                    reused: false,
                    session_id: None,
                    source: None,
                    confidence: Confidence::None,
                    policy: Some(policy),
                    failure_reason: Some(ResolveFailureReason::Unsupported),
                    fallback_reason: None,
                }),
                error: Some(ApiError::invalid("resume is only supported on the tmux backend")),
            };
        }

        if let Some(id) = manual {
            return LaunchResumePlan {
                requested: true,
                effective_policy: Some(policy),
                resolved_session_id: Some(id.trim().to_string()),
                meta: Some(ResumeMeta {
                    requested: true,
                    reused: true,
                    session_id: Some(id.trim().to_string()),
                    source: Some(ResumeSource::Manual),
                    confidence: Confidence::High,
                    policy: Some(policy),
                    failure_reason: None,
                    fallback_reason: None,
                }),
                error: None,
            };
        }

        let pane_id = from_pane.unwrap_or_default();
        let outcome = match self.registry.get_detail(pane_id) {
            Some(pane) => self.resolver.resolve(&pane, req.agent).await,
            None => Err(crate::resume::ResolveFailure {
                reason: ResolveFailureReason::NotFound,
                agent: req.agent,
            }),
        };

        match outcome {
            Ok(resolved) => {
                debug!(pane_id, session_id = %resolved.session_id, source = ?resolved.source, "resume session resolved");
                LaunchResumePlan {
                    requested: true,
                    effective_policy: Some(policy),
                    resolved_session_id: Some(resolved.session_id.clone()),
                    meta: Some(ResumeMeta {
                        requested: true,
                        reused: true,
                        session_id: Some(resolved.session_id),
                        source: Some(resolved.source),
                        confidence: resolved.confidence,
                        policy: Some(policy),
                        failure_reason: None,
                        fallback_reason: None,
                    }),
                    error: None,
                }
            }
            Err(failure) => {
                let required = policy == ResumePolicy::Required;
                let meta = ResumeMeta {
                    requested: true,
                    reused: false,
                    session_id: None,
                    source: None,
                    confidence: Confidence::None,
                    policy: Some(policy),
                    failure_reason: Some(failure.reason),
                    fallback_reason: (!required).then_some(failure.reason),
                };
                let error = required.then(|| {
                    ApiError::new(
                        failure_code(failure.reason),
                        format!("could not resume from pane {pane_id}: {}", failure.reason.as_str()),
                    )
                });
                LaunchResumePlan {
                    requested: true,
                    effective_policy: Some(policy),
                    resolved_session_id: None,
                    meta: Some(meta),
                    error,
                }
            }
        }
    }

    async fn resolve_cwd(&self, req: &LaunchRequest) -> Result<ResolvedCwd, ApiError> {
        if !req.uses_worktree() {
            return Ok(ResolvedCwd {
                cwd: req.cwd.clone(),
                ..ResolvedCwd::default()
            });
        }

        let base = self.tmux.first_pane_path(&req.session_name).await?.ok_or_else(|| {
            ApiError::not_found(format!("tmux session {:?} not found", req.session_name))
        })?;
        let snapshot = self
            .worktrees
            .resolve(&base, false)
            .await?
            .ok_or_else(|| ApiError::invalid(format!("{} is not inside a git repository", base.display())))?;

        let path = non_blank(req.worktree_path.as_deref());
        let branch = non_blank(req.worktree_branch.as_deref());
        let by_path = path.map(|p| snapshot.find_by_path(p));
        let by_branch = branch.map(|b| snapshot.find_by_branch(b));

        match (by_path, by_branch) {
            (Some(None), _) => Err(ApiError::invalid(format!(
                "unknown worktree path {:?}",
                path.unwrap_or_default()
            ))),
            (Some(Some(p)), Some(Some(b))) if p.path != b.path => Err(ApiError::invalid(
                "worktreePath and worktreeBranch refer to different worktrees",
            )),
            (Some(Some(_)), Some(None)) => Err(ApiError::invalid(
                "worktreePath and worktreeBranch refer to different worktrees",
            )),
            (Some(Some(entry)), _) | (None, Some(Some(entry))) => {
                debug!(path = %entry.path.display(), head = ?entry.head, "launching into existing worktree");
                Ok(ResolvedCwd::from_worktree(entry))
            }
            (None, Some(None)) if req.worktree_create_if_missing => {
                let branch = branch.unwrap_or_default();
                self.create_worktree(&snapshot, branch).await
            }
            (None, Some(None)) => Err(ApiError::invalid(format!(
                "unknown worktree branch {:?}",
                branch.unwrap_or_default()
            ))),
            (None, None) => Err(ApiError::invalid("worktree options need a path or a branch")),
        }
    }

    async fn create_worktree(&self, snapshot: &WorktreeSnapshot, branch: &str) -> Result<ResolvedCwd, ApiError> {
        let root = &snapshot.repo_root;
        let previous = self.worktree_tool.current_branch(root).await.ok().flatten();

        let created: Result<ResolvedCwd, ApiError> = async {
            self.worktree_tool.switch_create(root, branch).await?;
            let refreshed = self
                .worktrees
                .resolve(root, true)
                .await?
                .ok_or_else(|| ApiError::internal("worktree list unavailable after creation"))?;
            refreshed
                .find_by_branch(branch)
                .map(ResolvedCwd::from_worktree)
                .ok_or_else(|| ApiError::internal(format!("created worktree for {branch:?} not found")))
        }
        .await;

        if created.is_err() {
            if let Some(prev) = previous {
                if let Err(e) = self.worktree_tool.switch(root, &prev).await {
                    warn!(branch = %prev, error = %e, "failed to switch back after worktree creation failure");
                }
            }
        } else {
            info!(branch, repo = %root.display(), "created worktree");
        }
        created
    }

    async fn unique_window_name(&self, session: &str, base: &str) -> Result<String, ApiError> {
        let taken = self.tmux.list_window_names(session).await?;
        if !taken.iter().any(|n| n == base) {
            return Ok(base.to_string());
        }
        (2..=MAX_WINDOW_SUFFIX)
            .map(|n| format!("{base}-{n}"))
            .find(|candidate| !taken.contains(candidate))
            .ok_or_else(|| ApiError::internal(format!("no free window name for {base:?}")))
    }

    async fn send_command(&self, pane_id: &str, command: &str) -> Result<(), ApiError> {
        self.tmux.exit_copy_mode(pane_id).await?;
        self.tmux.send_literal(pane_id, command).await?;
        self.tmux.send_key(pane_id, &self.settings.submit_key).await?;
        Ok(())
    }

    async fn verify(&self, pane_id: &str, agent: AgentKind) -> LaunchVerification {
        let mut observed = None;
        let mut attempts = 0;
        while attempts < self.settings.verify_attempts {
            if attempts > 0 {
                tokio::time::sleep(self.settings.verify_interval).await;
            }
            attempts += 1;
            match self.tmux.pane_current_command(pane_id).await {
                Ok(cmd) if !cmd.is_empty() => {
                    let matched = AgentKind::from_command(&cmd) == agent;
                    observed = Some(cmd);
                    if matched {
                        return LaunchVerification {
                            status: VerificationStatus::Verified,
                            observed_command: observed,
                            attempts,
                        };
                    }
                }
                Ok(_) => {}
                Err(e) => debug!(pane_id, error = %e, "verification poll failed"),
            }
        }
        LaunchVerification {
            status: if observed.is_some() {
                VerificationStatus::Mismatch
            } else {
                VerificationStatus::Timeout
            },
            observed_command: observed,
            attempts,
        }
    }

    async fn rollback(&self, window_id: &str) -> RollbackOutcome {
        match self.tmux.kill_window(window_id).await {
            Ok(()) => {
                info!(window_id, "rolled back launch window");
                RollbackOutcome {
                    attempted: true,
                    ok: true,
                    message: None,
                }
            }
            Err(e) => {
                warn!(window_id, error = %e, "rollback failed");
                RollbackOutcome {
                    attempted: true,
                    ok: false,
                    message: Some(e.to_string()),
                }
            }
        }
    }
}

async fn validate_cwd(cwd: &str) -> Result<(), ApiError> {
    let path = Path::new(cwd);
    if !path.is_absolute() {
        return Err(ApiError::invalid(format!("cwd {cwd:?} must be absolute")));
    }
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(ApiError::invalid(format!("cwd {cwd:?} is not a directory"))),
        Err(_) => Err(ApiError::invalid(format!("cwd {cwd:?} does not exist"))),
    }
}
