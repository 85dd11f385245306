//! # agent-monitor
//!
//! Control plane for coding agents (Claude, Codex) running in tmux panes.
//!
//! This server provides:
//! - A realtime WebSocket bridge: pane list pushes, screen capture with
//!   line deltas, and text/key input to panes
//! - Launching agents into new tmux windows, optionally resuming an earlier
//!   agent session and optionally inside a git worktree
//! - A pane poller that keeps the session registry in step with tmux
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  ws   ┌──────────────┐     ┌──────────────┐
//! │   Viewers   │──────▶│    Bridge    │────▶│ PaneRegistry │◀── monitor
//! └─────────────┘       │  (bridge.rs) │     │ (sessions.rs)│    (poll)
//!       │ http          └──────────────┘     └──────────────┘
//!       ▼                      │                    ▲
//! ┌─────────────┐              ▼                    │
//! │   Launch    │───────▶ tmux (tmux.rs) ───────────┘
//! │ (launch.rs) │───────▶ resume resolver, worktrees
//! └─────────────┘
//! ```
//!
//! ## API Endpoints
//!
//! - `GET /health` - Server health check (never needs the token)
//! - `GET /ws` - Realtime bridge
//! - `POST /sessions/launch` - Launch or resume an agent
//! - `POST /hooks/claude` - Claude hook report for a pane

mod bridge;
mod config;
mod error;
mod exec;
mod idempotency;
mod launch;
mod monitor;
mod policy;
mod protocol;
mod rate_limit;
mod resume;
mod screen;
mod screen_diff;
mod sessions;
mod tmux;
mod worktree;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{ConnectInfo, Query, Request, State, WebSocketUpgrade},
    http::{header, HeaderMap, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::bridge::{Bridge, BridgeSettings};
use crate::config::Config;
use crate::error::{ApiError, ErrorCode};
use crate::idempotency::{fingerprint_of, IdempotentExecutor};
use crate::launch::{LaunchOrchestrator, LaunchRequest, LaunchResult, LaunchSettings};
use crate::resume::{PsLsofInspector, ResumeScoring, SessionResolver};
use crate::screen::TmuxScreenCapture;
use crate::sessions::{AgentKind, PaneRegistry};
use crate::tmux::{MuxRunner, Tmux, TmuxPaneActions, TmuxRunner};
use crate::worktree::{GitWorktreeProvider, WtCli};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const WORKTREE_CACHE_TTL: Duration = Duration::from_secs(5);

// ============================================================================
// App State
// ============================================================================

struct AppState {
    config: Config,
    start_time: Instant,
    tmux: Tmux,
    registry: Arc<PaneRegistry>,
    bridge: Arc<Bridge>,
    launcher: Arc<LaunchOrchestrator>,
    launch_dedupe: IdempotentExecutor<LaunchResult>,
}

fn build_state(config: Config, runner: Arc<dyn MuxRunner>) -> Arc<AppState> {
    let tmux = Tmux::new(runner);
    let registry = PaneRegistry::new();

    let bridge = Bridge::new(
        Arc::clone(&registry),
        Arc::new(TmuxPaneActions::new(tmux.clone(), config.submit_key.clone())),
        Arc::new(TmuxScreenCapture::new(tmux.clone())),
        None,
        BridgeSettings::from(&config),
    );

    let resolver = Arc::new(SessionResolver::new(
        Arc::new(PsLsofInspector::new(config.command_timeout)),
        config.claude_projects_dir.clone(),
        config.codex_sessions_dir.clone(),
        ResumeScoring::default(),
    ));
    let launcher = Arc::new(LaunchOrchestrator::new(
        tmux.clone(),
        Arc::clone(&registry),
        resolver,
        Arc::new(GitWorktreeProvider::new("git", config.command_timeout, WORKTREE_CACHE_TTL)),
        Arc::new(WtCli::new(config.worktree_tool.clone(), "git", config.command_timeout)),
        LaunchSettings {
            backend: config.backend,
            submit_key: config.submit_key.clone(),
            ..LaunchSettings::default()
        },
    ));

    Arc::new(AppState {
        launch_dedupe: IdempotentExecutor::new(config.idempotency_ttl, config.idempotency_capacity),
        config,
        start_time: Instant::now(),
        tmux,
        registry,
        bridge,
        launcher,
    })
}

fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_upgrade))
        .route("/sessions/launch", post(launch_session))
        .route("/hooks/claude", post(claude_hook))
        .layer(middleware::from_fn_with_state(state.clone(), require_token))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// Auth
// ============================================================================

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Browsers cannot set headers on a WebSocket handshake, so `?token=` is
/// accepted as well.
async fn require_token(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let Some(expected) = state.config.token.as_deref() else {
        return next.run(req).await;
    };
    if req.uri().path() == "/health" {
        return next.run(req).await;
    }

    let from_query = Query::<TokenQuery>::try_from_uri(req.uri())
        .ok()
        .and_then(|Query(q)| q.token);
    let presented = bearer_token(req.headers()).map(str::to_string).or(from_query);

    if presented.as_deref() == Some(expected) {
        next.run(req).await
    } else {
        tracing::debug!(path = %req.uri().path(), "rejected unauthenticated request");
        (StatusCode::UNAUTHORIZED, "missing or invalid token").into_response()
    }
}

// ============================================================================
// Health
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    version: &'static str,
    read_only: bool,
    active_panes: usize,
    connections: usize,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION"),
        read_only: state.config.read_only,
        active_panes: state.registry.len(),
        connections: state.bridge.connection_count(),
    })
}

// ============================================================================
// Realtime bridge
// ============================================================================

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let bridge = Arc::clone(&state.bridge);
    // Rate limits are per client address, not per socket.
    ws.on_upgrade(move |socket| bridge.serve(socket, addr.ip().to_string()))
}

// ============================================================================
// Launch
// ============================================================================

#[derive(Serialize)]
struct LaunchResponse {
    command: LaunchResult,
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidPayload => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::RateLimit => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::ReadOnly | ErrorCode::DangerousCommand => StatusCode::FORBIDDEN,
        ErrorCode::TmuxUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn launch_reply(command: LaunchResult) -> (StatusCode, Json<LaunchResponse>) {
    let status = match &command.error {
        Some(error) if !command.ok => status_for(error.code),
        _ => StatusCode::OK,
    };
    (status, Json(LaunchResponse { command }))
}

async fn launch_session(State(state): State<Arc<AppState>>, body: Bytes) -> (StatusCode, Json<LaunchResponse>) {
    if state.config.read_only {
        return launch_reply(LaunchResult::failed(
            ApiError::new(ErrorCode::ReadOnly, "server is in read-only mode"),
            None,
        ));
    }

    let req: LaunchRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            return launch_reply(LaunchResult::failed(
                ApiError::invalid(format!("invalid launch request: {e}")),
                None,
            ));
        }
    };

    let key = req.dedupe_key();
    let fingerprint = fingerprint_of(&req.without_request_id());
    tracing::info!(session = %req.session_name, agent = req.agent.as_str(), "launch requested");

    let launcher = Arc::clone(&state.launcher);
    let command = match state
        .launch_dedupe
        .execute(key.as_deref(), &fingerprint, move || async move { launcher.launch(req).await })
        .await
    {
        Ok(result) => result,
        Err(mismatch) => LaunchResult::failed(ApiError::invalid(mismatch.to_string()), None),
    };

    if let Some(error) = &command.error {
        tracing::warn!(code = ?error.code, message = %error.message, "launch failed");
    }
    launch_reply(command)
}

// ============================================================================
// Hooks
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClaudeHookReport {
    pane_id: String,
    #[serde(default, alias = "session_id")]
    session_id: Option<String>,
}

#[derive(Serialize)]
struct HookAck {
    ok: bool,
}

async fn claude_hook(
    State(state): State<Arc<AppState>>,
    Json(report): Json<ClaudeHookReport>,
) -> Result<Json<HookAck>, (StatusCode, Json<ApiError>)> {
    let pane_id = report.pane_id.trim();
    if pane_id.is_empty() {
        return Err((StatusCode::BAD_REQUEST, Json(ApiError::invalid("paneId is required"))));
    }
    let recorded = state
        .registry
        .record_hook(pane_id, AgentKind::Claude, report.session_id, chrono::Utc::now());
    if !recorded {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ApiError::not_found(format!("pane {pane_id} is not being monitored"))),
        ));
    }
    tracing::debug!(pane = pane_id, "claude hook recorded");
    Ok(Json(HookAck { ok: true }))
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("agent_monitor=info,tower_http=info")))
        .init();

    let config = Config::from_env().context("invalid configuration")?;
    let runner = Arc::new(TmuxRunner::new(
        config.tmux_bin.clone(),
        config.tmux_socket.clone(),
        config.command_timeout,
    ));
    let state = build_state(config, runner);

    state.bridge.spawn_event_forwarder();
    monitor::spawn(state.tmux.clone(), Arc::clone(&state.registry), state.config.poll_interval);

    let heartbeat_bridge = Arc::clone(&state.bridge);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(HEARTBEAT_INTERVAL).await;
            heartbeat_bridge.broadcast_health();
        }
    });

    let addr = SocketAddr::new(state.config.bind_addr, state.config.port);
    if state.config.token.is_none() && !addr.ip().is_loopback() {
        tracing::warn!(%addr, "no AGENT_MONITOR_TOKEN set; every client on the network can drive panes");
    }
    tracing::info!(
        read_only = state.config.read_only,
        backend = ?state.config.backend,
        "agent-monitor v{} listening on {}",
        env!("CARGO_PKG_VERSION"),
        addr
    );

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .context("server error")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::tests::pane;
    use crate::tmux::tests::{ok, MockRunner};
    use axum::body::{to_bytes, Body};
    use axum::http::Request as HttpRequest;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn test_config(token: Option<&str>, read_only: bool) -> Config {
        let mut config = Config::from_lookup(|name| (name == "HOME").then(|| "/home/dev".to_string())).unwrap();
        config.token = token.map(str::to_string);
        config.read_only = read_only;
        config
    }

    fn app(config: Config) -> (Router, Arc<AppState>, Arc<MockRunner>) {
        let runner = MockRunner::new();
        let state = build_state(config, runner.clone());
        (build_router(state.clone()), state, runner)
    }

    fn post_json(uri: &str, body: Value) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_skips_auth() {
        let (router, _, _) = app(test_config(Some("s3cret"), false));
        let response = router
            .oneshot(HttpRequest::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["active_panes"], 0);
    }

    #[tokio::test]
    async fn launch_requires_token_when_configured() {
        let (router, _, runner) = app(test_config(Some("s3cret"), false));
        let response = router
            .oneshot(post_json("/sessions/launch", json!({"sessionName": "work", "agent": "claude"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn token_accepted_from_header_or_query() {
        let (router, _, _) = app(test_config(Some("s3cret"), false));
        let mut req = post_json("/sessions/launch", json!({"sessionName": "", "agent": "claude"}));
        req.headers_mut()
            .insert(header::AUTHORIZATION, "Bearer s3cret".parse().unwrap());
        let response = router.clone().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let req = post_json("/sessions/launch?token=s3cret", json!({"sessionName": "", "agent": "claude"}));
        let response = router.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn invalid_launch_is_rejected_without_touching_tmux() {
        let (router, _, runner) = app(test_config(None, false));
        let response = router
            .oneshot(post_json("/sessions/launch", json!({"sessionName": "  ", "agent": "claude"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["command"]["ok"], false);
        assert_eq!(body["command"]["error"]["code"], "INVALID_PAYLOAD");
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_launch_fields_are_invalid() {
        let (router, _, _) = app(test_config(None, false));
        let response = router
            .oneshot(post_json(
                "/sessions/launch",
                json!({"sessionName": "work", "agent": "claude", "sudo": true}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["command"]["error"]["code"], "INVALID_PAYLOAD");
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_launch_request_creates_one_window() {
        let (router, _, runner) = app(test_config(None, false));
        runner.push("new-window", ok("@5\t2\tclaude\t%9\n"));
        runner.default_for("display-message", ok("claude\n"));
        let body = json!({"sessionName": "work", "agent": "claude", "requestId": "tap-1"});

        let first = router.clone().oneshot(post_json("/sessions/launch", body.clone())).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let first = body_json(first).await;
        assert_eq!(first["command"]["ok"], true);
        assert_eq!(first["command"]["result"]["paneId"], "%9");

        let second = router.clone().oneshot(post_json("/sessions/launch", body)).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(body_json(second).await, first);
        assert_eq!(runner.calls_to("new-window").len(), 1);

        let calls_before = runner.calls().len();
        let changed = json!({"sessionName": "work", "agent": "codex", "requestId": "tap-1"});
        let third = router.oneshot(post_json("/sessions/launch", changed)).await.unwrap();
        assert_eq!(third.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(third).await["command"]["error"]["code"], "INVALID_PAYLOAD");
        assert_eq!(runner.calls().len(), calls_before);
    }

    #[tokio::test]
    async fn read_only_refuses_launch() {
        let (router, _, runner) = app(test_config(None, true));
        let response = router
            .oneshot(post_json("/sessions/launch", json!({"sessionName": "work", "agent": "codex"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_json(response).await;
        assert_eq!(body["command"]["error"]["code"], "READ_ONLY");
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn claude_hook_records_session_id() {
        let (router, state, _) = app(test_config(None, false));
        state.registry.upsert(pane("%7", AgentKind::Unknown));

        let response = router
            .clone()
            .oneshot(post_json("/hooks/claude", json!({"paneId": "%7", "session_id": "abc-123"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let detail = state.registry.get_detail("%7").unwrap();
        assert_eq!(detail.agent(), AgentKind::Claude);
        assert_eq!(detail.agent_session_id.as_deref(), Some("abc-123"));
        assert!(detail.summary.last_event_at.is_some());

        let response = router
            .oneshot(post_json("/hooks/claude", json!({"paneId": "%99"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["code"], "NOT_FOUND");
    }

    #[test]
    fn error_codes_map_to_statuses() {
        assert_eq!(status_for(ErrorCode::InvalidPayload), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorCode::TmuxUnavailable), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(ErrorCode::RateLimit), StatusCode::TOO_MANY_REQUESTS);
    }
}
