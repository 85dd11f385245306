//! Realtime session bridge: one WebSocket per viewer.
//!
//! Each connection gets the session snapshot and a health frame on open,
//! then receives every registry change as a push. Requests are handled on
//! their own tasks, so responses can come back out of order; the `reqId` in
//! each response ties it to its request. Closing the socket aborts whatever
//! requests are still pending for it.
//!
//! The bridge owns exactly one registry subscription. Its forwarder task
//! serializes each change once and fans it out over a broadcast channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ApiError, ErrorCode};
use crate::idempotency::{fingerprint_of, IdempotentExecutor};
use crate::policy::dangerous_rule;
use crate::protocol::{
    encode, kind, parse_client_message, ClientRequest, CommandResponse, HealthData, RemovedData,
    ScreenRequest, SendKeysRequest, SendTextRequest, SnapshotData,
};
use crate::rate_limit::FixedWindowLimiter;
use crate::screen::{
    FallbackReason, ImageCapture, ScreenCapture, ScreenMode, ScreenResponse, SnapshotCache, SNAPSHOTS_PER_KEY,
};
use crate::sessions::{PaneRegistry, SessionEvent};
use crate::tmux::PaneActions;

type CommandOutcome = Result<(), ApiError>;

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub read_only: bool,
    pub screen_limit: u32,
    pub send_limit: u32,
    pub rate_window: Duration,
    pub idempotency_ttl: Duration,
    pub idempotency_capacity: usize,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            read_only: false,
            screen_limit: 30,
            send_limit: 20,
            rate_window: Duration::from_secs(10),
            idempotency_ttl: Duration::from_secs(60),
            idempotency_capacity: 1000,
        }
    }
}

impl From<&Config> for BridgeSettings {
    fn from(config: &Config) -> Self {
        Self {
            read_only: config.read_only,
            screen_limit: config.screen_limit,
            send_limit: config.send_limit,
            rate_window: config.rate_window,
            idempotency_ttl: config.idempotency_ttl,
            idempotency_capacity: config.idempotency_capacity,
        }
    }
}

pub struct Bridge {
    registry: Arc<PaneRegistry>,
    actions: Arc<dyn PaneActions>,
    capture: Arc<dyn ScreenCapture>,
    image: Option<Arc<dyn ImageCapture>>,
    snapshots: SnapshotCache,
    screen_limiter: FixedWindowLimiter,
    send_limiter: FixedWindowLimiter,
    commands: IdempotentExecutor<CommandOutcome>,
    push_tx: broadcast::Sender<Arc<str>>,
    connections: AtomicUsize,
    started: Instant,
    settings: BridgeSettings,
}

impl Bridge {
    pub fn new(
        registry: Arc<PaneRegistry>,
        actions: Arc<dyn PaneActions>,
        capture: Arc<dyn ScreenCapture>,
        image: Option<Arc<dyn ImageCapture>>,
        settings: BridgeSettings,
    ) -> Arc<Self> {
        let (push_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            registry,
            actions,
            capture,
            image,
            snapshots: SnapshotCache::new(SNAPSHOTS_PER_KEY),
            screen_limiter: FixedWindowLimiter::new(settings.rate_window, settings.screen_limit),
            send_limiter: FixedWindowLimiter::new(settings.rate_window, settings.send_limit),
            commands: IdempotentExecutor::new(settings.idempotency_ttl, settings.idempotency_capacity),
            push_tx,
            connections: AtomicUsize::new(0),
            started: Instant::now(),
            settings,
        })
    }

    pub fn health(&self) -> HealthData {
        HealthData {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: self.started.elapsed().as_secs(),
            read_only: self.settings.read_only,
            panes: self.registry.len(),
            connections: self.connections.load(Ordering::Relaxed),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    fn snapshot_message(&self) -> String {
        encode(
            kind::SESSIONS_SNAPSHOT,
            None,
            &SnapshotData {
                sessions: self.registry.snapshot(),
            },
        )
    }

    fn push(&self, message: String) {
        // No receivers just means nobody is connected.
        let _ = self.push_tx.send(Arc::from(message));
    }

    /// Push a `server.health` frame to every connection.
    pub fn broadcast_health(&self) {
        self.push(encode(kind::SERVER_HEALTH, None, &self.health()));
    }

    /// Forward registry changes to all connections, in change order.
    pub fn spawn_event_forwarder(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.registry.subscribe();
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Updated(summary)) => {
                        bridge.push(encode(kind::SESSION_UPDATED, None, &summary));
                    }
                    Ok(SessionEvent::Removed { pane_id }) => {
                        bridge.snapshots.forget_pane(&pane_id);
                        bridge.push(encode(kind::SESSION_REMOVED, None, &RemovedData { pane_id }));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "registry events lagged; pushing full snapshot");
                        bridge.push(bridge.snapshot_message());
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Drive one viewer connection until it closes.
    pub async fn serve(self: Arc<Self>, socket: WebSocket, client: String) {
        let (sink, stream) = socket.split();
        self.drive(sink, stream, client).await;
    }

    async fn drive<Si, St, E>(self: Arc<Self>, mut sink: Si, mut stream: St, client: String)
    where
        Si: Sink<Message> + Unpin + Send + 'static,
        St: Stream<Item = Result<Message, E>> + Unpin,
        E: std::fmt::Display,
    {
        let (tx, mut rx) = mpsc::channel::<String>(256);

        let writer = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Subscribe before building the snapshot so no change falls between.
        let mut pushes = self.push_tx.subscribe();
        let connections = self.connections.fetch_add(1, Ordering::Relaxed) + 1;
        info!(%client, connections, "viewer connected");
        let _ = tx.send(self.snapshot_message()).await;
        let _ = tx.send(encode(kind::SERVER_HEALTH, None, &self.health())).await;

        let forwarder = {
            let tx = tx.clone();
            let bridge = Arc::clone(&self);
            tokio::spawn(async move {
                loop {
                    let message = match pushes.recv().await {
                        Ok(message) => message.to_string(),
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(skipped, "viewer lagged; resending snapshot");
                            bridge.snapshot_message()
                        }
                        Err(RecvError::Closed) => break,
                    };
                    if tx.send(message).await.is_err() {
                        break;
                    }
                }
            })
        };

        let mut requests = JoinSet::new();
        while let Some(frame) = stream.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text.as_str().to_owned(),
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    debug!(%client, error = %e, "websocket read failed");
                    break;
                }
            };
            let bridge = Arc::clone(&self);
            let tx = tx.clone();
            let client = client.clone();
            requests.spawn(async move {
                let reply = bridge.handle_text(&client, &text).await;
                let _ = tx.send(reply).await;
            });
            while requests.try_join_next().is_some() {}
        }

        requests.shutdown().await;
        forwarder.abort();
        drop(tx);
        let _ = writer.await;
        let connections = self.connections.fetch_sub(1, Ordering::Relaxed) - 1;
        info!(%client, connections, "viewer disconnected");
    }

    /// Handle one inbound frame and return the serialized reply.
    pub async fn handle_text(&self, client: &str, text: &str) -> String {
        let (req_id, request) = match parse_client_message(text) {
            Ok(parsed) => parsed,
            Err(rejected) => {
                debug!(client, error = %rejected.error, "rejected message");
                return encode(
                    rejected.response_kind,
                    rejected.req_id.as_deref(),
                    &CommandResponse::failed(None, rejected.error),
                );
            }
        };
        let req_id = req_id.as_deref();
        match request {
            ClientRequest::Screen(req) => encode(kind::SCREEN_RESPONSE, req_id, &self.screen(client, &req).await),
            ClientRequest::SendText(req) => encode(kind::COMMAND_RESPONSE, req_id, &self.send_text(client, req).await),
            ClientRequest::SendKeys(req) => encode(kind::COMMAND_RESPONSE, req_id, &self.send_keys(client, req).await),
            ClientRequest::Ping => encode(kind::SERVER_HEALTH, req_id, &self.health()),
        }
    }

    async fn screen(&self, client: &str, req: &ScreenRequest) -> ScreenResponse {
        let lines = req.line_count();
        let Some(pane) = self.registry.get_detail(&req.pane_id) else {
            return ScreenResponse::failed(&req.pane_id, lines, ApiError::not_found(format!("unknown pane {}", req.pane_id)));
        };
        if !self.screen_limiter.check(&format!("{client}:screen")) {
            return ScreenResponse::failed(
                &req.pane_id,
                lines,
                ApiError::new(ErrorCode::RateLimit, "too many screen requests"),
            );
        }

        let mut fallback = None;
        if req.mode == Some(ScreenMode::Image) {
            match &self.image {
                Some(image) => match image.capture_image(&pane).await {
                    Ok(png) => return ScreenResponse::image(&req.pane_id, lines, &png),
                    Err(e) => {
                        warn!(pane_id = %req.pane_id, error = %e, "image capture failed; sending text");
                        fallback = Some(FallbackReason::ImageFailed);
                    }
                },
                None => fallback = Some(FallbackReason::ImageDisabled),
            }
        }

        match self.capture.capture_text(&req.pane_id, lines).await {
            Ok(captured) => {
                let mut response =
                    ScreenResponse::text(&self.snapshots, &req.pane_id, lines, req.cursor.as_deref(), captured);
                response.fallback_reason = fallback;
                response
            }
            Err(e) => ScreenResponse::failed(&req.pane_id, lines, e),
        }
    }

    /// Policy checks shared by both send paths.
    fn admit_send(&self, client: &str, pane_id: &str) -> Result<(), ApiError> {
        if self.settings.read_only {
            return Err(ApiError::new(ErrorCode::ReadOnly, "server is read-only"));
        }
        if !self.send_limiter.check(&format!("{client}:send")) {
            return Err(ApiError::new(ErrorCode::RateLimit, "too many commands"));
        }
        if self.registry.get_detail(pane_id).is_none() {
            return Err(ApiError::not_found(format!("unknown pane {pane_id}")));
        }
        Ok(())
    }

    async fn run_command<F, Fut>(&self, pane_id: &str, request_id: Option<&str>, fingerprint: String, run: F) -> CommandResponse
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = CommandOutcome> + Send + 'static,
    {
        let key = request_id
            .filter(|id| !id.trim().is_empty())
            .map(|id| format!("{pane_id}:{id}"));
        // Input is recorded by the command itself, so it still lands when the
        // connection closes mid-send.
        let registry = Arc::clone(&self.registry);
        let input_pane = pane_id.to_string();
        let run = move || {
            let fut = run();
            async move {
                let outcome = fut.await;
                if outcome.is_ok() {
                    registry.record_input(&input_pane, Utc::now());
                }
                outcome
            }
        };
        match self.commands.execute(key.as_deref(), &fingerprint, run).await {
            Err(mismatch) => CommandResponse::failed(Some(pane_id), ApiError::invalid(mismatch.to_string())),
            Ok(Err(e)) => CommandResponse::failed(Some(pane_id), e),
            Ok(Ok(())) => CommandResponse::done(pane_id),
        }
    }

    async fn send_text(&self, client: &str, req: SendTextRequest) -> CommandResponse {
        if let Err(e) = self.admit_send(client, &req.pane_id) {
            return CommandResponse::failed(Some(&req.pane_id), e);
        }
        if !req.confirm {
            if let Some(rule) = dangerous_rule(&req.text) {
                info!(pane_id = %req.pane_id, rule, "held destructive command for confirmation");
                return CommandResponse::failed(
                    Some(&req.pane_id),
                    ApiError::new(
                        ErrorCode::DangerousCommand,
                        format!("text matches destructive pattern {rule}; resend with confirm"),
                    ),
                );
            }
        }

        let fingerprint = fingerprint_of(&(kind::SEND_TEXT, &req));
        let actions = Arc::clone(&self.actions);
        let (pane_id, text, enter) = (req.pane_id.clone(), req.text.clone(), req.enter);
        self.run_command(&req.pane_id, req.request_id.as_deref(), fingerprint, move || async move {
            actions.send_text(&pane_id, &text, enter).await
        })
        .await
    }

    async fn send_keys(&self, client: &str, req: SendKeysRequest) -> CommandResponse {
        if let Err(e) = self.admit_send(client, &req.pane_id) {
            return CommandResponse::failed(Some(&req.pane_id), e);
        }

        let fingerprint = fingerprint_of(&(kind::SEND_KEYS, &req));
        let actions = Arc::clone(&self.actions);
        let (pane_id, keys) = (req.pane_id.clone(), req.keys.clone());
        self.run_command(&req.pane_id, req.request_id.as_deref(), fingerprint, move || async move {
            actions.send_keys(&pane_id, &keys).await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::screen::CapturedScreen;
    use crate::screen_diff::ScreenDelta;
    use crate::sessions::tests::pane;
    use crate::sessions::{AgentKind, PaneDetail};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use futures::channel::mpsc as socket_channel;
    use serde_json::{json, Value};
    use std::convert::Infallible;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeScreen {
        screen: Mutex<String>,
        stall: AtomicBool,
        abandoned: Arc<AtomicBool>,
    }

    /// Flags a capture that was dropped before it finished.
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    impl FakeScreen {
        fn set(&self, lines: &[String]) {
            *self.screen.lock().unwrap() = lines.join("\n");
        }
    }

    #[async_trait]
    impl ScreenCapture for FakeScreen {
        async fn capture_text(&self, _pane_id: &str, _lines: u32) -> Result<CapturedScreen, ApiError> {
            if self.stall.load(Ordering::SeqCst) {
                let _flag = DropFlag(Arc::clone(&self.abandoned));
                return std::future::pending().await;
            }
            Ok(CapturedScreen {
                screen: self.screen.lock().unwrap().clone(),
                alternate_on: false,
                truncated: Some(false),
            })
        }
    }

    #[derive(Default)]
    struct RecordingActions {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PaneActions for RecordingActions {
        async fn send_text(&self, pane_id: &str, text: &str, _enter: bool) -> Result<(), ApiError> {
            self.sent.lock().unwrap().push(format!("{pane_id} text {text}"));
            Ok(())
        }

        async fn send_keys(&self, pane_id: &str, keys: &[String]) -> Result<(), ApiError> {
            self.sent.lock().unwrap().push(format!("{pane_id} keys {}", keys.join(" ")));
            Ok(())
        }
    }

    struct BrokenCamera;

    #[async_trait]
    impl ImageCapture for BrokenCamera {
        async fn capture_image(&self, _pane: &PaneDetail) -> Result<Vec<u8>, String> {
            Err("no display".to_string())
        }
    }

    struct Fixture {
        bridge: Arc<Bridge>,
        registry: Arc<PaneRegistry>,
        screen: Arc<FakeScreen>,
        actions: Arc<RecordingActions>,
    }

    fn fixture_with(settings: BridgeSettings, image: Option<Arc<dyn ImageCapture>>) -> Fixture {
        let registry = PaneRegistry::new();
        registry.upsert(pane("%1", AgentKind::Claude));
        let screen = Arc::new(FakeScreen::default());
        let actions = Arc::new(RecordingActions::default());
        let bridge = Bridge::new(
            Arc::clone(&registry),
            actions.clone(),
            screen.clone(),
            image,
            settings,
        );
        Fixture {
            bridge,
            registry,
            screen,
            actions,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(BridgeSettings::default(), None)
    }

    async fn call(f: &Fixture, message: Value) -> Value {
        let reply = f.bridge.handle_text("10.0.0.1", &message.to_string()).await;
        serde_json::from_str(&reply).unwrap()
    }

    fn send_text(text: &str, request_id: Option<&str>) -> Value {
        let mut data = json!({"paneId": "%1", "text": text});
        if let Some(id) = request_id {
            data["requestId"] = json!(id);
        }
        json!({"type": "send.text", "reqId": "c1", "data": data})
    }

    #[tokio::test]
    async fn screen_goes_full_then_delta() {
        let f = fixture();
        let mut lines: Vec<String> = (0..50).map(|i| format!("line {i}")).collect();
        f.screen.set(&lines);

        let first = call(&f, json!({"type": "screen.request", "reqId": "s1", "data": {"paneId": "%1", "lines": 50}})).await;
        assert_eq!(first["type"], "screen.response");
        assert_eq!(first["reqId"], "s1");
        assert_eq!(first["data"]["full"], true);
        assert_eq!(first["data"]["screen"].as_str().unwrap().lines().count(), 50);
        let cursor = first["data"]["cursor"].as_str().unwrap().to_string();

        lines[10] = "line 10 changed".to_string();
        f.screen.set(&lines);
        let second = call(
            &f,
            json!({"type": "screen.request", "reqId": "s2", "data": {"paneId": "%1", "lines": 50, "cursor": cursor}}),
        )
        .await;
        assert_eq!(second["data"]["full"], false);
        assert!(second["data"].get("screen").is_none());
        let deltas: Vec<ScreenDelta> = serde_json::from_value(second["data"]["deltas"].clone()).unwrap();
        assert_eq!(
            deltas,
            vec![ScreenDelta {
                start: 10,
                delete_count: 1,
                insert_lines: vec!["line 10 changed".to_string()],
            }]
        );
        assert_ne!(second["data"]["cursor"].as_str().unwrap(), cursor);
    }

    #[tokio::test]
    async fn screen_errors() {
        let f = fixture_with(
            BridgeSettings {
                screen_limit: 1,
                ..BridgeSettings::default()
            },
            None,
        );
        let missing = call(&f, json!({"type": "screen.request", "data": {"paneId": "%404"}})).await;
        assert_eq!(missing["data"]["error"]["code"], "NOT_FOUND");

        let ok = call(&f, json!({"type": "screen.request", "data": {"paneId": "%1"}})).await;
        assert_eq!(ok["data"]["ok"], true);
        let limited = call(&f, json!({"type": "screen.request", "data": {"paneId": "%1"}})).await;
        assert_eq!(limited["data"]["error"]["code"], "RATE_LIMIT");
    }

    #[tokio::test]
    async fn image_mode_falls_back_to_text() {
        let f = fixture();
        let reply = call(&f, json!({"type": "screen.request", "data": {"paneId": "%1", "mode": "image"}})).await;
        assert_eq!(reply["data"]["mode"], "text");
        assert_eq!(reply["data"]["fallbackReason"], "image_disabled");

        let f = fixture_with(
            BridgeSettings::default(),
            Some(Arc::new(BrokenCamera) as Arc<dyn ImageCapture>),
        );
        let reply = call(&f, json!({"type": "screen.request", "data": {"paneId": "%1", "mode": "image"}})).await;
        assert_eq!(reply["data"]["fallbackReason"], "image_failed");
        assert_eq!(reply["data"]["full"], true);
    }

    #[tokio::test]
    async fn send_text_without_request_id_runs_every_time() {
        let f = fixture();
        for _ in 0..2 {
            let reply = call(&f, send_text("echo hi", None)).await;
            assert_eq!(reply["type"], "command.response");
            assert_eq!(reply["data"]["ok"], true);
        }
        assert_eq!(f.actions.sent.lock().unwrap().len(), 2);
        assert!(f.registry.get_detail("%1").unwrap().summary.last_input_at.is_some());
    }

    #[tokio::test]
    async fn send_text_with_request_id_runs_once() {
        let f = fixture();
        for _ in 0..3 {
            let reply = call(&f, send_text("echo hi", Some("r1"))).await;
            assert_eq!(reply["data"]["ok"], true);
        }
        assert_eq!(f.actions.sent.lock().unwrap().len(), 1);

        let reply = call(&f, send_text("echo bye", Some("r1"))).await;
        assert_eq!(reply["data"]["error"]["code"], "INVALID_PAYLOAD");
        assert_eq!(f.actions.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn destructive_text_needs_confirmation() {
        let f = fixture();
        let reply = call(&f, send_text("rm -rf ~/project", None)).await;
        assert_eq!(reply["data"]["error"]["code"], "DANGEROUS_COMMAND");
        assert!(f.actions.sent.lock().unwrap().is_empty());

        let confirmed = json!({"type": "send.text", "data": {"paneId": "%1", "text": "rm -rf ~/project", "confirm": true}});
        let reply = call(&f, confirmed).await;
        assert_eq!(reply["data"]["ok"], true);
        assert_eq!(f.actions.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn read_only_refuses_input() {
        let f = fixture_with(
            BridgeSettings {
                read_only: true,
                ..BridgeSettings::default()
            },
            None,
        );
        let reply = call(&f, send_text("ls", None)).await;
        assert_eq!(reply["data"]["error"]["code"], "READ_ONLY");
        let reply = call(&f, json!({"type": "send.keys", "data": {"paneId": "%1", "keys": ["C-c"]}})).await;
        assert_eq!(reply["data"]["error"]["code"], "READ_ONLY");
        assert!(f.actions.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_keys_and_limits() {
        let f = fixture_with(
            BridgeSettings {
                send_limit: 1,
                ..BridgeSettings::default()
            },
            None,
        );
        let reply = call(&f, json!({"type": "send.keys", "data": {"paneId": "%1", "keys": ["Escape", "Enter"]}})).await;
        assert_eq!(reply["data"]["ok"], true);
        assert_eq!(*f.actions.sent.lock().unwrap(), vec!["%1 keys Escape Enter".to_string()]);

        let reply = call(&f, json!({"type": "send.keys", "data": {"paneId": "%1", "keys": ["Enter"]}})).await;
        assert_eq!(reply["data"]["error"]["code"], "RATE_LIMIT");
    }

    #[tokio::test]
    async fn invalid_messages_echo_req_id() {
        let f = fixture();
        let reply = call(&f, json!({"type": "send.text", "reqId": "bad", "data": {"paneId": "%1"}})).await;
        assert_eq!(reply["type"], "command.response");
        assert_eq!(reply["reqId"], "bad");
        assert_eq!(reply["data"]["error"]["code"], "INVALID_PAYLOAD");

        let reply = call(&f, json!({"type": "client.ping", "reqId": "p1"})).await;
        assert_eq!(reply["type"], "server.health");
        assert_eq!(reply["reqId"], "p1");
        assert_eq!(reply["data"]["panes"], 1);
    }

    #[tokio::test]
    async fn registry_changes_are_pushed_in_order() {
        let f = fixture();
        let mut pushes = f.bridge.push_tx.subscribe();
        let forwarder = f.bridge.spawn_event_forwarder();

        let mut changed = pane("%1", AgentKind::Claude);
        changed.summary.window_name = "renamed".into();
        f.registry.upsert(changed);
        f.registry.remove("%1");

        let updated: Value = serde_json::from_str(&pushes.recv().await.unwrap()).unwrap();
        assert_eq!(updated["type"], "session.updated");
        assert_eq!(updated["data"]["windowName"], "renamed");
        let removed: Value = serde_json::from_str(&pushes.recv().await.unwrap()).unwrap();
        assert_eq!(removed["type"], "session.removed");
        assert_eq!(removed["data"]["paneId"], "%1");

        f.bridge.broadcast_health();
        let health: Value = serde_json::from_str(&pushes.recv().await.unwrap()).unwrap();
        assert_eq!(health["type"], "server.health");
        forwarder.abort();
    }

    async fn next_frame(outgoing: &mut socket_channel::UnboundedReceiver<Message>) -> Value {
        let frame = tokio::time::timeout(Duration::from_secs(1), outgoing.next())
            .await
            .expect("frame within a second")
            .expect("connection still open");
        match frame {
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn connection_lifecycle() {
        let f = fixture();
        let forwarder = f.bridge.spawn_event_forwarder();
        let (out_tx, mut outgoing) = socket_channel::unbounded::<Message>();
        let (in_tx, incoming) = socket_channel::unbounded::<Message>();
        let connection = tokio::spawn(Arc::clone(&f.bridge).drive(
            out_tx,
            incoming.map(Ok::<Message, Infallible>),
            "10.0.0.1".to_string(),
        ));

        let snapshot = next_frame(&mut outgoing).await;
        assert_eq!(snapshot["type"], "sessions.snapshot");
        assert_eq!(snapshot["data"]["sessions"][0]["paneId"], "%1");
        let health = next_frame(&mut outgoing).await;
        assert_eq!(health["type"], "server.health");
        assert_eq!(f.bridge.connection_count(), 1);

        f.registry.upsert(pane("%2", AgentKind::Codex));
        let pushed = next_frame(&mut outgoing).await;
        assert_eq!(pushed["type"], "session.updated");
        assert_eq!(pushed["data"]["paneId"], "%2");

        in_tx
            .unbounded_send(Message::Text(json!({"type": "client.ping", "reqId": "p1"}).to_string().into()))
            .unwrap();
        let pong = next_frame(&mut outgoing).await;
        assert_eq!(pong["reqId"], "p1");

        f.screen.stall.store(true, Ordering::SeqCst);
        let stuck = json!({"type": "screen.request", "reqId": "s1", "data": {"paneId": "%1"}});
        in_tx.unbounded_send(Message::Text(stuck.to_string().into())).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(in_tx);

        tokio::time::timeout(Duration::from_secs(1), connection)
            .await
            .expect("connection shuts down once the socket closes")
            .unwrap();
        assert!(f.screen.abandoned.load(Ordering::SeqCst));
        assert_eq!(f.bridge.connection_count(), 0);
        assert!(outgoing.next().await.is_none());
        forwarder.abort();
    }
}
