//! WebSocket message envelope and request schemas.
//!
//! Every frame is `{type, ts, reqId?, data}`. Requests are parsed in two
//! steps: the envelope first (so a bad payload can still be answered with the
//! right `reqId` and response type), then `data` against a strict schema.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;
use crate::policy::is_allowed_key;
use crate::screen::ScreenMode;
use crate::sessions::PaneSummary;

pub const MAX_SCREEN_LINES: u32 = 2000;
pub const DEFAULT_SCREEN_LINES: u32 = 200;
pub const MAX_TEXT_LEN: usize = 16 * 1024;
pub const MAX_KEYS: usize = 32;

pub mod kind {
    pub const SESSIONS_SNAPSHOT: &str = "sessions.snapshot";
    pub const SESSION_UPDATED: &str = "session.updated";
    pub const SESSION_REMOVED: &str = "session.removed";
    pub const SERVER_HEALTH: &str = "server.health";
    pub const SCREEN_REQUEST: &str = "screen.request";
    pub const SCREEN_RESPONSE: &str = "screen.response";
    pub const SEND_TEXT: &str = "send.text";
    pub const SEND_KEYS: &str = "send.keys";
    pub const COMMAND_RESPONSE: &str = "command.response";
    pub const CLIENT_PING: &str = "client.ping";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    #[serde(rename = "type")]
    pub kind: String,
    pub ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_id: Option<String>,
    pub data: T,
}

/// Serialize an outgoing frame.
pub fn encode<T: Serialize>(kind: &str, req_id: Option<&str>, data: &T) -> String {
    let envelope = Envelope {
        kind: kind.to_string(),
        ts: Utc::now(),
        req_id: req_id.map(str::to_string),
        data,
    };
    serde_json::to_string(&envelope).unwrap_or_else(|e| {
        format!(r#"{{"type":"{kind}","data":{{"ok":false,"error":{{"code":"INTERNAL","message":"encode failed: {e}"}}}}}}"#)
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ScreenRequest {
    pub pane_id: String,
    #[serde(default)]
    pub lines: Option<u32>,
    #[serde(default)]
    pub mode: Option<ScreenMode>,
    #[serde(default)]
    pub cursor: Option<String>,
}

impl ScreenRequest {
    pub fn line_count(&self) -> u32 {
        self.lines.unwrap_or(DEFAULT_SCREEN_LINES)
    }

    fn validate(&self) -> Result<(), ApiError> {
        require_pane_id(&self.pane_id)?;
        if let Some(lines) = self.lines {
            if lines == 0 || lines > MAX_SCREEN_LINES {
                return Err(ApiError::invalid(format!("lines must be between 1 and {MAX_SCREEN_LINES}")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SendTextRequest {
    pub pane_id: String,
    pub text: String,
    #[serde(default = "default_enter")]
    pub enter: bool,
    #[serde(default)]
    pub confirm: bool,
    #[serde(default, skip_serializing)]
    pub request_id: Option<String>,
}

fn default_enter() -> bool {
    true
}

impl SendTextRequest {
    fn validate(&self) -> Result<(), ApiError> {
        require_pane_id(&self.pane_id)?;
        if self.text.is_empty() {
            return Err(ApiError::invalid("text must not be empty"));
        }
        if self.text.len() > MAX_TEXT_LEN {
            return Err(ApiError::invalid(format!("text exceeds {MAX_TEXT_LEN} bytes")));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SendKeysRequest {
    pub pane_id: String,
    pub keys: Vec<String>,
    #[serde(default, skip_serializing)]
    pub request_id: Option<String>,
}

impl SendKeysRequest {
    fn validate(&self) -> Result<(), ApiError> {
        require_pane_id(&self.pane_id)?;
        if self.keys.is_empty() || self.keys.len() > MAX_KEYS {
            return Err(ApiError::invalid(format!("keys must contain 1 to {MAX_KEYS} entries")));
        }
        if let Some(bad) = self.keys.iter().find(|k| !is_allowed_key(k)) {
            return Err(ApiError::invalid(format!("key {bad:?} is not allowed")));
        }
        Ok(())
    }
}

fn require_pane_id(pane_id: &str) -> Result<(), ApiError> {
    if pane_id.trim().is_empty() {
        return Err(ApiError::invalid("paneId is required"));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    Screen(ScreenRequest),
    SendText(SendTextRequest),
    SendKeys(SendKeysRequest),
    Ping,
}

/// A request that failed validation, with enough context to answer it.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejected {
    pub req_id: Option<String>,
    pub response_kind: &'static str,
    pub error: ApiError,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    req_id: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

fn parse_data<T: DeserializeOwned>(data: Option<Value>) -> Result<T, ApiError> {
    serde_json::from_value(data.unwrap_or(Value::Object(Default::default())))
        .map_err(|e| ApiError::invalid(format!("invalid payload: {e}")))
}

/// Parse and validate one inbound text frame.
pub fn parse_client_message(text: &str) -> Result<(Option<String>, ClientRequest), Rejected> {
    let raw: RawEnvelope = serde_json::from_str(text).map_err(|e| Rejected {
        req_id: None,
        response_kind: kind::COMMAND_RESPONSE,
        error: ApiError::invalid(format!("malformed message: {e}")),
    })?;
    let req_id = raw.req_id.clone();
    let reject = |response_kind, error| Rejected {
        req_id: req_id.clone(),
        response_kind,
        error,
    };

    let request = match raw.kind.as_str() {
        kind::SCREEN_REQUEST => {
            let req: ScreenRequest = parse_data(raw.data).map_err(|e| reject(kind::SCREEN_RESPONSE, e))?;
            req.validate().map_err(|e| reject(kind::SCREEN_RESPONSE, e))?;
            ClientRequest::Screen(req)
        }
        kind::SEND_TEXT => {
            let req: SendTextRequest = parse_data(raw.data).map_err(|e| reject(kind::COMMAND_RESPONSE, e))?;
            req.validate().map_err(|e| reject(kind::COMMAND_RESPONSE, e))?;
            ClientRequest::SendText(req)
        }
        kind::SEND_KEYS => {
            let req: SendKeysRequest = parse_data(raw.data).map_err(|e| reject(kind::COMMAND_RESPONSE, e))?;
            req.validate().map_err(|e| reject(kind::COMMAND_RESPONSE, e))?;
            ClientRequest::SendKeys(req)
        }
        kind::CLIENT_PING => ClientRequest::Ping,
        other => {
            return Err(reject(
                kind::COMMAND_RESPONSE,
                ApiError::invalid(format!("unknown message type {other:?}")),
            ))
        }
    };
    Ok((req_id, request))
}

/// `command.response` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pane_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl CommandResponse {
    pub fn done(pane_id: &str) -> Self {
        Self {
            ok: true,
            pane_id: Some(pane_id.to_string()),
            error: None,
        }
    }

    pub fn failed(pane_id: Option<&str>, error: ApiError) -> Self {
        Self {
            ok: false,
            pane_id: pane_id.map(str::to_string),
            error: Some(error),
        }
    }
}

/// `server.health` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthData {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub read_only: bool,
    pub panes: usize,
    pub connections: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotData {
    pub sessions: Vec<PaneSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovedData {
    pub pane_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn parses_screen_request_with_req_id() {
        let (req_id, req) = parse_client_message(
            r#"{"type":"screen.request","ts":"2026-01-01T00:00:00Z","reqId":"r1","data":{"paneId":"%1","lines":50,"cursor":"abc"}}"#,
        )
        .unwrap();
        assert_eq!(req_id.as_deref(), Some("r1"));
        match req {
            ClientRequest::Screen(s) => {
                assert_eq!(s.line_count(), 50);
                assert_eq!(s.cursor.as_deref(), Some("abc"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_fields_are_rejected_with_matching_response_type() {
        let rejected = parse_client_message(
            r#"{"type":"screen.request","reqId":"r2","data":{"paneId":"%1","bogus":true}}"#,
        )
        .unwrap_err();
        assert_eq!(rejected.req_id.as_deref(), Some("r2"));
        assert_eq!(rejected.response_kind, kind::SCREEN_RESPONSE);
        assert_eq!(rejected.error.code, ErrorCode::InvalidPayload);
    }

    #[test]
    fn malformed_and_unknown_types_answer_as_command_response() {
        let rejected = parse_client_message("{not json").unwrap_err();
        assert_eq!(rejected.response_kind, kind::COMMAND_RESPONSE);
        assert_eq!(rejected.req_id, None);

        let rejected = parse_client_message(r#"{"type":"pane.delete","reqId":"x","data":{}}"#).unwrap_err();
        assert_eq!(rejected.req_id.as_deref(), Some("x"));
        assert!(rejected.error.message.contains("pane.delete"));
    }

    #[test]
    fn send_requests_are_validated() {
        let (_, req) = parse_client_message(r#"{"type":"send.text","data":{"paneId":"%1","text":"hi"}}"#).unwrap();
        assert_eq!(
            req,
            ClientRequest::SendText(SendTextRequest {
                pane_id: "%1".into(),
                text: "hi".into(),
                enter: true,
                confirm: false,
                request_id: None,
            })
        );

        assert!(parse_client_message(r#"{"type":"send.text","data":{"paneId":"%1","text":""}}"#).is_err());
        assert!(parse_client_message(r#"{"type":"send.keys","data":{"paneId":"%1","keys":["Enter","C-c"]}}"#).is_ok());
        let rejected =
            parse_client_message(r#"{"type":"send.keys","data":{"paneId":"%1","keys":["; rm"]}}"#).unwrap_err();
        assert!(rejected.error.message.contains("not allowed"));
        assert!(parse_client_message(r#"{"type":"screen.request","data":{"paneId":"%1","lines":0}}"#).is_err());
    }

    #[test]
    fn encode_echoes_req_id() {
        let text = encode(kind::COMMAND_RESPONSE, Some("r9"), &CommandResponse::done("%1"));
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "command.response");
        assert_eq!(value["reqId"], "r9");
        assert_eq!(value["data"]["ok"], true);
        assert!(value["ts"].is_string());

        let text = encode(kind::SESSION_REMOVED, None, &RemovedData { pane_id: "%1".into() });
        assert!(!text.contains("reqId"));
    }
}
