//! Error types shared by the bridge, the launch pipeline and the HTTP layer.
//!
//! Everything that reaches a client is an [`ApiError`]: a fixed code plus a
//! human-readable message. Subsystems keep their own `thiserror` enums and
//! convert at the boundary.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Wire-level error codes. Clients switch on these, so the set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidPayload,
    NotFound,
    RateLimit,
    ReadOnly,
    DangerousCommand,
    TmuxUnavailable,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidPayload, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

/// Failure to run an external command (tmux, git, wt, ps, lsof).
///
/// A non-zero exit status is *not* an error at this level; callers inspect
/// [`crate::exec::CommandOutput::exit_code`] themselves.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("{program} is not available: {source}")]
    Unavailable {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} timed out after {}ms", timeout.as_millis())]
    Timeout { program: String, timeout: Duration },
    #[error("{program} {command} failed (exit {exit_code}): {stderr}")]
    Failed {
        program: String,
        command: String,
        exit_code: i32,
        stderr: String,
    },
    #[error("failed to run {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<MuxError> for ApiError {
    fn from(err: MuxError) -> Self {
        match &err {
            MuxError::Unavailable { .. } => ApiError::new(ErrorCode::TmuxUnavailable, err.to_string()),
            _ => ApiError::internal(err.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?} ({reason})")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_serialize_screaming_snake() {
        let err = ApiError::new(ErrorCode::DangerousCommand, "nope");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "DANGEROUS_COMMAND");
        assert_eq!(json["message"], "nope");
        let rate = serde_json::to_value(ErrorCode::RateLimit).unwrap();
        assert_eq!(rate, "RATE_LIMIT");
    }

    #[test]
    fn unavailable_binary_maps_to_tmux_unavailable() {
        let err = MuxError::Unavailable {
            program: "tmux".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        assert_eq!(ApiError::from(err).code, ErrorCode::TmuxUnavailable);

        let err = MuxError::Timeout {
            program: "tmux".to_string(),
            timeout: Duration::from_secs(5),
        };
        let api = ApiError::from(err);
        assert_eq!(api.code, ErrorCode::Internal);
        assert!(api.message.contains("5000ms"));
    }
}
