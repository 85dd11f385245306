//! Runtime configuration, read once from the environment at startup.

use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Terminal multiplexer the panes live in. Only tmux supports resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Tmux,
    Wezterm,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tmux" => Ok(Self::Tmux),
            "wezterm" => Ok(Self::Wezterm),
            _ => Err("expected tmux or wezterm".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: IpAddr,
    pub port: u16,
    pub token: Option<String>,
    pub read_only: bool,
    pub backend: BackendKind,
    pub tmux_bin: String,
    pub tmux_socket: Option<String>,
    pub command_timeout: Duration,
    pub poll_interval: Duration,
    pub submit_key: String,
    pub worktree_tool: String,
    pub screen_limit: u32,
    pub send_limit: u32,
    pub rate_window: Duration,
    pub idempotency_ttl: Duration,
    pub idempotency_capacity: usize,
    pub claude_projects_dir: PathBuf,
    pub codex_sessions_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let home = get("HOME").unwrap_or_else(|| "/home/user".to_string());

        Ok(Self {
            bind_addr: parse(&get, "BIND_ADDR", IpAddr::from([0, 0, 0, 0]))?,
            port: parse(&get, "PORT", 4860)?,
            token: get("AGENT_MONITOR_TOKEN"),
            read_only: flag(&get, "AGENT_MONITOR_READ_ONLY")?,
            backend: parse(&get, "AGENT_MONITOR_BACKEND", BackendKind::Tmux)?,
            tmux_bin: get("AGENT_MONITOR_TMUX_BIN").unwrap_or_else(|| "tmux".to_string()),
            tmux_socket: get("AGENT_MONITOR_TMUX_SOCKET"),
            command_timeout: millis(&get, "AGENT_MONITOR_COMMAND_TIMEOUT_MS", 5000)?,
            poll_interval: millis(&get, "AGENT_MONITOR_POLL_MS", 1000)?,
            submit_key: get("AGENT_MONITOR_SUBMIT_KEY").unwrap_or_else(|| "Enter".to_string()),
            worktree_tool: get("AGENT_MONITOR_WORKTREE_TOOL").unwrap_or_else(|| "wt".to_string()),
            screen_limit: parse(&get, "AGENT_MONITOR_SCREEN_LIMIT", 30)?,
            send_limit: parse(&get, "AGENT_MONITOR_SEND_LIMIT", 20)?,
            rate_window: millis(&get, "AGENT_MONITOR_RATE_WINDOW_MS", 10_000)?,
            idempotency_ttl: millis(&get, "AGENT_MONITOR_IDEMPOTENCY_TTL_MS", 60_000)?,
            idempotency_capacity: parse(&get, "AGENT_MONITOR_IDEMPOTENCY_CAPACITY", 1000)?,
            claude_projects_dir: PathBuf::from(&home).join(".claude").join("projects"),
            codex_sessions_dir: PathBuf::from(&home).join(".codex").join("sessions"),
        })
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(name) {
        None => Ok(default),
        Some(value) => {
            let parsed: Result<T, T::Err> = value.parse();
            parsed.map_err(|e| ConfigError::InvalidValue {
                name,
                reason: e.to_string(),
                value,
            })
        }
    }
}

fn millis(get: &impl Fn(&str) -> Option<String>, name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let ms: u64 = parse(get, name, default)?;
    if ms == 0 {
        return Err(ConfigError::InvalidValue {
            name,
            value: "0".to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_millis(ms))
}

fn flag(get: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<bool, ConfigError> {
    match get(name).map(|v| v.to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                name,
                value: v.clone(),
                reason: "expected a boolean".to_string(),
            }),
        },
    }
}
