// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;
use crate::transport::backoff::ReconnectPolicy;

pub const DEFAULT_WS_PATH: &str = "/ws";
pub const DEFAULT_LOGIN_PATH: &str = "/api/v1/auth/login";
pub const DEFAULT_REGISTER_PATH: &str = "/api/v1/auth/register";
pub const DEFAULT_REFRESH_PATH: &str = "/api/v1/auth/refresh";
pub const DEFAULT_LOGOUT_PATH: &str = "/api/v1/auth/logout";

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_REFRESH_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_REFRESH_THRESHOLD_MS: u64 = 120_000;
const DEFAULT_MAX_REFRESH_WAITERS: usize = 1024;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_HEARTBEAT_MS: u64 = 30_000;
const DEFAULT_RECONNECT_BASE_MS: u64 = 1_000;
const DEFAULT_RECONNECT_CAP_MS: u64 = 30_000;
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_OUTBOX_CAPACITY: usize = 1024;

/// What the outbound WebSocket queue does when it is full.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Refuse the new frame; `send_message` returns `QueueFull`.
    #[default]
    Reject,
    /// Evict the oldest queued frame (logged) to make room.
    DropOldest,
}

/// Configuration for one client session.
#[derive(Debug, Clone, clap::Args)]
pub struct ClientConfig {
    /// Base URL of the remote service (e.g. `https://api.example.com`).
    #[arg(long, env = "TETHER_API_URL")]
    pub base_url: String,

    /// Explicit WebSocket URL. Derived from `base_url` + `ws_path` when unset.
    #[arg(long, env = "TETHER_WS_URL")]
    pub ws_url: Option<String>,

    /// WebSocket path appended to the derived URL.
    #[arg(long, default_value = DEFAULT_WS_PATH, env = "TETHER_WS_PATH")]
    pub ws_path: String,

    #[arg(long, default_value = DEFAULT_LOGIN_PATH, env = "TETHER_LOGIN_PATH")]
    pub login_path: String,

    #[arg(long, default_value = DEFAULT_REGISTER_PATH, env = "TETHER_REGISTER_PATH")]
    pub register_path: String,

    #[arg(long, default_value = DEFAULT_REFRESH_PATH, env = "TETHER_REFRESH_PATH")]
    pub refresh_path: String,

    #[arg(long, default_value = DEFAULT_LOGOUT_PATH, env = "TETHER_LOGOUT_PATH")]
    pub logout_path: String,

    /// Per-request HTTP timeout in milliseconds.
    #[arg(long, default_value_t = DEFAULT_REQUEST_TIMEOUT_MS, env = "TETHER_REQUEST_TIMEOUT_MS")]
    pub request_timeout_ms: u64,

    /// Timeout for the remote refresh exchange in milliseconds.
    #[arg(long, default_value_t = DEFAULT_REFRESH_TIMEOUT_MS, env = "TETHER_REFRESH_TIMEOUT_MS")]
    pub refresh_timeout_ms: u64,

    /// Refresh proactively when the access token expires within this window.
    #[arg(long, default_value_t = DEFAULT_REFRESH_THRESHOLD_MS, env = "TETHER_REFRESH_THRESHOLD_MS")]
    pub refresh_threshold_ms: u64,

    /// Max callers allowed to wait on one in-flight refresh.
    #[arg(long, default_value_t = DEFAULT_MAX_REFRESH_WAITERS, env = "TETHER_MAX_REFRESH_WAITERS")]
    pub max_refresh_waiters: usize,

    /// WebSocket connect (handshake) timeout in milliseconds.
    #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT_MS, env = "TETHER_CONNECT_TIMEOUT_MS")]
    pub connect_timeout_ms: u64,

    /// Heartbeat interval in milliseconds while connected.
    #[arg(long, default_value_t = DEFAULT_HEARTBEAT_MS, env = "TETHER_HEARTBEAT_MS")]
    pub heartbeat_ms: u64,

    /// Delay before the first reconnect attempt in milliseconds.
    #[arg(long, default_value_t = DEFAULT_RECONNECT_BASE_MS, env = "TETHER_RECONNECT_BASE_MS")]
    pub reconnect_base_ms: u64,

    /// Upper bound on the reconnect delay in milliseconds.
    #[arg(long, default_value_t = DEFAULT_RECONNECT_CAP_MS, env = "TETHER_RECONNECT_CAP_MS")]
    pub reconnect_cap_ms: u64,

    /// Reconnect attempts before giving up with a terminal error event.
    #[arg(long, default_value_t = DEFAULT_MAX_RECONNECT_ATTEMPTS, env = "TETHER_MAX_RECONNECT_ATTEMPTS")]
    pub max_reconnect_attempts: u32,

    /// Randomize reconnect delays into `[delay/2, delay]`.
    #[arg(long, env = "TETHER_RECONNECT_JITTER")]
    pub reconnect_jitter: bool,

    /// Max frames held in the outbound queue while disconnected.
    #[arg(long, default_value_t = DEFAULT_OUTBOX_CAPACITY, env = "TETHER_OUTBOX_CAPACITY")]
    pub outbox_capacity: usize,

    /// Behavior when the outbound queue is full.
    #[arg(long, value_enum, default_value_t = OverflowPolicy::Reject, env = "TETHER_OUTBOX_OVERFLOW")]
    pub outbox_overflow: OverflowPolicy,

    /// File used to persist the credential pair. In-memory only when unset.
    #[arg(long, env = "TETHER_STATE_FILE")]
    pub state_file: Option<PathBuf>,
}

/// Standalone parser so the config can be read from the environment alone.
#[derive(Debug, Parser)]
#[command(name = "tether", no_binary_name = true)]
struct EnvConfig {
    #[command(flatten)]
    config: ClientConfig,
}

impl ClientConfig {
    /// Build a config with defaults for everything except the base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ws_url: None,
            ws_path: DEFAULT_WS_PATH.to_owned(),
            login_path: DEFAULT_LOGIN_PATH.to_owned(),
            register_path: DEFAULT_REGISTER_PATH.to_owned(),
            refresh_path: DEFAULT_REFRESH_PATH.to_owned(),
            logout_path: DEFAULT_LOGOUT_PATH.to_owned(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            refresh_timeout_ms: DEFAULT_REFRESH_TIMEOUT_MS,
            refresh_threshold_ms: DEFAULT_REFRESH_THRESHOLD_MS,
            max_refresh_waiters: DEFAULT_MAX_REFRESH_WAITERS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            heartbeat_ms: DEFAULT_HEARTBEAT_MS,
            reconnect_base_ms: DEFAULT_RECONNECT_BASE_MS,
            reconnect_cap_ms: DEFAULT_RECONNECT_CAP_MS,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_jitter: false,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            outbox_overflow: OverflowPolicy::Reject,
            state_file: None,
        }
    }

    /// Read the config from `TETHER_*` environment variables.
    pub fn from_env() -> Result<Self, ClientError> {
        let parsed = EnvConfig::try_parse_from(std::iter::empty::<String>())
            .map_err(|e| ClientError::InvalidConfig(e.to_string()))?;
        parsed.config.validate()?;
        Ok(parsed.config)
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        let base = self.base_url.trim();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(ClientError::InvalidConfig(format!(
                "base url must be http(s), got {:?}",
                self.base_url
            )));
        }
        if let Some(ref ws) = self.ws_url {
            if !(ws.starts_with("ws://") || ws.starts_with("wss://")) {
                return Err(ClientError::InvalidConfig(format!("ws url must be ws(s), got {ws:?}")));
            }
        }
        if self.heartbeat_ms == 0 {
            return Err(ClientError::InvalidConfig("heartbeat interval must be non-zero".into()));
        }
        if self.reconnect_base_ms > self.reconnect_cap_ms {
            return Err(ClientError::InvalidConfig(format!(
                "reconnect base ({}ms) exceeds cap ({}ms)",
                self.reconnect_base_ms, self.reconnect_cap_ms
            )));
        }
        if self.outbox_capacity == 0 {
            return Err(ClientError::InvalidConfig("outbox capacity must be non-zero".into()));
        }
        Ok(())
    }

    /// Absolute URL for a service path.
    pub fn url(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }

    /// WebSocket endpoint, converting `http(s)://` to `ws(s)://` when derived.
    pub fn ws_endpoint(&self) -> String {
        if let Some(ref url) = self.ws_url {
            return url.clone();
        }
        let base = self.base_url.trim_end_matches('/');
        let ws_base = if base.starts_with("https://") {
            base.replacen("https://", "wss://", 1)
        } else {
            base.replacen("http://", "ws://", 1)
        };
        format!("{ws_base}{}", self.ws_path)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }

    pub fn refresh_threshold(&self) -> Duration {
        Duration::from_millis(self.refresh_threshold_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base: Duration::from_millis(self.reconnect_base_ms),
            cap: Duration::from_millis(self.reconnect_cap_ms),
            max_attempts: self.max_reconnect_attempts,
            jitter: self.reconnect_jitter,
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
