// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::credential::refresh::RefreshError;

/// Machine-readable error codes shared by the HTTP pipeline, the refresh
/// coordinator, and the WebSocket session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthExpired,
    RefreshFailed,
    NetworkError,
    Timeout,
    MaxReconnectExceeded,
    MalformedFrame,
    HttpStatus,
    ApiError,
    Decode,
    QueueFull,
    InvalidConfig,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthExpired => "AUTH_EXPIRED",
            Self::RefreshFailed => "REFRESH_FAILED",
            Self::NetworkError => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::MaxReconnectExceeded => "MAX_RECONNECT_EXCEEDED",
            Self::MalformedFrame => "MALFORMED_FRAME",
            Self::HttpStatus => "HTTP_STATUS",
            Self::ApiError => "API_ERROR",
            Self::Decode => "DECODE",
            Self::QueueFull => "QUEUE_FULL",
            Self::InvalidConfig => "INVALID_CONFIG",
        }
    }

    /// Whether the condition needs the user to act (sign in again, check
    /// connectivity) rather than being absorbed or retried locally.
    pub fn requires_user_action(&self) -> bool {
        matches!(self, Self::RefreshFailed | Self::AuthExpired | Self::MaxReconnectExceeded)
    }

    /// Whether the condition is a transient transport failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NetworkError | Self::Timeout)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced to callers of the request pipeline and the session.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// The server rejected the access token again after a successful refresh.
    #[error("access token rejected after refresh")]
    AuthExpired,

    /// The credential could not be refreshed.
    #[error("credential refresh failed: {0}")]
    RefreshFailed(#[from] RefreshError),

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    /// Non-success HTTP status other than an absorbed 401.
    #[error("request failed ({status}): {message}")]
    Status { status: u16, message: String },

    /// Envelope reported `success: false`.
    #[error("api error: {message}")]
    Api { message: String },

    #[error("decode error: {0}")]
    Decode(String),

    /// The outbound WebSocket queue is at capacity.
    #[error("outbound queue full ({capacity} frames)")]
    QueueFull { capacity: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AuthExpired => ErrorCode::AuthExpired,
            Self::RefreshFailed(e) => e.code(),
            Self::Network(_) => ErrorCode::NetworkError,
            Self::Timeout => ErrorCode::Timeout,
            Self::Status { .. } => ErrorCode::HttpStatus,
            Self::Api { .. } => ErrorCode::ApiError,
            Self::Decode(_) => ErrorCode::Decode,
            Self::QueueFull { .. } => ErrorCode::QueueFull,
            Self::InvalidConfig(_) => ErrorCode::InvalidConfig,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
