// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket wire frames: `{type, data?, timestamp?}`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::error::ErrorCode;
use crate::events::{
    ActivityNotice, PresenceUser, SessionError, SessionEvent, TypingIndicator,
};

/// Frames the client sends.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Authenticate { token: String },
    Heartbeat,
    Typing { is_typing: bool },
    Activity { activity_type: String, activity_data: Value },
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::Heartbeat => "heartbeat",
            Self::Typing { .. } => "typing",
            Self::Activity { .. } => "activity",
        }
    }

    fn data(&self) -> Option<Value> {
        match self {
            Self::Authenticate { token } => Some(serde_json::json!({ "token": token })),
            Self::Heartbeat => None,
            Self::Typing { is_typing } => Some(serde_json::json!({ "is_typing": is_typing })),
            Self::Activity { activity_type, activity_data } => Some(serde_json::json!({
                "activity_type": activity_type,
                "activity_data": activity_data,
            })),
        }
    }

    /// Serialize with the current time as `timestamp`.
    pub fn to_frame(&self) -> String {
        self.to_frame_at(Utc::now())
    }

    pub fn to_frame_at(&self, at: DateTime<Utc>) -> String {
        let mut frame = serde_json::Map::new();
        frame.insert("type".to_owned(), Value::String(self.kind().to_owned()));
        if let Some(data) = self.data() {
            frame.insert("data".to_owned(), data);
        }
        frame.insert(
            "timestamp".to_owned(),
            Value::String(at.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        Value::Object(frame).to_string()
    }
}

/// An inbound frame the session could not turn into an event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unknown frame type: {0}")]
    UnknownType(String),
}

impl FrameError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::MalformedFrame
    }
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct PresencePayload {
    #[serde(default)]
    users: Vec<PresenceUser>,
}

#[derive(Deserialize)]
struct ServerErrorPayload {
    message: String,
    #[serde(default)]
    code: Option<String>,
}

fn payload<T: DeserializeOwned>(kind: &str, data: Value) -> Result<T, FrameError> {
    serde_json::from_value(data).map_err(|e| FrameError::Malformed(format!("{kind}: {e}")))
}

/// Parse one inbound text frame into a typed event.
pub fn parse_frame(text: &str) -> Result<SessionEvent, FrameError> {
    let raw: RawFrame =
        serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;
    let kind = raw.kind.as_str();
    match kind {
        "user_joined" => Ok(SessionEvent::UserJoined(payload::<PresenceUser>(kind, raw.data)?)),
        "user_left" => Ok(SessionEvent::UserLeft(payload::<PresenceUser>(kind, raw.data)?)),
        "typing" => Ok(SessionEvent::Typing(payload::<TypingIndicator>(kind, raw.data)?)),
        "activity" => Ok(SessionEvent::Activity(payload::<ActivityNotice>(kind, raw.data)?)),
        "presence_update" => {
            let p: PresencePayload = payload(kind, raw.data)?;
            Ok(SessionEvent::PresenceUpdate { users: p.users })
        }
        "error" => {
            let p: ServerErrorPayload = payload(kind, raw.data)?;
            Ok(SessionEvent::Error(SessionError::Server { message: p.message, code: p.code }))
        }
        other => Err(FrameError::UnknownType(other.to_owned())),
    }
}

#[cfg(test)]
#[path = "frame_tests.rs"]
mod tests;
