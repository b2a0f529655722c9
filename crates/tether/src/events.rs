// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event types emitted by the session, plus the listener registry and the
//! broadcast hub that fans them out.
//!
//! Two streams exist: [`AuthEvent`] for credential lifecycle changes (login,
//! refresh, forced logout) and [`SessionEvent`] for the realtime channel.
//! Consumers either register callbacks per [`EventKind`] or subscribe to the
//! broadcast channel and match on the enum.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::ErrorCode;

// -- Auth events -------------------------------------------------------------

/// Credential lifecycle signals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthEvent {
    LoggedIn,
    Refreshed,
    /// The credential was cleared because it could not be recovered. The user
    /// must sign in again.
    ForcedLogout { reason: String },
    LoggedOut,
}

// -- Realtime payloads -------------------------------------------------------

/// A user as reported by presence frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUser {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingIndicator {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityNotice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub activity_type: String,
    #[serde(default)]
    pub activity_data: serde_json::Value,
}

/// Why the realtime link went down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called.
    Manual,
    /// The server sent a close frame.
    Closed { code: Option<u16>, reason: String },
    /// The transport failed or the stream ended without a close frame.
    Lost(String),
}

/// Errors reported through the event stream rather than a return value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Reconnect attempts exhausted. Emitted once; no further reconnects.
    #[error("gave up reconnecting after {attempts} attempts")]
    MaxReconnectExceeded { attempts: u32 },

    /// A connect attempt failed or timed out.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// The server sent an `error` frame.
    #[error("server error: {message}")]
    Server { message: String, code: Option<String> },
}

impl SessionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::MaxReconnectExceeded { .. } => ErrorCode::MaxReconnectExceeded,
            Self::Transport { .. } => ErrorCode::NetworkError,
            Self::Server { .. } => ErrorCode::ApiError,
        }
    }
}

/// Everything the realtime session reports to its consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    Disconnected { reason: DisconnectReason },
    Error(SessionError),
    UserJoined(PresenceUser),
    UserLeft(PresenceUser),
    Typing(TypingIndicator),
    Activity(ActivityNotice),
    PresenceUpdate { users: Vec<PresenceUser> },
}

/// Discriminant of [`SessionEvent`], used as the listener registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    Error,
    UserJoined,
    UserLeft,
    Typing,
    Activity,
    PresenceUpdate,
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connected => EventKind::Connected,
            Self::Disconnected { .. } => EventKind::Disconnected,
            Self::Error(_) => EventKind::Error,
            Self::UserJoined(_) => EventKind::UserJoined,
            Self::UserLeft(_) => EventKind::UserLeft,
            Self::Typing(_) => EventKind::Typing,
            Self::Activity(_) => EventKind::Activity,
            Self::PresenceUpdate { .. } => EventKind::PresenceUpdate,
        }
    }
}

// -- Listener registry -------------------------------------------------------

/// Callback invoked synchronously for each matching event.
pub type Listener = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Identity of a listener: the data pointer, ignoring the vtable.
fn same_listener(a: &Listener, b: &Listener) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Per-kind listener lists. Adding or removing the same `Arc` twice is a no-op.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<HashMap<EventKind, Vec<Listener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the listener was already registered for `kind`.
    pub fn add(&self, kind: EventKind, listener: Listener) -> bool {
        let mut map = self.listeners.lock();
        let list = map.entry(kind).or_default();
        if list.iter().any(|l| same_listener(l, &listener)) {
            return false;
        }
        list.push(listener);
        true
    }

    /// Returns `false` when the listener was not registered for `kind`.
    pub fn remove(&self, kind: EventKind, listener: &Listener) -> bool {
        let mut map = self.listeners.lock();
        let Some(list) = map.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|l| !same_listener(l, listener));
        before != list.len()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.listeners.lock().get(&kind).map_or(0, Vec::len)
    }

    /// Invoke every listener for the event's kind in registration order.
    ///
    /// The list is snapshotted first so listeners may call `add`/`remove`.
    pub fn dispatch(&self, event: &SessionEvent) {
        let snapshot: Vec<Listener> =
            self.listeners.lock().get(&event.kind()).cloned().unwrap_or_default();
        for listener in snapshot {
            listener(event);
        }
    }
}

// -- Hub ---------------------------------------------------------------------

/// Fans session events out to registered listeners and broadcast subscribers.
pub struct EventHub {
    pub listeners: ListenerRegistry,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));
        Self { listeners: ListenerRegistry::new(), event_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    pub fn emit(&self, event: SessionEvent) {
        tracing::trace!(kind = ?event.kind(), "session event");
        self.listeners.dispatch(&event);
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;
