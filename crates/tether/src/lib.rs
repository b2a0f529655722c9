// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tether: client-side communication layer for an authenticated HTTP API and
//! its realtime WebSocket channel.
//!
//! A [`Session`] owns the credential pair, refreshes it ahead of expiry and
//! on rejection (one exchange no matter how many requests are waiting), and
//! hands out [`WsSession`]s that authenticate, heartbeat, queue while
//! offline, and reconnect with exponential backoff.

pub mod config;
pub mod credential;
pub mod error;
pub mod events;
pub mod session;
pub mod tls;
pub mod transport;

pub use config::{ClientConfig, OverflowPolicy};
pub use credential::persist::{FileStore, KeyValueStore, MemoryStore};
pub use credential::refresh::{RefreshCoordinator, RefreshError, TokenExchange};
pub use credential::{Credential, CredentialStore};
pub use error::{ClientError, ErrorCode};
pub use events::{AuthEvent, DisconnectReason, EventKind, Listener, SessionError, SessionEvent};
pub use session::Session;
pub use transport::frame::ClientMessage;
pub use transport::http::{ApiRequest, RequestPipeline};
pub use transport::ws::{ConnectionState, WsSession, WsSettings};
