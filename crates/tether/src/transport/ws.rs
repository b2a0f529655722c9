// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Realtime WebSocket session.
//!
//! One driver task per `connect()` owns the socket: it authenticates, flushes
//! the outbound queue, runs the heartbeat, dispatches inbound frames, and
//! reconnects with exponential backoff after an unexpected close. The driver
//! is cancelled by `disconnect()` or by dropping the [`WsSession`]; every
//! timer it owns dies with it.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::config::{ClientConfig, OverflowPolicy};
use crate::credential::CredentialStore;
use crate::error::ClientError;
use crate::events::{
    DisconnectReason, EventHub, EventKind, Listener, SessionError, SessionEvent,
};
use crate::tls;
use crate::transport::backoff::ReconnectPolicy;
use crate::transport::frame::{self, ClientMessage, FrameError};
use crate::transport::outbox::Outbox;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Connection parameters, usually taken from [`ClientConfig`].
#[derive(Debug, Clone)]
pub struct WsSettings {
    pub url: String,
    pub connect_timeout: Duration,
    pub heartbeat: Duration,
    pub policy: ReconnectPolicy,
    pub outbox_capacity: usize,
    pub outbox_overflow: OverflowPolicy,
}

impl WsSettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            url: config.ws_endpoint(),
            connect_timeout: config.connect_timeout(),
            heartbeat: config.heartbeat_interval(),
            policy: config.reconnect_policy(),
            outbox_capacity: config.outbox_capacity,
            outbox_overflow: config.outbox_overflow,
        }
    }
}

/// Mutable session state. Only touched under `Inner::state`.
struct Shared {
    connection: ConnectionState,
    /// Reconnect attempts since the last successful connect.
    attempt: u32,
    outbox: Outbox,
    /// Live link to the driver's writer; present only while `Connected`.
    link: Option<mpsc::UnboundedSender<String>>,
    /// Cancellation for the running driver; `None` when no driver is active.
    cancel: Option<CancellationToken>,
}

struct Inner {
    settings: WsSettings,
    store: Arc<CredentialStore>,
    hub: EventHub,
    state: Mutex<Shared>,
}

/// Client side of the realtime channel.
pub struct WsSession {
    inner: Arc<Inner>,
}

impl WsSession {
    pub fn new(settings: WsSettings, store: Arc<CredentialStore>) -> Self {
        let outbox = Outbox::new(settings.outbox_capacity, settings.outbox_overflow);
        let inner = Inner {
            settings,
            store,
            hub: EventHub::default(),
            state: Mutex::new(Shared {
                connection: ConnectionState::Disconnected,
                attempt: 0,
                outbox,
                link: None,
                cancel: None,
            }),
        };
        Self { inner: Arc::new(inner) }
    }

    /// Start connecting. No-op while a driver is already running (connecting,
    /// connected, or waiting to reconnect). Must be called inside a Tokio
    /// runtime.
    pub fn connect(&self) {
        let cancel = {
            let mut s = self.inner.state.lock();
            if s.cancel.is_some() {
                tracing::debug!("websocket already active");
                return;
            }
            let cancel = CancellationToken::new();
            s.cancel = Some(cancel.clone());
            s.connection = ConnectionState::Connecting;
            s.attempt = 0;
            cancel
        };
        tokio::spawn(drive(Arc::clone(&self.inner), cancel));
    }

    /// Close the session and stop reconnecting. Safe in any state.
    ///
    /// Emits `Disconnected { Manual }` only if the link was up. Frames
    /// accepted but not yet written stay queued for the next `connect()`.
    pub fn disconnect(&self) {
        let was_connected = {
            let mut s = self.inner.state.lock();
            let Some(cancel) = s.cancel.take() else {
                return;
            };
            cancel.cancel();
            s.link = None;
            s.attempt = 0;
            let was = s.connection == ConnectionState::Connected;
            s.connection = ConnectionState::Disconnected;
            was
        };
        tracing::info!(url = %self.inner.settings.url, "websocket disconnected by client");
        if was_connected {
            self.inner
                .hub
                .emit(SessionEvent::Disconnected { reason: DisconnectReason::Manual });
        }
    }

    /// Send on the live link, or queue until the next connection.
    pub fn send_message(&self, msg: &ClientMessage) -> Result<(), ClientError> {
        let frame = msg.to_frame();
        let mut s = self.inner.state.lock();
        if s.connection == ConnectionState::Connected {
            if let Some(ref link) = s.link {
                match link.send(frame) {
                    Ok(()) => return Ok(()),
                    Err(mpsc::error::SendError(frame)) => return s.outbox.push(frame),
                }
            }
        }
        tracing::debug!(kind = msg.kind(), queued = s.outbox.len() + 1, "queueing frame");
        s.outbox.push(frame)
    }

    pub fn send_typing(&self, is_typing: bool) -> Result<(), ClientError> {
        self.send_message(&ClientMessage::Typing { is_typing })
    }

    pub fn send_activity(
        &self,
        activity_type: impl Into<String>,
        activity_data: serde_json::Value,
    ) -> Result<(), ClientError> {
        self.send_message(&ClientMessage::Activity {
            activity_type: activity_type.into(),
            activity_data,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().connection
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.state.lock().attempt
    }

    /// Frames waiting for a connection.
    pub fn queued_len(&self) -> usize {
        self.inner.state.lock().outbox.len()
    }

    /// Frames evicted by the drop-oldest overflow policy.
    pub fn dropped_frames(&self) -> u64 {
        self.inner.state.lock().outbox.dropped()
    }

    /// Register a listener. Returns `false` if it was already registered.
    pub fn on(&self, kind: EventKind, listener: Listener) -> bool {
        self.inner.hub.listeners.add(kind, listener)
    }

    /// Unregister a listener. Returns `false` if it was not registered.
    pub fn off(&self, kind: EventKind, listener: &Listener) -> bool {
        self.inner.hub.listeners.remove(kind, listener)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.hub.subscribe()
    }
}

impl Drop for WsSession {
    fn drop(&mut self) {
        if let Some(cancel) = self.inner.state.lock().cancel.take() {
            cancel.cancel();
        }
    }
}

/// Connection driver: connect, serve, back off, repeat.
async fn drive(inner: Arc<Inner>, cancel: CancellationToken) {
    // `wss://` handshakes use the process-wide rustls provider.
    tls::ensure_crypto();
    let url = inner.settings.url.clone();
    loop {
        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            r = tokio::time::timeout(
                inner.settings.connect_timeout,
                tokio_tungstenite::connect_async(url.as_str()),
            ) => r,
        };

        match attempt {
            Ok(Ok((ws, _))) => {
                let Some(reason) = inner.serve(ws, &cancel).await else {
                    return;
                };
                tracing::info!(url = %url, reason = ?reason, "websocket connection lost");
                inner.hub.emit(SessionEvent::Disconnected { reason });
            }
            Ok(Err(e)) => {
                tracing::warn!(url = %url, err = %e, "websocket connect failed");
                if cancel.is_cancelled() {
                    return;
                }
                inner.hub.emit(SessionEvent::Error(SessionError::Transport { message: e.to_string() }));
            }
            Err(_) => {
                let message =
                    format!("connect timed out after {:?}", inner.settings.connect_timeout);
                tracing::warn!(url = %url, "{message}");
                if cancel.is_cancelled() {
                    return;
                }
                inner.hub.emit(SessionEvent::Error(SessionError::Transport { message }));
            }
        }

        let Some(delay) = inner.schedule_retry(&cancel) else {
            return;
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        {
            let mut s = inner.state.lock();
            if cancel.is_cancelled() {
                return;
            }
            s.connection = ConnectionState::Connecting;
        }
    }
}

impl Inner {
    /// Serve one established connection until it drops.
    ///
    /// Returns `None` when cancelled; otherwise the link has been torn down,
    /// unsent frames are back in the outbox, and the reason is returned.
    async fn serve<S>(
        &self,
        ws: tokio_tungstenite::WebSocketStream<S>,
        cancel: &CancellationToken,
    ) -> Option<DisconnectReason>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut sink, mut stream) = ws.split();

        match self.store.access_token() {
            Some(token) => {
                let auth = ClientMessage::Authenticate { token }.to_frame();
                if let Err(e) = sink.send(Message::Text(auth.into())).await {
                    return self.teardown(cancel, Vec::new(), None, DisconnectReason::Lost(e.to_string()));
                }
            }
            None => tracing::warn!("websocket connected without a credential"),
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let flushed = {
            let mut s = self.state.lock();
            if cancel.is_cancelled() {
                None
            } else {
                // Queued frames go first, ahead of anything sent from now on.
                let queued = s.outbox.drain();
                let n = queued.len();
                for frame in queued {
                    let _ = tx.send(frame);
                }
                s.link = Some(tx);
                s.connection = ConnectionState::Connected;
                s.attempt = 0;
                Some(n)
            }
        };
        let Some(flushed) = flushed else {
            let _ = sink.close().await;
            return None;
        };
        tracing::info!(url = %self.settings.url, flushed, "websocket connected");
        self.hub.emit(SessionEvent::Connected);

        let period = self.settings.heartbeat;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let (failed, reason) = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.reclaim(&mut rx);
                    let _ = sink.send(Message::Close(None)).await;
                    return None;
                }
                _ = heartbeat.tick() => {
                    let beat = ClientMessage::Heartbeat.to_frame();
                    if let Err(e) = sink.send(Message::Text(beat.into())).await {
                        break (None, DisconnectReason::Lost(e.to_string()));
                    }
                }
                outbound = rx.recv() => match outbound {
                    Some(frame) => {
                        if let Err(e) = sink.send(Message::Text(frame.clone().into())).await {
                            break (Some(frame), DisconnectReason::Lost(e.to_string()));
                        }
                    }
                    None => {
                        // Sender only goes away on disconnect.
                        self.reclaim(&mut rx);
                        let _ = sink.send(Message::Close(None)).await;
                        return None;
                    }
                },
                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Text(text))) => self.dispatch_frame(&text),
                    Some(Ok(Message::Close(close))) => {
                        let (code, reason) = match close {
                            Some(f) => (Some(u16::from(f.code)), f.reason.as_str().to_owned()),
                            None => (None, String::new()),
                        };
                        break (None, DisconnectReason::Closed { code, reason });
                    }
                    Some(Err(e)) => break (None, DisconnectReason::Lost(e.to_string())),
                    None => break (None, DisconnectReason::Lost("stream ended".to_owned())),
                    // Ping/pong/binary: tungstenite answers pings itself.
                    _ => {}
                },
            }
        };

        self.teardown(cancel, failed.into_iter().collect(), Some(rx), reason)
    }

    /// Drop the live link and put unsent frames back at the head of the
    /// outbox. `None` if cancelled meanwhile.
    fn teardown(
        &self,
        cancel: &CancellationToken,
        mut unsent: Vec<String>,
        rx: Option<mpsc::UnboundedReceiver<String>>,
        reason: DisconnectReason,
    ) -> Option<DisconnectReason> {
        let mut s = self.state.lock();
        if cancel.is_cancelled() {
            return None;
        }
        s.link = None;
        s.connection = ConnectionState::Disconnected;
        // Everything the writer had not taken yet, in order.
        if let Some(mut rx) = rx {
            while let Ok(frame) = rx.try_recv() {
                unsent.push(frame);
            }
        }
        if !unsent.is_empty() {
            tracing::debug!(requeued = unsent.len(), "requeueing unsent frames");
            s.outbox.restore(unsent);
        }
        Some(reason)
    }

    /// After a manual disconnect, move frames the writer never took back to
    /// the outbox, ahead of anything queued since. If a newer connection is
    /// already up they go out on its link instead.
    fn reclaim(&self, rx: &mut mpsc::UnboundedReceiver<String>) {
        rx.close();
        let mut pending = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            pending.push(frame);
        }
        if pending.is_empty() {
            return;
        }
        let mut s = self.state.lock();
        tracing::debug!(requeued = pending.len(), "requeueing frames after disconnect");
        match s.link.clone() {
            Some(link) => {
                let mut unsent = Vec::new();
                for frame in pending {
                    if let Err(mpsc::error::SendError(frame)) = link.send(frame) {
                        unsent.push(frame);
                    }
                }
                s.outbox.restore(unsent);
            }
            None => s.outbox.restore(pending),
        }
    }

    /// Bump the attempt counter and return the delay before reconnecting,
    /// or give up (emitting the terminal error once) when the budget is spent.
    fn schedule_retry(&self, cancel: &CancellationToken) -> Option<Duration> {
        let outcome = {
            let mut s = self.state.lock();
            if cancel.is_cancelled() {
                return None;
            }
            s.connection = ConnectionState::Disconnected;
            let next = s.attempt + 1;
            match self.settings.policy.next_delay(next) {
                Some(delay) => {
                    s.attempt = next;
                    Ok((next, delay))
                }
                None => {
                    s.cancel = None;
                    s.link = None;
                    Err(s.attempt)
                }
            }
        };

        match outcome {
            Ok((attempt, delay)) => {
                tracing::info!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling websocket reconnect"
                );
                Some(delay)
            }
            Err(attempts) => {
                tracing::warn!(attempts, "websocket reconnect attempts exhausted");
                self.hub.emit(SessionEvent::Error(SessionError::MaxReconnectExceeded { attempts }));
                None
            }
        }
    }

    fn dispatch_frame(&self, text: &str) {
        match frame::parse_frame(text) {
            Ok(event) => self.hub.emit(event),
            Err(FrameError::UnknownType(kind)) => {
                tracing::debug!(kind, "ignoring frame of unknown type");
            }
            Err(e) => tracing::warn!(err = %e, "dropping malformed frame"),
        }
    }
}

#[cfg(test)]
#[path = "ws_tests.rs"]
mod tests;
