// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket session lifecycle against the mock backend.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tether::{
    ClientConfig, ConnectionState, DisconnectReason, EventKind, Listener, MemoryStore,
    SessionError, SessionEvent, Session, WsSession,
};
use tether_specs::{eventually, MockServer};
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(5);

/// Signed-in session against `server` using `config`.
fn signed_in(server: &MockServer, config: ClientConfig) -> anyhow::Result<Session> {
    let session = Session::new(config, Arc::new(MemoryStore::new()))?;
    let (access, refresh) = server.issue_pair(3600);
    session.store().set_credential(access, refresh);
    Ok(session)
}

/// Wait for the first event satisfying `want`, skipping others.
async fn wait_for(
    rx: &mut broadcast::Receiver<SessionEvent>,
    want: impl Fn(&SessionEvent) -> bool,
) -> anyhow::Result<SessionEvent> {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = rx.recv().await?;
            if want(&event) {
                return Ok::<_, anyhow::Error>(event);
            }
        }
    })
    .await?
}

fn is_connected(e: &SessionEvent) -> bool {
    *e == SessionEvent::Connected
}

/// Listener recording every event it sees with a timestamp.
fn recorder() -> (Listener, Arc<Mutex<Vec<(Instant, SessionEvent)>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let listener: Listener = Arc::new(move |event: &SessionEvent| {
        sink.lock().push((Instant::now(), event.clone()));
    });
    (listener, log)
}

/// Connect and wait until the server has seen the authenticate frame, so
/// server-side pushes and closes reach this connection.
async fn connected(
    ws: &WsSession,
    server: &MockServer,
) -> anyhow::Result<broadcast::Receiver<SessionEvent>> {
    let mut events = ws.subscribe();
    ws.connect();
    wait_for(&mut events, is_connected).await?;
    eventually(WAIT, || {
        let n = server.ws_connections();
        n > 0 && !server.ws_frames(n - 1).is_empty()
    })
    .await?;
    Ok(events)
}

#[tokio::test]
async fn authenticates_then_flushes_queue_in_order() -> anyhow::Result<()> {
    let server = MockServer::spawn().await?;
    let session = signed_in(&server, server.config())?;
    let ws = session.websocket();

    ws.send_typing(true)?;
    ws.send_activity("viewing", json!({ "page": 1 }))?;
    ws.send_typing(false)?;
    assert_eq!(ws.queued_len(), 3);

    let _events = connected(&ws, &server).await?;
    assert_eq!(ws.state(), ConnectionState::Connected);
    assert_eq!(ws.queued_len(), 0);
    ws.send_activity("after", Value::Null)?;

    eventually(WAIT, || server.ws_frames(0).len() >= 5).await?;
    assert_eq!(
        server.ws_frame_types(0),
        vec!["authenticate", "typing", "activity", "typing", "activity"]
    );
    let frames = server.ws_frames(0);
    assert_eq!(frames[0]["data"]["token"].as_str().map(str::to_owned), session.store().access_token());
    assert_eq!(frames[1]["data"]["is_typing"], true);
    assert_eq!(frames[3]["data"]["is_typing"], false);
    assert_eq!(frames[4]["data"]["activity_type"], "after");
    assert!(frames.iter().all(|f| f["timestamp"].is_string()));

    ws.disconnect();
    Ok(())
}

#[tokio::test]
async fn server_close_reconnects_and_replays_queue() -> anyhow::Result<()> {
    let server = MockServer::spawn().await?;
    let session = signed_in(&server, server.config())?;
    let ws = session.websocket();
    let mut events = connected(&ws, &server).await?;

    server.ws_close_all();
    let dropped = wait_for(&mut events, |e| matches!(e, SessionEvent::Disconnected { .. })).await?;
    let down_at = Instant::now();
    assert_eq!(
        dropped,
        SessionEvent::Disconnected {
            reason: DisconnectReason::Closed { code: Some(1001), reason: "going away".into() }
        }
    );

    for i in 1..=3 {
        ws.send_activity("queued", json!(i))?;
    }
    assert_eq!(ws.queued_len(), 3);

    wait_for(&mut events, is_connected).await?;
    assert!(down_at.elapsed() >= Duration::from_millis(90));
    assert_eq!(ws.reconnect_attempts(), 0);

    eventually(WAIT, || server.ws_frames(1).len() >= 4).await?;
    let frames = server.ws_frames(1);
    assert_eq!(frames[0]["type"], "authenticate");
    let replayed: Vec<&Value> = frames[1..4].iter().map(|f| &f["data"]["activity_data"]).collect();
    assert_eq!(replayed, vec![&json!(1), &json!(2), &json!(3)]);

    ws.disconnect();
    Ok(())
}

#[tokio::test]
async fn backoff_grows_and_gives_up_with_one_terminal_error() -> anyhow::Result<()> {
    let server = MockServer::spawn().await?;
    let mut config = server.config();
    config.reconnect_base_ms = 50;
    config.reconnect_cap_ms = 150;
    config.max_reconnect_attempts = 3;
    let session = signed_in(&server, config)?;
    let ws = session.websocket();
    let (listener, log) = recorder();
    ws.on(EventKind::Disconnected, Arc::clone(&listener));
    ws.on(EventKind::Error, listener);
    let mut events = connected(&ws, &server).await?;

    server.stop_listening();
    server.ws_close_all();
    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::Error(SessionError::MaxReconnectExceeded { .. }))
    })
    .await?;
    // Nothing after the terminal error.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let log = log.lock().clone();
    let kinds: Vec<&SessionEvent> = log.iter().map(|(_, e)| e).collect();
    assert_eq!(kinds.len(), 5, "{kinds:?}");
    assert!(matches!(kinds[0], SessionEvent::Disconnected { .. }));
    for e in &kinds[1..4] {
        assert!(matches!(e, SessionEvent::Error(SessionError::Transport { .. })), "{e:?}");
    }
    assert_eq!(
        *kinds[4],
        SessionEvent::Error(SessionError::MaxReconnectExceeded { attempts: 3 })
    );

    // Delay before attempt k is min(50ms * 2^(k-1), 150ms).
    let expected = [50u64, 100, 150];
    for (k, want) in expected.iter().enumerate() {
        let gap = log[k + 1].0.duration_since(log[k].0);
        assert!(gap >= Duration::from_millis(*want), "attempt {}: {gap:?} < {want}ms", k + 1);
    }
    assert_eq!(server.ws_connections(), 1);
    assert_eq!(ws.state(), ConnectionState::Disconnected);
    Ok(())
}

#[tokio::test]
async fn disconnect_while_connected_stops_heartbeat_and_reconnect() -> anyhow::Result<()> {
    let server = MockServer::spawn().await?;
    let mut config = server.config();
    config.heartbeat_ms = 50;
    let session = signed_in(&server, config)?;
    let ws = session.websocket();
    let mut events = connected(&ws, &server).await?;

    eventually(WAIT, || {
        server.ws_frame_types(0).iter().filter(|t| *t == "heartbeat").count() >= 2
    })
    .await?;

    ws.disconnect();
    let event = wait_for(&mut events, |e| matches!(e, SessionEvent::Disconnected { .. })).await?;
    assert_eq!(event, SessionEvent::Disconnected { reason: DisconnectReason::Manual });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let settled = server.ws_frames(0).len();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.ws_frames(0).len(), settled);
    assert_eq!(server.ws_connections(), 1);
    assert_eq!(ws.state(), ConnectionState::Disconnected);
    Ok(())
}

#[tokio::test]
async fn disconnect_keeps_unwritten_frames_for_next_connect() -> anyhow::Result<()> {
    let server = MockServer::spawn().await?;
    let session = signed_in(&server, server.config())?;
    let ws = session.websocket();
    let (listener, log) = recorder();
    ws.on(EventKind::Disconnected, Arc::clone(&listener));
    ws.on(EventKind::Connected, listener);
    let _events = connected(&ws, &server).await?;

    for i in 0..20 {
        ws.send_activity("burst", json!(i))?;
    }
    ws.disconnect();

    let delivered = |conn: usize| -> Vec<Value> {
        server
            .ws_frames(conn)
            .into_iter()
            .filter(|f| f["type"] == "activity")
            .map(|f| f["data"]["activity_data"].clone())
            .collect()
    };
    eventually(WAIT, || ws.queued_len() + delivered(0).len() == 20).await?;
    assert_eq!(ws.state(), ConnectionState::Disconnected);
    // Nothing is dispatched after the manual disconnect.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        log.lock().last().map(|(_, e)| e.clone()),
        Some(SessionEvent::Disconnected { reason: DisconnectReason::Manual })
    );

    let _events = connected(&ws, &server).await?;
    eventually(WAIT, || delivered(0).len() + delivered(1).len() >= 20).await?;
    let mut all = delivered(0);
    all.extend(delivered(1));
    assert_eq!(all, (0..20).map(|i| json!(i)).collect::<Vec<_>>());
    assert_eq!(ws.queued_len(), 0);

    ws.disconnect();
    Ok(())
}

#[tokio::test]
async fn disconnect_while_connecting_never_connects() -> anyhow::Result<()> {
    let server = MockServer::spawn().await?;
    let session = signed_in(&server, server.config())?;
    let ws = session.websocket();
    let mut events = ws.subscribe();

    ws.connect();
    assert_eq!(ws.state(), ConnectionState::Connecting);
    ws.disconnect();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(ws.state(), ConnectionState::Disconnected);
    assert!(server.ws_connections() <= 1);
    Ok(())
}

#[tokio::test]
async fn disconnect_during_backoff_cancels_reconnect() -> anyhow::Result<()> {
    let server = MockServer::spawn().await?;
    let mut config = server.config();
    config.reconnect_base_ms = 200;
    let session = signed_in(&server, config)?;
    let ws = session.websocket();
    let mut events = connected(&ws, &server).await?;

    server.ws_close_all();
    wait_for(&mut events, |e| matches!(e, SessionEvent::Disconnected { .. })).await?;
    ws.disconnect();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(server.ws_connections(), 1);
    assert_eq!(ws.state(), ConnectionState::Disconnected);
    Ok(())
}

#[tokio::test]
async fn inbound_frames_reach_listeners_and_subscribers() -> anyhow::Result<()> {
    let server = MockServer::spawn().await?;
    let session = signed_in(&server, server.config())?;
    let ws = session.websocket();
    let (listener, log) = recorder();
    assert!(ws.on(EventKind::UserJoined, Arc::clone(&listener)));
    assert!(!ws.on(EventKind::UserJoined, Arc::clone(&listener)));
    let mut events = connected(&ws, &server).await?;

    server.ws_push(&json!({ "type": "user_joined", "data": { "user_id": "u9", "username": "lin" } }));
    server.ws_push(&json!({ "type": "no_such_type", "data": {} }));
    server.ws_push(&json!({ "type": "typing", "data": { "missing": "user_id" } }));
    server.ws_push(&json!({ "type": "typing", "data": { "user_id": "u9", "is_typing": true } }));

    let joined = wait_for(&mut events, |e| e.kind() == EventKind::UserJoined).await?;
    let typing = wait_for(&mut events, |e| e.kind() == EventKind::Typing).await?;
    let SessionEvent::UserJoined(user) = joined else {
        anyhow::bail!("expected user_joined, got {joined:?}");
    };
    assert_eq!(user.user_id, "u9");
    assert_eq!(typing.kind(), EventKind::Typing);
    assert_eq!(log.lock().len(), 1);

    assert!(ws.off(EventKind::UserJoined, &listener));
    server.ws_push(&json!({ "type": "user_left", "data": { "user_id": "u9" } }));
    server.ws_push(&json!({ "type": "user_joined", "data": { "user_id": "u10" } }));
    wait_for(&mut events, |e| matches!(e, SessionEvent::UserJoined(u) if u.user_id == "u10")).await?;
    assert_eq!(log.lock().len(), 1);

    ws.disconnect();
    Ok(())
}
