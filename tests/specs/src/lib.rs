// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end client tests.
//!
//! Spawns an in-process axum backend on an ephemeral port that speaks the
//! auth, business, and realtime protocols the client expects, with knobs to
//! make refreshes slow or fail, revoke tokens, and drop WebSocket links.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tether::ClientConfig;
use tokio::sync::broadcast;

static TRACING_INIT: Once = Once::new();

/// Install a test subscriber honoring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Mint an unsigned JWT-shaped token expiring `ttl_secs` from now.
pub fn mint_token(ttl_secs: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
    let exp = now_secs() + ttl_secs;
    let payload = json!({ "sub": "user-1", "exp": exp, "jti": uuid::Uuid::new_v4().to_string() });
    let payload = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("{header}.{payload}.c2ln")
}

fn now_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or_default()
}

/// Read the `exp` claim of a minted token.
pub fn token_exp(token: &str) -> Option<i64> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    serde_json::from_slice::<Value>(&bytes).ok()?.get("exp")?.as_i64()
}

/// Commands pushed to every open WebSocket connection.
#[derive(Debug, Clone)]
enum WsCommand {
    Close,
    Push(String),
}

/// Shared backend state.
struct Backend {
    access: Mutex<HashMap<String, i64>>,
    refresh: Mutex<HashSet<String>>,
    access_ttl_secs: AtomicU64,
    refresh_calls: AtomicU32,
    refresh_delay_ms: AtomicU64,
    refresh_fail: AtomicBool,
    reject_all: AtomicBool,
    /// Bearer token (if any) seen by each `/api/v1/projects` hit.
    seen: Mutex<Vec<Option<String>>>,
    /// Frames received per WebSocket connection, in arrival order.
    ws_frames: Mutex<Vec<Vec<Value>>>,
    ws_commands: broadcast::Sender<WsCommand>,
}

impl Backend {
    fn issue(&self, ttl_secs: i64) -> (String, String) {
        let access = mint_token(ttl_secs);
        let refresh = format!("refresh-{}", uuid::Uuid::new_v4());
        self.access.lock().insert(access.clone(), now_secs() + ttl_secs);
        self.refresh.lock().insert(refresh.clone());
        (access, refresh)
    }

    fn authorized(&self, headers: &HeaderMap) -> (Option<String>, bool) {
        let token = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_owned);
        if self.reject_all.load(Ordering::SeqCst) {
            return (token, false);
        }
        let ok = match token {
            Some(ref t) => self.access.lock().get(t).is_some_and(|exp| *exp > now_secs()),
            None => false,
        };
        (token, ok)
    }
}

fn unauthorized(message: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "success": false, "message": message }))).into_response()
}

fn build_router(backend: Arc<Backend>) -> Router {
    Router::new()
        .route("/api/v1/auth/login", post(login))
        .route("/api/v1/auth/register", post(register))
        .route("/api/v1/auth/refresh", post(refresh))
        .route("/api/v1/auth/logout", post(logout))
        .route("/api/v1/projects", get(projects))
        .route("/api/v1/plain", get(plain))
        .route("/api/v1/broken", get(broken))
        .route("/api/v1/failed", get(failed))
        .route("/ws", get(ws_upgrade))
        .with_state(backend)
}

async fn login(State(b): State<Arc<Backend>>, Json(body): Json<Value>) -> Response {
    if body.get("password").and_then(Value::as_str) == Some("wrong") {
        return unauthorized("invalid credentials");
    }
    let (access, refresh) = b.issue(b.access_ttl_secs.load(Ordering::SeqCst) as i64);
    Json(json!({
        "success": true,
        "status": 200,
        "data": {
            "user": { "id": "user-1", "username": body.get("username") },
            "access_token": access,
            "refresh_token": refresh,
        }
    }))
    .into_response()
}

async fn register(State(b): State<Arc<Backend>>, Json(body): Json<Value>) -> Response {
    let (access, refresh) = b.issue(b.access_ttl_secs.load(Ordering::SeqCst) as i64);
    (
        StatusCode::CREATED,
        Json(json!({
            "user": { "id": "user-2", "username": body.get("username") },
            "tokens": { "access_token": access, "refresh_token": refresh },
        })),
    )
        .into_response()
}

async fn refresh(State(b): State<Arc<Backend>>, Json(body): Json<Value>) -> Response {
    b.refresh_calls.fetch_add(1, Ordering::SeqCst);
    let delay = b.refresh_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    if b.refresh_fail.load(Ordering::SeqCst) {
        return unauthorized("refresh token expired");
    }
    let presented = body.get("refresh_token").and_then(Value::as_str).unwrap_or_default();
    // Rotation: each refresh token works once.
    if !b.refresh.lock().remove(presented) {
        return unauthorized("unknown refresh token");
    }
    let (access, refresh) = b.issue(b.access_ttl_secs.load(Ordering::SeqCst) as i64);
    Json(json!({ "success": true, "data": { "access_token": access, "refresh_token": refresh } }))
        .into_response()
}

async fn logout(State(b): State<Arc<Backend>>, Json(body): Json<Value>) -> StatusCode {
    if let Some(token) = body.get("refresh_token").and_then(Value::as_str) {
        b.refresh.lock().remove(token);
    }
    StatusCode::NO_CONTENT
}

async fn projects(State(b): State<Arc<Backend>>, headers: HeaderMap) -> Response {
    let (token, ok) = b.authorized(&headers);
    b.seen.lock().push(token);
    if !ok {
        return unauthorized("access token expired");
    }
    Json(json!({
        "success": true,
        "status": 200,
        "data": [{ "id": 1, "name": "alpha" }, { "id": 2, "name": "beta" }],
    }))
    .into_response()
}

async fn plain(State(b): State<Arc<Backend>>, headers: HeaderMap) -> Response {
    if !b.authorized(&headers).1 {
        return unauthorized("access token expired");
    }
    Json(json!({ "id": 7, "data": "not an envelope" })).into_response()
}

async fn broken() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "boom" }))).into_response()
}

async fn failed() -> Response {
    Json(json!({ "success": false, "message": "quota exceeded", "data": null })).into_response()
}

async fn ws_upgrade(State(b): State<Arc<Backend>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, b)).into_response()
}

async fn handle_socket(socket: WebSocket, b: Arc<Backend>) {
    let conn = {
        let mut frames = b.ws_frames.lock();
        frames.push(Vec::new());
        frames.len() - 1
    };
    let mut commands = b.ws_commands.subscribe();
    let (mut tx, mut rx) = socket.split();

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Ok(WsCommand::Close) => {
                    let frame = CloseFrame { code: 1001, reason: "going away".into() };
                    let _ = tx.send(Message::Close(Some(frame))).await;
                    break;
                }
                Ok(WsCommand::Push(text)) => {
                    if tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let value = serde_json::from_str(text.as_str())
                        .unwrap_or_else(|_| Value::String(text.as_str().to_owned()));
                    if let Some(frames) = b.ws_frames.lock().get_mut(conn) {
                        frames.push(value);
                    }
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                _ => {}
            },
        }
    }
}

/// A running mock backend. The server task is aborted on drop.
pub struct MockServer {
    addr: SocketAddr,
    backend: Arc<Backend>,
    handle: tokio::task::JoinHandle<()>,
}

impl MockServer {
    /// Bind an ephemeral port and start serving.
    pub async fn spawn() -> anyhow::Result<Self> {
        init_tracing();
        let (ws_commands, _) = broadcast::channel(64);
        let backend = Arc::new(Backend {
            access: Mutex::new(HashMap::new()),
            refresh: Mutex::new(HashSet::new()),
            access_ttl_secs: AtomicU64::new(3600),
            refresh_calls: AtomicU32::new(0),
            refresh_delay_ms: AtomicU64::new(0),
            refresh_fail: AtomicBool::new(false),
            reject_all: AtomicBool::new(false),
            seen: Mutex::new(Vec::new()),
            ws_frames: Mutex::new(Vec::new()),
            ws_commands,
        });
        let router = build_router(Arc::clone(&backend));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        Ok(Self { addr, backend, handle })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Client config against this server with test-sized timings.
    pub fn config(&self) -> ClientConfig {
        let mut config = ClientConfig::new(self.base_url());
        config.request_timeout_ms = 5_000;
        config.refresh_timeout_ms = 5_000;
        config.connect_timeout_ms = 2_000;
        config.heartbeat_ms = 10_000;
        config.reconnect_base_ms = 100;
        config.reconnect_cap_ms = 800;
        config.max_reconnect_attempts = 3;
        config
    }

    /// Issue a credential pair the server will accept, the access token
    /// expiring in `ttl_secs` (negative for already expired).
    pub fn issue_pair(&self, ttl_secs: i64) -> (String, String) {
        self.backend.issue(ttl_secs)
    }

    /// Stop accepting `token` even though its claim says it is still valid.
    pub fn revoke_access(&self, token: &str) {
        self.backend.access.lock().remove(token);
    }

    pub fn refresh_calls(&self) -> u32 {
        self.backend.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        self.backend.refresh_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_refresh_fail(&self, fail: bool) {
        self.backend.refresh_fail.store(fail, Ordering::SeqCst);
    }

    /// Answer 401 to every authenticated endpoint regardless of token.
    pub fn set_reject_all(&self, reject: bool) {
        self.backend.reject_all.store(reject, Ordering::SeqCst);
    }

    /// Lifetime of access tokens issued by login and refresh.
    pub fn set_access_ttl(&self, ttl_secs: u64) {
        self.backend.access_ttl_secs.store(ttl_secs, Ordering::SeqCst);
    }

    /// Bearer tokens seen by `/api/v1/projects`, in arrival order.
    pub fn seen_tokens(&self) -> Vec<Option<String>> {
        self.backend.seen.lock().clone()
    }

    pub fn ws_connections(&self) -> usize {
        self.backend.ws_frames.lock().len()
    }

    pub fn ws_frames(&self, conn: usize) -> Vec<Value> {
        self.backend.ws_frames.lock().get(conn).cloned().unwrap_or_default()
    }

    /// `type` of each frame received on connection `conn`.
    pub fn ws_frame_types(&self, conn: usize) -> Vec<String> {
        self.ws_frames(conn)
            .iter()
            .map(|f| f.get("type").and_then(Value::as_str).unwrap_or_default().to_owned())
            .collect()
    }

    /// Close every open WebSocket with a going-away frame.
    pub fn ws_close_all(&self) {
        let _ = self.backend.ws_commands.send(WsCommand::Close);
    }

    /// Send a text frame to every open WebSocket.
    pub fn ws_push(&self, frame: &Value) {
        let _ = self.backend.ws_commands.send(WsCommand::Push(frame.to_string()));
    }

    /// Stop accepting new connections. Open WebSockets stay up until closed.
    pub fn stop_listening(&self) {
        self.handle.abort();
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Poll `check` every 10ms until it returns true or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> anyhow::Result<()> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    anyhow::ensure!(check(), "condition not met within {timeout:?}");
    Ok(())
}
