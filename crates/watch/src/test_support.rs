// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test infrastructure: mock job API, mock event server, wait helpers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Poll `check` every few milliseconds until it holds or `timeout` passes.
pub async fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// -- Mock job API --------------------------------------------------------------

/// How the mock answers `POST /api/auth/refresh`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshBehavior {
    /// Issue `access-N` / `refresh-N` and accept `access-N` from then on.
    Issue,
    /// Reject with 401 `invalid_grant`.
    Reject,
}

/// Mock API configuration.
#[derive(Debug, Clone)]
pub struct MockApiConfig {
    /// Access token accepted before any refresh.
    pub valid_token: String,
    pub refresh: RefreshBehavior,
    /// Delay before the refresh endpoint answers.
    pub refresh_delay: Duration,
    /// Scripted `(status, body)` answers for job status; the last one repeats.
    pub statuses: Vec<(u16, Value)>,
    /// Job id returned by `POST /api/jobs`.
    pub job_id: String,
}

impl Default for MockApiConfig {
    fn default() -> Self {
        Self {
            valid_token: "access-0".to_owned(),
            refresh: RefreshBehavior::Issue,
            refresh_delay: Duration::ZERO,
            statuses: vec![(200, json!({"jobId": "g1", "status": "queued"}))],
            job_id: "g1".to_owned(),
        }
    }
}

struct MockApiState {
    config: MockApiConfig,
    valid_token: Mutex<String>,
    refresh_calls: AtomicU32,
    status_calls: AtomicU32,
    seen_tokens: Mutex<Vec<Option<String>>>,
    request_ids: Mutex<Vec<String>>,
}

/// In-process stand-in for the remote job API.
///
/// Protected routes answer 401 unless the bearer token equals the current
/// valid token.
pub struct MockApi {
    pub addr: SocketAddr,
    state: Arc<MockApiState>,
    shutdown: CancellationToken,
}

impl MockApi {
    pub async fn start(config: MockApiConfig) -> anyhow::Result<Self> {
        let state = Arc::new(MockApiState {
            valid_token: Mutex::new(config.valid_token.clone()),
            config,
            refresh_calls: AtomicU32::new(0),
            status_calls: AtomicU32::new(0),
            seen_tokens: Mutex::new(Vec::new()),
            request_ids: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/api/auth/refresh", post(refresh))
            .route("/api/auth/login", post(login))
            .route("/api/protected", get(protected))
            .route("/api/open", get(open))
            .route("/api/broken", get(broken))
            .route("/api/jobs", post(create_job))
            .route("/api/jobs/{id}/status", get(job_status))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app).with_graceful_shutdown(stop.cancelled_owned()).await.ok();
        });

        Ok(Self { addr, state, shutdown })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn refresh_calls(&self) -> u32 {
        self.state.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> u32 {
        self.state.status_calls.load(Ordering::SeqCst)
    }

    /// Tokens presented to protected routes, in arrival order.
    pub fn seen_tokens(&self) -> Vec<Option<String>> {
        self.state.seen_tokens.lock().clone()
    }

    pub fn request_ids(&self) -> Vec<String> {
        self.state.request_ids.lock().clone()
    }

    /// Invalidate the current access token without issuing a new one.
    pub fn revoke_access(&self) {
        *self.state.valid_token.lock() = "revoked".to_owned();
    }
}

impl Drop for MockApi {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_owned)
}

/// Record the request and check its bearer token.
fn authorize(state: &MockApiState, headers: &HeaderMap) -> Result<(), Response> {
    let token = bearer(headers);
    if let Some(rid) = headers.get("x-request-id").and_then(|v| v.to_str().ok()) {
        state.request_ids.lock().push(rid.to_owned());
    }
    state.seen_tokens.lock().push(token.clone());
    if token.as_deref() == Some(state.valid_token.lock().as_str()) {
        Ok(())
    } else {
        Err((StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"}))).into_response())
    }
}

async fn refresh(State(state): State<Arc<MockApiState>>, Json(body): Json<Value>) -> Response {
    let n = state.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
    if !state.config.refresh_delay.is_zero() {
        tokio::time::sleep(state.config.refresh_delay).await;
    }
    let presented = body.get("refreshToken").and_then(Value::as_str).unwrap_or_default();
    if state.config.refresh == RefreshBehavior::Reject || presented.is_empty() {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "invalid_grant"}))).into_response();
    }
    let access = format!("access-{n}");
    *state.valid_token.lock() = access.clone();
    Json(json!({"accessToken": access, "refreshToken": format!("refresh-{n}")})).into_response()
}

async fn login(State(state): State<Arc<MockApiState>>, Json(body): Json<Value>) -> Response {
    if body.get("password").and_then(Value::as_str) == Some("wrong") {
        return (StatusCode::UNAUTHORIZED, "bad credentials").into_response();
    }
    let access = state.valid_token.lock().clone();
    Json(json!({"accessToken": access, "refreshToken": "refresh-0"})).into_response()
}

async fn protected(State(state): State<Arc<MockApiState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    Json(json!({"ok": true})).into_response()
}

async fn open(State(state): State<Arc<MockApiState>>, headers: HeaderMap) -> Response {
    state.seen_tokens.lock().push(bearer(&headers));
    Json(json!({"open": true})).into_response()
}

async fn broken() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response()
}

async fn create_job(State(state): State<Arc<MockApiState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    Json(json!({"jobId": state.config.job_id})).into_response()
}

async fn job_status(
    State(state): State<Arc<MockApiState>>,
    Path(_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    let idx = state.status_calls.fetch_add(1, Ordering::SeqCst) as usize;
    let scripted = state
        .config
        .statuses
        .get(idx)
        .or_else(|| state.config.statuses.last())
        .cloned()
        .unwrap_or((500, Value::Null));
    let code = StatusCode::from_u16(scripted.0).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (code, Json(scripted.1)).into_response()
}

// -- Mock event server ---------------------------------------------------------

struct EventServerState {
    token: String,
    outbound: broadcast::Sender<String>,
    kick: broadcast::Sender<()>,
    received: Mutex<Vec<Value>>,
    connections: AtomicU32,
    open: AtomicU32,
}

/// In-process WebSocket event server.
///
/// Accepts `/ws?token=...` when the token matches, records every text frame
/// the client sends, and fans out whatever the test pushes via [`send`].
///
/// [`send`]: MockEventServer::send
pub struct MockEventServer {
    pub addr: SocketAddr,
    state: Arc<EventServerState>,
    shutdown: CancellationToken,
}

impl MockEventServer {
    pub async fn start(token: &str) -> anyhow::Result<Self> {
        let (outbound, _) = broadcast::channel(256);
        let (kick, _) = broadcast::channel(4);
        let state = Arc::new(EventServerState {
            token: token.to_owned(),
            outbound,
            kick,
            received: Mutex::new(Vec::new()),
            connections: AtomicU32::new(0),
            open: AtomicU32::new(0),
        });

        let app = Router::new().route("/ws", get(ws_upgrade)).with_state(Arc::clone(&state));
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app).with_graceful_shutdown(stop.cancelled_owned()).await.ok();
        });

        Ok(Self { addr, state, shutdown })
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Push a raw text frame to every open connection.
    pub fn send(&self, text: impl Into<String>) {
        let _ = self.state.outbound.send(text.into());
    }

    pub fn send_json(&self, value: Value) {
        self.send(value.to_string());
    }

    /// Close every open connection from the server side.
    pub fn drop_connections(&self) {
        let _ = self.state.kick.send(());
    }

    /// Close connections and stop accepting new ones.
    pub fn shutdown(&self) {
        self.drop_connections();
        self.shutdown.cancel();
    }

    /// Client frames received so far, parsed as JSON.
    pub fn received(&self) -> Vec<Value> {
        self.state.received.lock().clone()
    }

    /// Number of `{"event": kind, "jobId": job_id}` frames received.
    pub fn control_count(&self, kind: &str, job_id: &str) -> usize {
        self.state
            .received
            .lock()
            .iter()
            .filter(|v| v["event"] == kind && v["jobId"] == job_id)
            .count()
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> u32 {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Connections currently open.
    pub fn open_connections(&self) -> u32 {
        self.state.open.load(Ordering::SeqCst)
    }
}

impl Drop for MockEventServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn ws_upgrade(
    State(state): State<Arc<EventServerState>>,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    if query.get("token") != Some(&state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let outbound = state.outbound.subscribe();
    let kick = state.kick.subscribe();
    ws.on_upgrade(move |socket| handle_socket(state, socket, outbound, kick)).into_response()
}

async fn handle_socket(
    state: Arc<EventServerState>,
    mut socket: WebSocket,
    mut outbound: broadcast::Receiver<String>,
    mut kick: broadcast::Receiver<()>,
) {
    state.connections.fetch_add(1, Ordering::SeqCst);
    state.open.fetch_add(1, Ordering::SeqCst);
    loop {
        tokio::select! {
            _ = kick.recv() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            out = outbound.recv() => {
                match out {
                    Ok(text) => {
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(value) = serde_json::from_str::<Value>(text.as_str()) {
                            state.received.lock().push(value);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    state.open.fetch_sub(1, Ordering::SeqCst);
}
