use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{Path as AxumPath, Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use gasoline_capture::extension::SyncCommandResult;
use gasoline_capture::{BufferKind, Capture, CiResult, PollEvent, RecordOutcome, SyncRequest};
use gasoline_core::{Config, Paths, SERVICE_NAME};
use gasoline_storage::{Journal, TrustDecision, TrustStore};
use gasoline_tools::mcp::McpDispatcher;
use gasoline_tools::observe::health_report;
use gasoline_tools::redaction::RedactionEngine;
use gasoline_tools::ToolState;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

pub const CLIENT_HEADER: &str = "x-gasoline-client";
pub const KEY_HEADER: &str = "x-gasoline-key";

const EXTENSION_CLIENT: &str = "gasoline-extension";
const ALLOW_METHODS: &str = "GET, POST, DELETE, OPTIONS";
const ALLOW_HEADERS: &str = "Content-Type, X-Gasoline-Key, X-Gasoline-Client, X-Gasoline-Extension-Version";

const MIB: usize = 1024 * 1024;
const INGEST_BODY_LIMIT: usize = MIB;
const NETWORK_BODY_LIMIT: usize = 5 * MIB;
const MCP_BODY_LIMIT: usize = 5 * MIB;
const SYNC_LONG_POLL: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Shared state passed to HTTP handlers
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct GatewayState {
    pub capture: Arc<Capture>,
    pub dispatcher: Arc<McpDispatcher>,
    pub trust: Arc<TrustStore>,
    pub journal: Option<Arc<Journal>>,
    /// Expected `X-Gasoline-Key`; `None` disables the check.
    pub api_key: Option<String>,
    pub shutdown_tx: broadcast::Sender<()>,
}

impl GatewayState {
    pub fn new(
        paths: &Paths,
        config: Config,
        journal: Option<Arc<Journal>>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        let capture = Arc::new(Capture::new(&config));
        let redaction_path = config
            .tools
            .redaction_config
            .as_ref()
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|| paths.redaction_config());
        let redaction = RedactionEngine::load(&redaction_path);
        let api_key = config.api_key().map(String::from);
        let tool_state = Arc::new(ToolState::new(capture.clone(), config, redaction));
        Self {
            capture,
            dispatcher: Arc::new(McpDispatcher::new(tool_state, journal.clone())),
            trust: Arc::new(TrustStore::load(paths)),
            journal,
            api_key,
            shutdown_tx,
        }
    }
}

fn secure_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (&x, &y) in a.as_bytes().iter().zip(b.as_bytes().iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn is_loopback_name(name: &str) -> bool {
    matches!(name, "localhost" | "127.0.0.1" | "::1")
}

/// `Host` must be present and name the loopback interface, with or without a port.
fn host_allowed(host: &str) -> bool {
    if host.is_empty() {
        return false;
    }
    let name = if let Some(rest) = host.strip_prefix('[') {
        rest.split(']').next().unwrap_or_default()
    } else if host.matches(':').count() > 1 {
        host
    } else {
        host.split(':').next().unwrap_or_default()
    };
    is_loopback_name(name)
}

/// Extension origins go through pairing; anything else must be a loopback page.
fn origin_allowed(trust: &TrustStore, origin: &str) -> bool {
    match trust.check_origin(origin) {
        TrustDecision::Trusted | TrustDecision::Paired => true,
        TrustDecision::Rejected => false,
        TrustDecision::NotExtension => url::Url::parse(origin)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.trim_matches(['[', ']']).to_string()))
            .is_some_and(|h| is_loopback_name(&h)),
    }
}

/// `gasoline-extension`, `gasoline-extension-<variant>`, optionally followed by `/<version>`.
fn is_extension_client(value: &str) -> bool {
    let base = value.split('/').next().unwrap_or_default();
    base == EXTENSION_CLIENT
        || base
            .strip_prefix(EXTENSION_CLIENT)
            .and_then(|rest| rest.strip_prefix('-'))
            .is_some_and(|variant| !variant.is_empty())
}

fn error_json(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn bad_request(message: &str) -> Response {
    error_json(StatusCode::BAD_REQUEST, message)
}

fn apply_cors(headers: &mut HeaderMap, origin: &HeaderValue) {
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
    headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static(ALLOW_METHODS));
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static(ALLOW_HEADERS));
    headers.insert(header::VARY, HeaderValue::from_static("Origin"));
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Host and Origin checks, CORS, preflight, and the optional shared secret.
async fn guard_middleware(State(state): State<GatewayState>, req: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let host = header_str(req.headers(), header::HOST.as_str())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
        .unwrap_or_default();
    if !host_allowed(host) {
        warn!(host, path = %path, "Rejected request with foreign Host header");
        return (StatusCode::FORBIDDEN, "Invalid Host header").into_response();
    }

    let origin = req.headers().get(header::ORIGIN).cloned();
    if let Some(origin) = &origin {
        let allowed = origin
            .to_str()
            .map(|o| o.is_empty() || origin_allowed(&state.trust, o))
            .unwrap_or(false);
        if !allowed {
            warn!(origin = ?origin, path = %path, "Rejected request from disallowed origin");
            return error_json(StatusCode::FORBIDDEN, "Origin not allowed");
        }
    }

    if method == Method::OPTIONS {
        let mut resp = StatusCode::NO_CONTENT.into_response();
        if let Some(origin) = &origin {
            apply_cors(resp.headers_mut(), origin);
        }
        return resp;
    }

    if let Some(key) = state.api_key.as_deref() {
        let authorized = path == "/health"
            || header_str(req.headers(), KEY_HEADER).is_some_and(|v| secure_eq(v, key));
        if !authorized {
            return error_json(StatusCode::UNAUTHORIZED, "Unauthorized: invalid or missing X-Gasoline-Key");
        }
    }

    let mut resp = next.run(req).await;
    if let Some(origin) = &origin {
        apply_cors(resp.headers_mut(), origin);
    }

    let status = resp.status();
    if status.is_client_error() || status.is_server_error() {
        if let Some(journal) = &state.journal {
            journal.http_request(method.as_str(), &path, status.as_u16(), started.elapsed().as_millis() as u64);
        }
    }
    resp
}

async fn extension_only(req: Request, next: Next) -> Response {
    let allowed = header_str(req.headers(), CLIENT_HEADER).is_some_and(is_extension_client);
    if !allowed {
        return error_json(
            StatusCode::FORBIDDEN,
            "forbidden: missing or invalid X-Gasoline-Client header",
        );
    }
    next.run(req).await
}

// ---------------------------------------------------------------------------
// Body helpers
// ---------------------------------------------------------------------------

async fn read_json(body: Body, limit: usize) -> Result<Value, Response> {
    let bytes = axum::body::to_bytes(body, limit)
        .await
        .map_err(|_| bad_request("Request body too large"))?;
    serde_json::from_slice(&bytes).map_err(|_| bad_request("Invalid JSON"))
}

/// Accept `{<key>: [...]}` or a bare array whose elements are all objects.
/// A single malformed element rejects the whole batch.
fn unwrap_records(body: Value, key: &str) -> Result<Vec<Value>, String> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove(key) {
            Some(Value::Array(items)) => items,
            _ => return Err(format!("Expected {{\"{}\": [...]}} or a JSON array", key)),
        },
        _ => return Err(format!("Expected {{\"{}\": [...]}} or a JSON array", key)),
    };
    if let Some(index) = items.iter().position(|item| !item.is_object()) {
        return Err(format!("Element {} of {} is not a JSON object", index, key));
    }
    Ok(items)
}

fn invalid_json(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": "invalid_json", "message": message }))).into_response()
}

type HandlerResult = Result<Response, Response>;

// ---------------------------------------------------------------------------
// MCP, health, lifecycle
// ---------------------------------------------------------------------------

async fn handle_mcp(State(state): State<GatewayState>, headers: HeaderMap, body: Body) -> HandlerResult {
    let client_id = header_str(&headers, CLIENT_HEADER).unwrap_or_default().to_string();
    if !client_id.is_empty() {
        state.capture.clients.touch(&client_id);
    }
    let bytes = axum::body::to_bytes(body, MCP_BODY_LIMIT)
        .await
        .map_err(|_| bad_request("Request body too large"))?;
    Ok(match state.dispatcher.handle_body(&bytes, &client_id).await {
        Some(resp) => Json(resp).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

async fn handle_health(State(state): State<GatewayState>) -> Json<Value> {
    let mut report = health_report(&state.capture);
    if let Value::Object(map) = &mut report {
        map.insert("status".into(), json!("ok"));
        map.insert("service".into(), json!(SERVICE_NAME));
        map.insert("version".into(), json!(env!("CARGO_PKG_VERSION")));
        map.insert("pid".into(), json!(std::process::id()));
    }
    Json(report)
}

async fn handle_shutdown(State(state): State<GatewayState>) -> Json<Value> {
    info!("Shutdown requested over HTTP");
    let _ = state.shutdown_tx.send(());
    Json(json!({ "status": "shutting_down" }))
}

// ---------------------------------------------------------------------------
// Clients
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RegisterRequest {
    #[serde(default)]
    cwd: String,
}

async fn handle_clients_list(State(state): State<GatewayState>) -> Json<Value> {
    let clients = state.capture.clients.list();
    Json(json!({ "count": clients.len(), "clients": clients }))
}

async fn handle_clients_register(State(state): State<GatewayState>, body: Body) -> HandlerResult {
    let value = read_json(body, INGEST_BODY_LIMIT).await?;
    let req: RegisterRequest = serde_json::from_value(value).map_err(|_| bad_request("Invalid JSON"))?;
    if req.cwd.trim().is_empty() {
        return Err(bad_request("cwd is required"));
    }
    let info = state.capture.clients.register(&req.cwd);
    debug!(client_id = %info.id, cwd = %info.cwd, "Client registered");
    Ok(Json(json!({ "id": info.id, "cwd": info.cwd })).into_response())
}

async fn handle_client_get(State(state): State<GatewayState>, AxumPath(id): AxumPath<String>) -> Response {
    match state.capture.clients.get(&id) {
        Some(info) => Json(info).into_response(),
        None => error_json(StatusCode::NOT_FOUND, "client not found"),
    }
}

async fn handle_client_delete(State(state): State<GatewayState>, AxumPath(id): AxumPath<String>) -> Json<Value> {
    let removed = state.capture.clients.unregister(&id);
    state.dispatcher.state().telemetry.forget(&id);
    state.capture.checkpoints.forget_client(&id);
    if removed {
        debug!(client_id = %id, "Client unregistered");
    }
    Json(json!({ "unregistered": removed }))
}

// ---------------------------------------------------------------------------
// Extension ingest
// ---------------------------------------------------------------------------

fn rate_limited(state: &GatewayState) -> Response {
    let body = state.capture.store.rate_limit_response();
    let mut resp = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    resp.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
    resp
}

async fn ingest(state: &GatewayState, kind: BufferKind, key: &str, body: Body, limit: usize) -> HandlerResult {
    if let Some(rejection) = state.capture.store.check_admission() {
        debug!(kind = kind.as_str(), ?rejection, "Ingest rejected");
        return Err(rate_limited(state));
    }
    let value = read_json(body, limit).await?;
    let records = unwrap_records(value, key).map_err(|message| {
        debug!(kind = kind.as_str(), %message, "Rejected ingest batch");
        invalid_json(&message)
    })?;
    let outcome = state.capture.ingest(kind, records);
    Ok(Json(json!({
        "received": outcome.added,
        "evicted": outcome.evicted,
        "truncated": outcome.truncated,
    }))
    .into_response())
}

async fn handle_logs(State(state): State<GatewayState>, body: Body) -> HandlerResult {
    ingest(&state, BufferKind::Logs, "entries", body, INGEST_BODY_LIMIT).await
}

async fn handle_network_bodies(State(state): State<GatewayState>, body: Body) -> HandlerResult {
    ingest(&state, BufferKind::NetworkBodies, "bodies", body, NETWORK_BODY_LIMIT).await
}

async fn handle_ws_events(State(state): State<GatewayState>, body: Body) -> HandlerResult {
    ingest(&state, BufferKind::WebsocketEvents, "events", body, INGEST_BODY_LIMIT).await
}

async fn handle_actions(State(state): State<GatewayState>, body: Body) -> HandlerResult {
    ingest(&state, BufferKind::Actions, "actions", body, INGEST_BODY_LIMIT).await
}

#[derive(Debug, Default, Deserialize)]
struct ResultBody {
    #[serde(default)]
    correlation_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

async fn handle_query_result(
    State(state): State<GatewayState>,
    AxumPath(id): AxumPath<String>,
    body: Body,
) -> HandlerResult {
    let value = read_json(body, INGEST_BODY_LIMIT).await?;
    let parsed: ResultBody = serde_json::from_value(value.clone()).unwrap_or_default();
    let answer = parsed
        .result
        .clone()
        .or_else(|| parsed.error.as_ref().map(|e| json!({ "error": e })))
        .unwrap_or(value);

    let Some(query) = state.capture.queries.set_result(&id, answer.clone()) else {
        return Err(error_json(StatusCode::NOT_FOUND, "query not found or already answered"));
    };
    if let Some(correlation_id) = query.correlation_id.as_deref() {
        let result = if parsed.error.is_none() { Some(answer) } else { parsed.result };
        let status = parsed.status.as_deref().unwrap_or("complete");
        state
            .capture
            .commands
            .record_result(correlation_id, status, result, parsed.error);
    }
    Ok(Json(json!({ "ok": true })).into_response())
}

async fn handle_command_result(State(state): State<GatewayState>, body: Body) -> HandlerResult {
    let value = read_json(body, INGEST_BODY_LIMIT).await?;
    let parsed: ResultBody = serde_json::from_value(value).map_err(|_| bad_request("Invalid JSON"))?;
    let correlation_id = parsed
        .correlation_id
        .ok_or_else(|| bad_request("correlation_id is required"))?;
    let status = parsed.status.unwrap_or_default();
    let body = match state
        .capture
        .commands
        .record_result(&correlation_id, &status, parsed.result, parsed.error)
    {
        RecordOutcome::Transitioned(status) => json!({ "ok": true, "status": status }),
        RecordOutcome::Duplicate => json!({ "ok": true, "duplicate": true }),
        RecordOutcome::Ignored => json!({ "ok": true, "ignored": true }),
        RecordOutcome::Unknown => {
            return Err(error_json(StatusCode::NOT_FOUND, "unknown correlation_id"));
        }
    };
    Ok(Json(body).into_response())
}

fn apply_command_result(capture: &Capture, outcome: SyncCommandResult) {
    let answer = outcome
        .result
        .clone()
        .or_else(|| outcome.error.as_ref().map(|e| json!({ "error": e })))
        .unwrap_or(Value::Null);
    let mut correlation_id = outcome.correlation_id.clone();
    if let Some(id) = outcome.id.as_deref() {
        if let Some(query) = capture.queries.set_result(id, answer) {
            correlation_id = correlation_id.or(query.correlation_id);
        }
    }
    if let Some(correlation_id) = correlation_id {
        let recorded = capture
            .commands
            .record_result(&correlation_id, &outcome.status, outcome.result, outcome.error);
        debug!(correlation_id = %correlation_id, ?recorded, "Command result from sync");
    }
}

/// Unified extension poll: heartbeat, settings, command results in; pending commands out.
async fn handle_sync(State(state): State<GatewayState>, body: Body) -> HandlerResult {
    let value = read_json(body, NETWORK_BODY_LIMIT).await?;
    let req: SyncRequest =
        serde_json::from_value(value).map_err(|e| bad_request(&format!("Invalid sync request: {}", e)))?;
    let capture = &state.capture;

    let event = capture
        .extension
        .record_poll(req.session_id.clone(), req.extension_version.clone(), req.settings);
    if event != PollEvent::Continued {
        if let Some(journal) = &state.journal {
            journal.lifecycle(
                "extension_connected",
                json!({
                    "session_id": req.session_id,
                    "version": req.extension_version,
                    "reconnect": event == PollEvent::Reconnected,
                }),
            );
        }
    }
    for outcome in req.command_results {
        apply_command_result(capture, outcome);
    }

    // Subscribe before reading so a command queued in between still wakes us.
    let mut created = capture.queries.subscribe_created();
    let mut commands = capture.queries.pending();
    if commands.is_empty() {
        let mut shutdown = state.shutdown_tx.subscribe();
        tokio::select! {
            _ = created.changed() => {}
            _ = shutdown.recv() => {}
            _ = tokio::time::sleep(SYNC_LONG_POLL) => {}
        }
        commands = capture.queries.pending();
    }

    let next_poll_ms = if commands.is_empty() { 1000 } else { 200 };
    Ok(Json(json!({
        "ack": true,
        "commands": commands,
        "next_poll_ms": next_poll_ms,
        "server_time": Utc::now().to_rfc3339(),
        "server_version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response())
}

async fn handle_pending_queries(State(state): State<GatewayState>) -> Json<Value> {
    state.capture.extension.record_poll(None, None, None);
    Json(json!({ "commands": state.capture.queries.pending() }))
}

async fn handle_draw_complete(State(state): State<GatewayState>, body: Body) -> HandlerResult {
    let value = read_json(body, NETWORK_BODY_LIMIT).await?;
    let stored = state.capture.extension.add_draw_session(value);
    Ok(Json(json!({ "ok": true, "stored": stored })).into_response())
}

// ---------------------------------------------------------------------------
// CI webhook
// ---------------------------------------------------------------------------

async fn handle_ci_result(State(state): State<GatewayState>, body: Body) -> HandlerResult {
    let value = read_json(body, INGEST_BODY_LIMIT).await?;
    let ci: CiResult =
        serde_json::from_value(value).map_err(|e| bad_request(&format!("Invalid CI result: {}", e)))?;
    info!(status = %ci.status, source = %ci.source, commit = %ci.commit, "CI result received");
    let alert = state.capture.alerts.process_ci_result(ci);
    Ok(Json(json!({ "ok": true, "alert_created": alert.is_some() })).into_response())
}

async fn handle_ci_list(State(state): State<GatewayState>) -> Json<Value> {
    Json(json!({ "results": state.capture.alerts.ci_results() }))
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(state: GatewayState) -> Router {
    let extension = Router::new()
        .route("/logs", post(handle_logs))
        .route("/network-bodies", post(handle_network_bodies))
        .route("/ws-events", post(handle_ws_events))
        .route("/actions", post(handle_actions))
        .route("/query-result/:id", post(handle_query_result))
        .route("/command-result", post(handle_command_result))
        .route("/sync", post(handle_sync))
        .route("/pending-queries", get(handle_pending_queries))
        .route("/draw-mode/complete", post(handle_draw_complete))
        .route_layer(middleware::from_fn(extension_only));

    Router::new()
        .route("/mcp", post(handle_mcp))
        .route("/health", get(handle_health))
        .route("/shutdown", post(handle_shutdown))
        .route("/clients", get(handle_clients_list).post(handle_clients_register))
        .route("/clients/:id", get(handle_client_get).delete(handle_client_delete))
        .route("/ci-result", get(handle_ci_list).post(handle_ci_result))
        .merge(extension)
        .layer(middleware::from_fn_with_state(state.clone(), guard_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
