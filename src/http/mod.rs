// ABOUTME: HTTP-terminated MCP transport — JSON-RPC over POST, SSE stream, session lifecycle
// ABOUTME: Wire framing of MCP itself is out of scope; this layer owns sessions, auth, limits

pub mod auth;
pub mod session;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::{self, Stream};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditEventType, AuditLogger};
use crate::config::{AuthConfig, AuthMode, HttpConfig};
use crate::ephemeral::{run_js_ephemeral, EphemeralRunRequest};
use crate::error::{AppError, ErrorKind};
use crate::guard::ExecutionGuard;
use crate::jsonrpc::{error_codes, JsonRpcRequest, JsonRpcResponse};
use crate::model::{ToolCreateRequest, ToolPatch};
use crate::sandbox::resolver::EngineResolver;
use crate::service::DynamicToolService;

use self::auth::JwtVerifier;
use self::session::{Session, SessionTable};

const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

struct Inner {
    service: DynamicToolService,
    guard: Arc<ExecutionGuard>,
    resolver: Arc<EngineResolver>,
    audit: Arc<AuditLogger>,
    sessions: SessionTable,
    verifier: Option<JwtVerifier>,
    config: HttpConfig,
    started_at: Instant,
    metrics_handle: PrometheusHandle,
}

/// Shared application state handed to every axum handler.
#[derive(Clone)]
pub struct AppState(Arc<Inner>);

impl AppState {
    #[must_use]
    pub fn new(
        service: DynamicToolService,
        guard: Arc<ExecutionGuard>,
        resolver: Arc<EngineResolver>,
        audit: Arc<AuditLogger>,
        sessions: SessionTable,
        auth_config: AuthConfig,
        http_config: HttpConfig,
    ) -> Self {
        let verifier = matches!(auth_config.mode, AuthMode::Jwt).then(|| JwtVerifier::new(auth_config));
        let metrics_handle = install_metrics_recorder();
        Self(Arc::new(Inner {
            service,
            guard,
            resolver,
            audit,
            sessions,
            verifier,
            config: http_config,
            started_at: Instant::now(),
            metrics_handle,
        }))
    }
}

/// Installs the process-global Prometheus recorder. A second call (as in a
/// test building more than one `AppState`) can't install twice; the handle
/// from the first install is reused instead so `/metrics` still renders.
fn install_metrics_recorder() -> PrometheusHandle {
    static HANDLE: once_cell::sync::OnceCell<PrometheusHandle> = once_cell::sync::OnceCell::new();
    HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("exactly one Prometheus recorder is installed per process")
        })
        .clone()
}

/// Builds the full router: the MCP endpoint, health/readiness probes and
/// the metrics exposition surface (spec section 4.5).
#[must_use]
pub fn build_router(state: AppState) -> Router {
    let mcp_path = state.0.config.path.clone();
    let max_request_bytes = state.0.config.max_request_bytes;

    // Body-size ceiling must reject before auth ever runs (spec section 4.5
    // request pipeline: oversize body => 413 before any business logic,
    // auth included), so it wraps `route_layer(auth_gate)` from the outside.
    let mcp_routes = Router::new()
        .route(
            &mcp_path,
            axum::routing::post(handle_post)
                .get(handle_sse)
                .delete(handle_delete),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_gate))
        .layer(RequestBodyLimitLayer::new(max_request_bytes));

    Router::new()
        .merge(mcp_routes)
        .route("/livez", get(livez))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .layer(middleware::from_fn(security_headers))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

async fn security_headers(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert("referrer-policy", HeaderValue::from_static("no-referrer"));
    response
}

/// Rejects unauthenticated requests on the MCP endpoint when `auth.mode` is
/// `jwt` (spec section 6, "auth gate"). Health, readiness and metrics
/// endpoints are mounted outside this layer and are never gated. All
/// outcomes are audit-logged (spec section 6).
async fn auth_gate(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(verifier) = &state.0.verifier else {
        return next.run(req).await;
    };

    let header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let token = match header.and_then(|h| h.strip_prefix("Bearer ")) {
        Some(t) if !t.is_empty() => t,
        _ => {
            metrics::counter!("dynmcp_auth_denied_total").increment(1);
            state
                .0
                .audit
                .log(AuditEvent {
                    event_type: AuditEventType::AuthDenied,
                    actor: None,
                    session_id: None,
                    action: "auth_gate".to_owned(),
                    resource: "mcp_endpoint".to_owned(),
                    metadata: serde_json::json!({"reason": "missing bearer token"}),
                })
                .await;
            return rpc_error_response(
                StatusCode::UNAUTHORIZED,
                None,
                AppError::new(ErrorKind::AuthMissing, "missing bearer token"),
            );
        }
    };

    match verifier.verify(token) {
        Ok(_claims) => {
            metrics::counter!("dynmcp_auth_success_total").increment(1);
            state
                .0
                .audit
                .log(AuditEvent {
                    event_type: AuditEventType::SystemAccess,
                    actor: None,
                    session_id: None,
                    action: "auth_gate".to_owned(),
                    resource: "mcp_endpoint".to_owned(),
                    metadata: serde_json::json!({"outcome": "success"}),
                })
                .await;
            next.run(req).await
        }
        Err(err) => {
            metrics::counter!("dynmcp_auth_denied_total").increment(1);
            state
                .0
                .audit
                .log(AuditEvent {
                    event_type: AuditEventType::AuthDenied,
                    actor: None,
                    session_id: None,
                    action: "auth_gate".to_owned(),
                    resource: "mcp_endpoint".to_owned(),
                    metadata: serde_json::json!({"reason": err.message.clone()}),
                })
                .await;
            rpc_error_response(StatusCode::FORBIDDEN, None, err)
        }
    }
}

fn rpc_error_response(status: StatusCode, id: Option<Value>, err: AppError) -> Response {
    let body = JsonRpcResponse::from_error(id, err.to_jsonrpc_error());
    (status, Json(body)).into_response()
}

async fn livez() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.0.guard.snapshot();
    Json(json!({"ready": true, "activeExecutions": snapshot.active_executions}))
}

/// Plain-text Prometheus exposition (spec section 9, "observability
/// surface"): uptime, active session count and the guard's per-scope
/// counters, recorded through the `metrics` facade and rendered by the
/// installed `metrics-exporter-prometheus` recorder.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.0.started_at.elapsed().as_secs_f64();
    metrics::gauge!("dynmcp_uptime_seconds").set(uptime);
    metrics::gauge!("dynmcp_sessions_active").set(state.0.sessions.active_count() as f64);

    let snapshot = state.0.guard.snapshot();
    metrics::gauge!("dynmcp_guard_active_executions").set(snapshot.active_executions as f64);
    for scope in &snapshot.scopes {
        metrics::counter!("dynmcp_guard_scope_allowed_total", "scope" => scope.scope.clone())
            .absolute(scope.counters.allowed);
        metrics::counter!("dynmcp_guard_scope_rejected_rate_total", "scope" => scope.scope.clone())
            .absolute(scope.counters.rejected_rate);
        metrics::counter!("dynmcp_guard_scope_rejected_concurrency_total", "scope" => scope.scope.clone())
            .absolute(scope.counters.rejected_concurrency);
        metrics::counter!("dynmcp_guard_scope_failed_total", "scope" => scope.scope.clone())
            .absolute(scope.counters.failed);
    }

    (
        [("content-type", "text/plain; version=0.0.4")],
        state.0.metrics_handle.render(),
    )
}

fn session_id_from_headers(state: &AppState, headers: &HeaderMap) -> Option<String> {
    headers
        .get(&state.0.config.session_id_header)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

/// Handles a single JSON-RPC request delivered as `POST <path>`. Creates a
/// new session when no session header is present, otherwise resolves and
/// touches the existing one.
async fn handle_post(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let existing_id = session_id_from_headers(&state, &headers);

    let session = match existing_id {
        Some(id) => match state.0.sessions.get(&id) {
            Some(session) => session,
            None => {
                return rpc_error_response(
                    StatusCode::NOT_FOUND,
                    None,
                    AppError::new(ErrorKind::NotFound, format!("session '{id}' not found")),
                );
            }
        },
        None => {
            let session = state.0.sessions.create();
            if let Err(e) = state.0.service.seed_session(&session.server).await {
                warn!(error = %e.message, "failed to seed new session with current tool set");
            }
            metrics::counter!("dynmcp_sessions_created_total").increment(1);
            session
        }
    };

    let request: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(_) => {
            let resp = JsonRpcResponse::error(None, error_codes::PARSE_ERROR, "invalid JSON-RPC request body");
            return (StatusCode::BAD_REQUEST, Json(resp)).into_response();
        }
    };

    let id = request.id.clone();
    let result = dispatch(&state, &session, &request).await;

    let body = match result {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(err) => JsonRpcResponse::from_error(id, err.to_jsonrpc_error()),
    };

    let mut response = Json(body).into_response();
    if let Ok(header_name) = state.0.config.session_id_header.parse::<axum::http::header::HeaderName>() {
        if let Ok(header_value) = HeaderValue::from_str(&session.id) {
            response.headers_mut().insert(header_name, header_value);
        }
    }
    response
}

/// Server-initiated SSE stream for the session: currently carries
/// `notifications/tools/list_changed` pings. Transport-level event
/// replay/resumption is not implemented.
async fn handle_sse(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, Response> {
    let id = session_id_from_headers(&state, &headers).ok_or_else(|| {
        rpc_error_response(
            StatusCode::BAD_REQUEST,
            None,
            AppError::validation("GET requires an existing session id header"),
        )
    })?;
    let Some(session) = state.0.sessions.get(&id) else {
        return Err(rpc_error_response(
            StatusCode::NOT_FOUND,
            None,
            AppError::new(ErrorKind::NotFound, format!("session '{id}' not found")),
        ));
    };

    let rx = session.server.subscribe_list_changed();
    let keepalive_stream = broadcast_to_sse(rx);
    Ok(Sse::new(keepalive_stream).keep_alive(axum::response::sse::KeepAlive::default()))
}

fn broadcast_to_sse(
    mut rx: broadcast::Receiver<()>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(rx, move |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(()) => {
                    return Some((
                        Ok(Event::default().event("notifications/tools/list_changed").data("{}")),
                        rx,
                    ));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

/// Explicit session close. Idempotent: closing twice, or closing an id
/// that never existed, is not an error (spec section 4.5).
async fn handle_delete(State(state): State<AppState>, headers: HeaderMap) -> StatusCode {
    if let Some(id) = session_id_from_headers(&state, &headers) {
        state.0.sessions.close(&id);
    }
    StatusCode::NO_CONTENT
}

async fn dispatch(state: &AppState, session: &Session, request: &JsonRpcRequest) -> Result<Value, AppError> {
    match request.method.as_str() {
        "initialize" => Ok(json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "serverInfo": {"name": "dynmcp-server", "version": env!("CARGO_PKG_VERSION")},
            "capabilities": {"tools": {"listChanged": true}},
        })),
        "tools/list" => {
            let mut tools = state.0.service.mcp_tool_list().await?;
            tools.extend(mgmt_tool_list_entries());
            Ok(json!({ "tools": tools }))
        }
        "tools/call" => dispatch_tool_call(state, session, request.params.clone().unwrap_or(Value::Null)).await,
        "ping" => Ok(json!({})),
        other => Err(AppError::new(
            ErrorKind::Validation,
            format!("unknown method '{other}'"),
        )),
    }
}

fn mgmt_tool_list_entries() -> Vec<Value> {
    vec![
        json!({"name": "mgmt.list_tools", "description": "List registered dynamic tools"}),
        json!({"name": "mgmt.get_tool", "description": "Fetch one dynamic tool by name"}),
        json!({"name": "mgmt.create_tool", "description": "Register a new dynamic tool"}),
        json!({"name": "mgmt.update_tool", "description": "Update an existing dynamic tool"}),
        json!({"name": "mgmt.delete_tool", "description": "Remove a dynamic tool"}),
        json!({"name": "mgmt.set_enabled", "description": "Enable or disable a dynamic tool"}),
        json!({"name": "mgmt.run_js_ephemeral", "description": "Run inline JavaScript once, without registering it"}),
    ]
}

async fn dispatch_tool_call(state: &AppState, session: &Session, params: Value) -> Result<Value, AppError> {
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::validation("tools/call requires a 'name' field"))?
        .to_owned();
    let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
    let admin_token = params
        .get("adminToken")
        .and_then(Value::as_str)
        .map(str::to_owned);

    if let Some(mgmt) = name.strip_prefix("mgmt.") {
        return dispatch_mgmt(state, mgmt, arguments, admin_token.as_deref()).await;
    }

    session.server.call_tool(&name, arguments).await
}

async fn dispatch_mgmt(
    state: &AppState,
    op: &str,
    arguments: Value,
    admin_token: Option<&str>,
) -> Result<Value, AppError> {
    match op {
        "list_tools" => {
            let include_code = arguments.get("includeCode").and_then(Value::as_bool).unwrap_or(false);
            Ok(serde_json::to_value(state.0.service.list(include_code, admin_token).await?)?)
        }
        "get_tool" => {
            let name = require_str(&arguments, "name")?;
            Ok(serde_json::to_value(state.0.service.get(&name, admin_token).await?)?)
        }
        "create_tool" => {
            let req: ToolCreateRequest = serde_json::from_value(arguments)
                .map_err(|e| AppError::validation(e.to_string()))?;
            Ok(serde_json::to_value(state.0.service.create(req, admin_token).await?)?)
        }
        "update_tool" => {
            let name = require_str(&arguments, "name")?;
            let expected_revision = arguments.get("expectedRevision").and_then(Value::as_i64);
            let patch: ToolPatch = match arguments.get("patch") {
                Some(value) => serde_json::from_value(value.clone()).map_err(|e| AppError::validation(e.to_string()))?,
                None => ToolPatch::default(),
            };
            Ok(serde_json::to_value(
                state.0.service.update(&name, patch, expected_revision, admin_token).await?,
            )?)
        }
        "delete_tool" => {
            let name = require_str(&arguments, "name")?;
            let expected_revision = arguments.get("expectedRevision").and_then(Value::as_i64);
            state.0.service.delete(&name, expected_revision, admin_token).await?;
            Ok(json!({"deleted": name}))
        }
        "set_enabled" => {
            let name = require_str(&arguments, "name")?;
            let enabled = arguments
                .get("enabled")
                .and_then(Value::as_bool)
                .ok_or_else(|| AppError::validation("set_enabled requires a boolean 'enabled' field"))?;
            let expected_revision = arguments.get("expectedRevision").and_then(Value::as_i64);
            Ok(serde_json::to_value(
                state.0.service.set_enabled(&name, enabled, expected_revision, admin_token).await?,
            )?)
        }
        "run_js_ephemeral" => {
            state.0.service.check_admin_token(admin_token)?;
            let req: EphemeralRunRequest =
                serde_json::from_value(arguments).map_err(|e| AppError::validation(e.to_string()))?;
            run_js_ephemeral(req, &state.0.guard, &state.0.resolver).await
        }
        other => Err(AppError::validation(format!("unknown management operation '{other}'"))),
    }
}

fn require_str(value: &Value, field: &str) -> Result<String, AppError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| AppError::validation(format!("missing required field '{field}'")))
}

/// Runs the HTTP transport until a shutdown signal arrives, then drains
/// sessions and flushes the audit sink before returning (spec section 9,
/// "graceful shutdown").
pub async fn serve(state: AppState, shutdown: impl std::future::Future<Output = ()> + Send + 'static) -> Result<(), AppError> {
    let addr: SocketAddr = format!("{}:{}", state.0.config.host, state.0.config.port)
        .parse()
        .map_err(|e| AppError::new(ErrorKind::Internal, format!("invalid bind address: {e}")))?;

    state.0.sessions.spawn_sweeper(state.0.config.sweep_interval());

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "dynamic tool MCP server listening");

    let audit = state.0.audit.clone();
    let app = build_router(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| AppError::new(ErrorKind::Internal, format!("server error: {e}")))?;

    if let Err(e) = audit.flush().await {
        warn!(error = %e, "failed to flush audit log during shutdown");
    }
    Ok(())
}

/// Resolves on SIGINT or (unix) SIGTERM, for use as the graceful-shutdown
/// future passed to [`serve`].
pub async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mgmt_tool_list_has_seven_entries() {
        assert_eq!(mgmt_tool_list_entries().len(), 7);
    }

    #[test]
    fn require_str_reports_missing_field() {
        let err = require_str(&json!({}), "name").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }
}
