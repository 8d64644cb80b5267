//! Console-facing HTTP API. Every adapter operation answers with the same
//! `{ ok, status, targetUrl, data?, hint? }` shape; gateway-side failures
//! come back as 200 with `ok: false`, only internal failures use 500.
//! `/api/waha/*` is the exception: a raw passthrough to the gateway.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Path, Query, RawQuery, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{info, warn};

use crate::error::Cancelled;
use crate::gateway::{Envelope, FailureKind, Payload};
use crate::service::{ActionRequest, Adapter, ApiResponse, SessionAction};
use crate::sync::SyncProgress;

// ── Shared state ───────────────────────────────────────────────────────────────

pub struct AppState {
    pub adapter: Adapter,
}

// ── Query types ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatsQuery {
    session_name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagesQuery {
    session_name: Option<String>,
    chat_id: Option<String>,
    limit: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContactQuery {
    session_name: Option<String>,
    contact_id: Option<String>,
    chat_name: Option<String>,
}

// ── Helpers ────────────────────────────────────────────────────────────────────

/// Token cancelled when the handler future is dropped (client went away).
fn request_token() -> (CancellationToken, DropGuard) {
    let token = CancellationToken::new();
    let guard = token.clone().drop_guard();
    (token, guard)
}

fn required(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn bad_request(hint: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "ok": false, "hint": hint.into() })),
    )
        .into_response()
}

fn respond<T: Serialize>(result: Result<ApiResponse<T>, Cancelled>) -> Response {
    match result {
        Ok(body) => {
            let status = if body.is_internal_error() {
                StatusCode::INTERNAL_SERVER_ERROR
            } else {
                StatusCode::OK
            };
            (status, Json(body)).into_response()
        }
        // Nobody is listening any more; 499 is the conventional "client closed request".
        Err(Cancelled) => StatusCode::from_u16(499)
            .unwrap_or(StatusCode::BAD_REQUEST)
            .into_response(),
    }
}

// ── Handlers ───────────────────────────────────────────────────────────────────

async fn list_chats(State(state): State<Arc<AppState>>, Query(query): Query<ChatsQuery>) -> Response {
    let Some(session) = required(&query.session_name) else {
        return bad_request("sessionName query parameter is required.");
    };

    let (cancel, _guard) = request_token();
    let progress = |p: &SyncProgress| info!("{}", p.message);
    respond(state.adapter.list_chats(session, &cancel, &progress).await)
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MessagesQuery>,
) -> Response {
    let (Some(session), Some(chat_id)) = (required(&query.session_name), required(&query.chat_id)) else {
        return bad_request("sessionName and chatId query parameters are required.");
    };
    let limit = query.limit.as_deref().and_then(|l| l.trim().parse::<u32>().ok());

    let (cancel, _guard) = request_token();
    respond(
        state
            .adapter
            .list_messages(session, chat_id, limit, &cancel)
            .await,
    )
}

async fn contact_meta(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ContactQuery>,
) -> Response {
    let (Some(session), Some(contact_id)) = (required(&query.session_name), required(&query.contact_id))
    else {
        return bad_request("sessionName and contactId are required.");
    };

    let (cancel, _guard) = request_token();
    respond(
        state
            .adapter
            .contact_meta(session, contact_id, query.chat_name.as_deref(), &cancel)
            .await,
    )
}

async fn session_action(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request: ActionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => return bad_request("Invalid JSON body"),
    };
    let action = match SessionAction::parse(&request) {
        Ok(action) => action,
        Err(hint) => {
            warn!("Rejected session action: {}", hint);
            return bad_request(hint);
        }
    };

    let (cancel, _guard) = request_token();
    respond(state.adapter.session_action(&action, &cancel).await)
}

async fn sessions(State(state): State<Arc<AppState>>) -> Response {
    let (cancel, _guard) = request_token();
    respond(state.adapter.sessions(&cancel).await)
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    let (cancel, _guard) = request_token();
    respond(state.adapter.health(&cancel).await)
}

async fn info_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.adapter.info()).into_response()
}

/// Forwards `/api/waha/<path>` to the gateway with the key attached
/// server-side and relays the gateway's own status and body.
async fn proxy(
    State(state): State<Arc<AppState>>,
    method: Method,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let body = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        match serde_json::from_slice(&body) {
            Ok(value) => Some(value),
            Err(_) => return bad_request("Proxied request bodies must be JSON."),
        }
    };
    let target = match query {
        Some(query) if !query.is_empty() => format!("/{}?{}", path, query),
        _ => format!("/{}", path),
    };

    let (cancel, _guard) = request_token();
    match state.adapter.forward(method, &target, body, &cancel).await {
        Ok(envelope) => relay(envelope),
        Err(Cancelled) => StatusCode::from_u16(499)
            .unwrap_or(StatusCode::BAD_REQUEST)
            .into_response(),
    }
}

fn relay(envelope: Envelope) -> Response {
    match envelope.failure {
        Some(FailureKind::Configuration) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "message": envelope.diagnostic_hint })),
            )
                .into_response();
        }
        Some(FailureKind::Network | FailureKind::Timeout) => {
            warn!("Proxy to {} failed: {:?}", envelope.target_endpoint, envelope.diagnostic_hint);
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({
                    "message": "An internal error occurred while proxying the request to the gateway.",
                    "proxyError": envelope.diagnostic_hint,
                    "targetUrl": envelope.target_endpoint,
                })),
            )
                .into_response();
        }
        _ => {}
    }

    let status = StatusCode::from_u16(envelope.http_status).unwrap_or(StatusCode::BAD_GATEWAY);
    match envelope.raw_payload {
        Some(Payload::Json(value)) => (status, Json(value)).into_response(),
        Some(Payload::Binary {
            content_type,
            bytes,
        }) => (status, [(header::CONTENT_TYPE, content_type)], bytes).into_response(),
        None => status.into_response(),
    }
}

// ── Router ─────────────────────────────────────────────────────────────────────

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/integrations/waha/chats", get(list_chats))
        .route("/api/integrations/waha/messages", get(list_messages))
        .route("/api/integrations/waha/contact-meta", get(contact_meta))
        .route("/api/integrations/waha/action", post(session_action))
        .route("/api/integrations/waha/sessions", get(sessions))
        .route("/api/integrations/waha/health", get(health))
        .route("/api/integrations/waha/info", get(info_handler))
        .route("/api/waha/{*path}", any(proxy))
        .with_state(state)
}

pub async fn serve(state: Arc<AppState>, bind: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind to {bind}"))?;

    info!("Console API listening on http://{}", bind);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("Server error")?;

    Ok(())
}

// ── Tests ──────────────────────────────────────────────────────────────────────
