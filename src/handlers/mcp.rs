// ---------------------------------------------------------------------------
// handlers/mcp.rs: streamable HTTP transport (POST / GET (SSE) / DELETE /mcp)
// ---------------------------------------------------------------------------

use std::convert::Infallible;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use tokio_stream::wrappers::ReceiverStream;

use super::ApiError;
use crate::error::SessionError;
use crate::mcp::server::{INVALID_REQUEST, PARSE_ERROR, SERVER_ERROR, json_rpc_error};
use crate::mcp::{Routed, SessionHandle};
use crate::state::AppState;

pub const SESSION_ID_HEADER: &str = "mcp-session-id";
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";
pub const CLIENT_ID_HEADER: &str = "x-client-id";

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn is_initialize(message: &Value) -> bool {
    message.get("method").and_then(Value::as_str) == Some("initialize")
}

/// JSON-RPC error body with an HTTP status, for failures before dispatch.
fn rpc_failure(status: StatusCode, code: i32, message: &str) -> Response {
    (status, Json(json_rpc_error(Value::Null, code, message))).into_response()
}

fn session_failure(e: SessionError) -> Response {
    let api = ApiError::from(e);
    tracing::warn!(code = api.error_code(), "mcp: {}", api);
    rpc_failure(api.status_code(), SERVER_ERROR, &api.sanitized_message())
}

/// Run a single message or a batch through the session's handler.
async fn dispatch(handle: &SessionHandle, message: &Value) -> Option<Value> {
    match message {
        Value::Array(items) => {
            if items.is_empty() {
                return Some(json_rpc_error(Value::Null, INVALID_REQUEST, "Invalid Request: empty batch"));
            }
            let mut responses = Vec::with_capacity(items.len());
            for item in items {
                if let Some(resp) = handle.handler.handle(item).await {
                    responses.push(resp);
                }
            }
            (!responses.is_empty()).then_some(Value::Array(responses))
        }
        single => handle.handler.handle(single).await,
    }
}

fn respond(body: Option<Value>, session_id: Option<&str>) -> Response {
    let mut response = match body {
        Some(v) => (StatusCode::OK, Json(v)).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    };
    if let Some(id) = session_id {
        if let Ok(value) = HeaderValue::from_str(id) {
            response.headers_mut().insert(SESSION_ID_HEADER, value);
        }
    }
    response
}

/// POST /mcp: submit one JSON-RPC message or a batch.
pub async fn mcp_post(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let message: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return rpc_failure(StatusCode::BAD_REQUEST, PARSE_ERROR, &format!("Parse error: {}", e));
        }
    };

    let session_id = header_str(&headers, SESSION_ID_HEADER);
    let client_id = header_str(&headers, CLIENT_ID_HEADER);

    let initializing = match &message {
        Value::Array(items) if items.iter().any(is_initialize) => {
            return rpc_failure(
                StatusCode::BAD_REQUEST,
                INVALID_REQUEST,
                "Invalid Request: initialize must not be batched",
            );
        }
        single => is_initialize(single),
    };

    let routed = match state.sessions.route(session_id, client_id, initializing) {
        Ok(r) => r,
        Err(e) => return session_failure(e),
    };

    match routed {
        Routed::Existing(handle) => {
            let reply = dispatch(&handle, &message).await;
            respond(reply, Some(handle.session_id()))
        }
        Routed::Pending(handle) => {
            let reply = dispatch(&handle, &message).await;
            let stored = state.sessions.complete_initialization(&handle, client_id);
            respond(reply, stored.then(|| handle.session_id()))
        }
        Routed::Sessionless(handle) => {
            tracing::debug!("mcp: sessionless request");
            respond(dispatch(&handle, &message).await, None)
        }
    }
}

/// GET /mcp: open (or resume with `Last-Event-ID`) the session's SSE stream.
pub async fn mcp_get(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Sse<ReceiverStream<Result<Event, Infallible>>>, ApiError> {
    let session_id = header_str(&headers, SESSION_ID_HEADER).ok_or(SessionError::Missing)?;
    let client_id = header_str(&headers, CLIENT_ID_HEADER);
    let cursor = match header_str(&headers, LAST_EVENT_ID_HEADER) {
        Some(raw) => Some(
            raw.parse::<u64>()
                .map_err(|_| ApiError::BadRequest("Last-Event-ID must be a non-negative integer".to_string()))?,
        ),
        None => None,
    };

    let (handle, guard) = state.sessions.open_stream(session_id, client_id)?;
    let heartbeat = state.sessions.settings().heartbeat_interval;
    tracing::info!(session_id = %session_id, resume_after = ?cursor, "mcp: stream opened");

    let rx = handle.transport.open_stream(cursor, heartbeat, guard);
    Ok(Sse::new(ReceiverStream::new(rx)))
}

/// DELETE /mcp: terminate the session. Streams end; removal is left to the sweep.
pub async fn mcp_delete(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>, ApiError> {
    let session_id = header_str(&headers, SESSION_ID_HEADER).ok_or(SessionError::Missing)?;
    let client_id = header_str(&headers, CLIENT_ID_HEADER);
    state.sessions.terminate(session_id, client_id)?;
    Ok(Json(json!({ "terminated": true, "session_id": session_id })))
}
