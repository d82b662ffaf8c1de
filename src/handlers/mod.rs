// ---------------------------------------------------------------------------
// handlers/: HTTP surface: health + the streamable MCP endpoint
// ---------------------------------------------------------------------------

pub(crate) mod health;
pub(crate) mod mcp;

pub use health::health;
pub use mcp::{CLIENT_ID_HEADER, LAST_EVENT_ID_HEADER, SESSION_ID_HEADER, mcp_delete, mcp_get, mcp_post};

use axum::Json;
use axum::http::StatusCode;
use serde_json::json;
use uuid::Uuid;

use crate::error::SessionError;

/// Centralized API error type for non-JSON-RPC responses.
/// Logs full details server-side, returns sanitized JSON to the client.
///
/// Response format:
/// ```json
/// { "error": { "code": "INVALID_SESSION", "message": "...", "request_id": "uuid" } }
/// ```
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not authenticated: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid session: {0}")]
    InvalidSession(String),
}

impl ApiError {
    pub(crate) fn error_code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::Forbidden(_) => "SESSION_FORBIDDEN",
            ApiError::InvalidSession(_) => "INVALID_SESSION",
        }
    }

    pub(crate) fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::InvalidSession(_) => StatusCode::NOT_FOUND,
        }
    }

    /// Message returned to clients. Every variant carries caller-facing text only.
    pub(crate) fn sanitized_message(&self) -> String {
        match self {
            ApiError::BadRequest(m)
            | ApiError::Unauthorized(m)
            | ApiError::Forbidden(m)
            | ApiError::InvalidSession(m) => m.clone(),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Missing => ApiError::BadRequest("Missing Mcp-Session-Id header".to_string()),
            SessionError::Invalid(id) => ApiError::InvalidSession(format!("Invalid session: {}", id)),
            SessionError::Closed(id) => ApiError::InvalidSession(format!("Invalid session: {} has been terminated", id)),
            SessionError::ClientMismatch => {
                ApiError::Forbidden("Session belongs to a different client".to_string())
            }
        }
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let request_id = Uuid::new_v4().to_string();

        tracing::warn!(
            request_id = %request_id,
            code = self.error_code(),
            "API error ({}): {}",
            status.as_u16(),
            self
        );

        let body = json!({
            "error": {
                "code": self.error_code(),
                "message": self.sanitized_message(),
                "request_id": request_id,
            }
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn invalid_session_maps_to_404_with_code() {
        let response = ApiError::from(SessionError::Invalid("abc".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["code"], "INVALID_SESSION");
        assert!(body["error"]["message"].as_str().unwrap().contains("Invalid session"));
        assert!(body["error"]["request_id"].is_string());
    }

    #[test]
    fn missing_header_is_bad_request() {
        let err = ApiError::from(SessionError::Missing);
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(err.sanitized_message().contains("Mcp-Session-Id"));
    }

    #[test]
    fn client_mismatch_is_forbidden() {
        let err = ApiError::from(SessionError::ClientMismatch);
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(err.error_code(), "SESSION_FORBIDDEN");
    }
}
