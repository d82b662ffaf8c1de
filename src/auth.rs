// Optional Bearer token authentication middleware.
// If AUTH_SECRET is set, /mcp requires `Authorization: Bearer <secret>`.
// If not set, auth is disabled (dev mode). /health never uses this layer.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

use crate::handlers::ApiError;
use crate::state::AppState;

/// Middleware that enforces Bearer token auth when AUTH_SECRET is configured.
pub async fn require_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(secret) = state.auth_secret.as_deref() else {
        return Ok(next.run(request).await);
    };

    let token = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    match token {
        Some(token) if token_matches(token, secret) => Ok(next.run(request).await),
        Some(_) => Err(ApiError::Unauthorized("Invalid token".to_string())),
        None => Err(ApiError::Unauthorized(
            "Missing or malformed Authorization header".to_string(),
        )),
    }
}

fn token_matches(token: &str, secret: &str) -> bool {
    token.as_bytes().ct_eq(secret.as_bytes()).into()
}
