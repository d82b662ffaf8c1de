pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod mcp;
pub mod state;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};

use state::AppState;

/// Build the application router with the given state.
/// Extracted from `main()` so integration tests can construct the app
/// without binding to a network port.
pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/mcp",
            post(handlers::mcp_post)
                .get(handlers::mcp_get)
                .delete(handlers::mcp_delete),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_auth));

    Router::new()
        // Health (public)
        .route("/health", get(handlers::health))
        // Streamable MCP endpoint
        .merge(protected)
        .with_state(state)
}
