// ---------------------------------------------------------------------------
// handlers/health.rs: public health endpoint
// ---------------------------------------------------------------------------

use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

use crate::state::AppState;

/// GET /health: pool connectivity and counters, cache and session stats.
/// Never creates the pool; reports `pool_created: false` until first use.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let pool = state.gateway.pool.check_health().await;
    let status = if pool.connected {
        "ok"
    } else if pool.pool_created {
        "degraded"
    } else {
        "idle"
    };

    Json(json!({
        "status": status,
        "app": "pg-mcp-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "mode": if state.gateway.validator.allows_write() { "read-write" } else { "read-only" },
        "pool": pool,
        "cache": state.gateway.pool.cache().stats(),
        "sessions": state.sessions.stats(),
    }))
}
