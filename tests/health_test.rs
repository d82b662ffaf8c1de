// pg-mcp-gateway - Health endpoint integration test
//
// The pool is created lazily and /health never creates it, so these tests
// run without a database.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use pg_mcp_gateway::config::{DbConnectConfig, GatewayConfig};
use pg_mcp_gateway::state::AppState;

fn offline_config() -> GatewayConfig {
    GatewayConfig {
        db: DbConnectConfig {
            host: "127.0.0.1".into(),
            port: 1,
            ..DbConnectConfig::default()
        },
        ..GatewayConfig::default()
    }
}

fn test_app(config: &GatewayConfig) -> axum::Router {
    pg_mcp_gateway::create_router(AppState::new(config))
}

/// Collect a response body into a `serde_json::Value`.
async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn health_endpoint_returns_ok() {
    let response = test_app(&offline_config()).oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn health_reports_idle_pool_without_connecting() {
    let response = test_app(&offline_config()).oneshot(get("/health")).await.unwrap();
    let json = body_json(response).await;

    assert_eq!(json["status"], "idle");
    assert_eq!(json["app"], "pg-mcp-gateway");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(json["mode"], "read-only");
    assert!(json["uptime_seconds"].is_u64());

    assert_eq!(json["pool"]["connected"], false);
    assert_eq!(json["pool"]["pool_created"], false);
    assert_eq!(json["pool"]["stats"]["total"], 0);
    assert_eq!(json["pool"]["stats"]["max"], 10);
}

#[tokio::test]
async fn health_includes_cache_and_session_stats() {
    let response = test_app(&offline_config()).oneshot(get("/health")).await.unwrap();
    let json = body_json(response).await;

    assert_eq!(json["cache"]["size"], 0);
    assert_eq!(json["cache"]["max_size"], 100);
    assert_eq!(json["sessions"]["session_count"], 0);
    assert_eq!(json["sessions"]["active_streams"], 0);
}

#[tokio::test]
async fn health_is_public_when_auth_is_enabled() {
    let config = GatewayConfig {
        auth_secret: Some("s3cret".into()),
        ..offline_config()
    };
    let response = test_app(&config).oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn write_mode_is_reported() {
    let config = GatewayConfig {
        allow_write: true,
        ..offline_config()
    };
    let response = test_app(&config).oneshot(get("/health")).await.unwrap();
    let json = body_json(response).await;
    assert_eq!(json["mode"], "read-write");
}

#[tokio::test]
async fn nonexistent_route_returns_404() {
    let response = test_app(&offline_config()).oneshot(get("/api/does-not-exist")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
