use axum::http::{HeaderName, Method, header};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use pg_mcp_gateway::config::GatewayConfig;
use pg_mcp_gateway::handlers::{CLIENT_ID_HEADER, LAST_EVENT_ID_HEADER, SESSION_ID_HEADER};
use pg_mcp_gateway::state::AppState;

const BODY_LIMIT_BYTES: usize = 4 * 1024 * 1024;

fn build_app(state: AppState) -> axum::Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static(SESSION_ID_HEADER),
            HeaderName::from_static(LAST_EVENT_ID_HEADER),
            HeaderName::from_static(CLIENT_ID_HEADER),
        ])
        .expose_headers([HeaderName::from_static(SESSION_ID_HEADER)])
        .max_age(std::time::Duration::from_secs(86_400));

    pg_mcp_gateway::create_router(state)
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT_BYTES))
        .layer(cors)
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                )
            }),
        )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    if std::env::var("RUST_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let config = GatewayConfig::from_env()?;
    let state = AppState::new(&config);

    // Warm the pool in the background; failures schedule their own retries.
    let warm = state.gateway.pool.clone();
    tokio::spawn(async move {
        if let Err(e) = warm.get_pool().await {
            tracing::warn!("startup: database not reachable yet: {}", e);
        }
    });

    let app = build_app(state.clone());
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("pg-mcp-gateway listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let draining = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Open SSE streams would otherwise hold the server open.
            draining.sessions.close_all();
        })
        .await?;

    state.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!("failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
