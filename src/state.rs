//! Application state shared by every handler.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;
use crate::db::{ConnectionPoolManager, EventBus, PreparedStatementCache, QueryValidator};
use crate::mcp::session::SessionRegistry;

/// The database-facing half of the service: one pool manager (owning the
/// statement cache) and the validator configured for the gateway's mode.
#[derive(Clone)]
pub struct Gateway {
    pub pool: Arc<ConnectionPoolManager>,
    pub validator: QueryValidator,
}

impl Gateway {
    /// Build from config without connecting; the pool is created on first use.
    pub fn new(config: &GatewayConfig) -> Self {
        let cache = Arc::new(PreparedStatementCache::new(&config.cache));
        let pool = ConnectionPoolManager::new(
            config.db.clone(),
            config.pool.clone(),
            cache,
            EventBus::new(),
        );
        Self {
            pool,
            validator: QueryValidator::new(config.allow_write),
        }
    }

    pub fn max_rows(&self) -> usize {
        self.pool.settings().max_rows
    }
}

/// Central application state. Clone-friendly, everything shared is behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
    pub sessions: Arc<SessionRegistry>,
    pub start_time: Instant,
    /// Optional auth secret from AUTH_SECRET. None = dev mode (no auth).
    pub auth_secret: Option<String>,
    /// Cancels the session sweep; child tokens go to other periodic tasks.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Must be called inside a Tokio runtime: periodic sweeps start here.
    pub fn new(config: &GatewayConfig) -> Self {
        let gateway = Gateway::new(config);
        let sessions = SessionRegistry::new(config.sessions.clone(), gateway.clone());
        let shutdown = CancellationToken::new();
        sessions.spawn_sweeper(shutdown.child_token());

        if config.auth_secret.is_some() {
            tracing::info!("AUTH_SECRET configured, /mcp requires a bearer token");
        } else {
            tracing::info!("AUTH_SECRET not set, authentication disabled (dev mode)");
        }
        tracing::info!(
            allow_write = config.allow_write,
            pool_max = config.pool.max_connections,
            prepared = config.pool.use_prepared_statements,
            "AppState initialised"
        );

        Self {
            gateway,
            sessions,
            start_time: Instant::now(),
            auth_secret: config.auth_secret.clone(),
            shutdown,
        }
    }

    /// Stop periodic work, end every stream and close the pool.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.sessions.close_all();
        self.gateway.pool.shutdown().await;
    }
}
