//! Typed pool and query events.
//!
//! Both streams are `tokio::sync::broadcast` channels: publishing never blocks
//! and never fails the operation that emitted it. A subscriber that falls
//! behind loses the oldest events (`RecvError::Lagged`).

use serde::Serialize;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    /// A new physical connection was established.
    Connected,
    /// A connection or the pool as a whole reported an error.
    Error { message: String },
    /// A connection failed its keepalive ping and was discarded.
    Removed,
    /// The pool was torn down and built again after a fatal error.
    Recreated,
    HealthChanged { healthy: bool },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueryEvent {
    Succeeded {
        sql: String,
        row_count: u64,
        elapsed_ms: u64,
        prepared: bool,
    },
    Slow {
        sql: String,
        elapsed_ms: u64,
        threshold_ms: u64,
    },
    Failed {
        sql: String,
        code: &'static str,
        message: String,
        elapsed_ms: u64,
    },
}

#[derive(Clone)]
pub struct EventBus {
    pool: broadcast::Sender<PoolEvent>,
    query: broadcast::Sender<QueryEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (pool, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (query, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { pool, query }
    }

    pub fn pool_event(&self, event: PoolEvent) {
        // No subscribers is not an error.
        let _ = self.pool.send(event);
    }

    pub fn query_event(&self, event: QueryEvent) {
        let _ = self.query.send(event);
    }

    pub fn subscribe_pool(&self) -> broadcast::Receiver<PoolEvent> {
        self.pool.subscribe()
    }

    pub fn subscribe_query(&self) -> broadcast::Receiver<QueryEvent> {
        self.query.subscribe()
    }
}
