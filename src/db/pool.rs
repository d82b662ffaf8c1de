// pg-mcp-gateway - Connection pool manager
//
// Owns the single live PgPool for a gateway instance:
// - lazy creation with a liveness check and bounded background retry
// - fail-fast acquisition (raced against the caller's timeout)
// - server-side statement deadline set before / reset after every statement
// - prepared-statement path with transparent fallback to plain execution
// - periodic health check, logging state transitions only
// - full teardown + rebuild when the connection to the backend is lost

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use futures_util::TryStreamExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{Connection, Either, Executor, Postgres, Statement};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::events::{EventBus, PoolEvent, QueryEvent};
use super::prepared::PreparedStatementCache;
use super::value::{CellValue, FieldDescriptor, SqlParam, bind_params, decode_row, describe_columns};
use crate::config::{DbConnectConfig, PoolSettings};
use crate::error::{ConnectionError, GatewayError, QueryError, QueryErrorKind, truncate_sql};

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const APPLICATION_NAME: &str = "pg-mcp-gateway";

// ── Result types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub rows: Vec<Vec<CellValue>>,
    pub fields: Vec<FieldDescriptor>,
    pub row_count: u64,
    pub execution_time_ms: u64,
    pub truncated: bool,
    pub prepared: bool,
    pub statement_name: Option<String>,
}

impl QueryResult {
    /// Keep at most `max_rows` rows, flagging the result as truncated.
    pub fn truncate(&mut self, max_rows: usize) {
        if self.rows.len() > max_rows {
            self.rows.truncate(max_rows);
            self.truncated = true;
        }
    }

    /// Rows as JSON objects keyed by column name.
    pub fn rows_as_objects(&self) -> Vec<Value> {
        self.rows
            .iter()
            .map(|row| {
                let mut obj = Map::with_capacity(row.len());
                for (field, cell) in self.fields.iter().zip(row) {
                    obj.insert(field.name.clone(), cell.to_json());
                }
                Value::Object(obj)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PoolStats {
    pub total: u32,
    pub idle: usize,
    pub waiting: usize,
    pub max: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub pool_created: bool,
    pub stats: PoolStats,
    pub retry_attempts: u32,
    pub retries_exhausted: bool,
    pub checked_at: chrono::DateTime<chrono::Utc>,
}

/// Extra column for `create_managed_table`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub sql_type: String,
    #[serde(default)]
    pub not_null: bool,
}

// ── Internal state ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct RetryState {
    attempts: u32,
    scheduled: bool,
    exhausted: bool,
}

struct RawOutcome {
    rows: Vec<Vec<CellValue>>,
    fields: Vec<FieldDescriptor>,
    rows_affected: u64,
}

/// Decrements the waiting counter even when the acquisition future is dropped.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct ConnectionPoolManager {
    connect: DbConnectConfig,
    settings: PoolSettings,
    cache: Arc<PreparedStatementCache>,
    events: EventBus,
    pool: RwLock<Option<PgPool>>,
    /// Serializes pool creation so concurrent first callers build one pool.
    create_lock: tokio::sync::Mutex<()>,
    retry: Mutex<RetryState>,
    waiting: AtomicUsize,
    healthy: AtomicBool,
    health_started: AtomicBool,
    shut_down: AtomicBool,
    cancel: CancellationToken,
}

impl ConnectionPoolManager {
    /// Build a manager. No connection is opened until the first `get_pool`.
    ///
    /// Must be called inside a Tokio runtime: the cache expiry sweep starts here.
    pub fn new(
        connect: DbConnectConfig,
        settings: PoolSettings,
        cache: Arc<PreparedStatementCache>,
        events: EventBus,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        cache.spawn_sweeper(cancel.child_token());
        Arc::new(Self {
            connect,
            settings,
            cache,
            events,
            pool: RwLock::new(None),
            create_lock: tokio::sync::Mutex::new(()),
            retry: Mutex::new(RetryState::default()),
            waiting: AtomicUsize::new(0),
            healthy: AtomicBool::new(false),
            health_started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            cancel,
        })
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn cache(&self) -> &Arc<PreparedStatementCache> {
        &self.cache
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe_pool_events(&self) -> tokio::sync::broadcast::Receiver<PoolEvent> {
        self.events.subscribe_pool()
    }

    pub fn subscribe_query_events(&self) -> tokio::sync::broadcast::Receiver<QueryEvent> {
        self.events.subscribe_query()
    }

    fn retry_state(&self) -> std::sync::MutexGuard<'_, RetryState> {
        self.retry.lock().unwrap_or_else(|p| p.into_inner())
    }

    // ── Pool lifecycle ──────────────────────────────────────────────────────

    /// Return the live pool, creating it on first use.
    pub async fn get_pool(self: &Arc<Self>) -> Result<PgPool, ConnectionError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ConnectionError::ShutDown);
        }
        if let Some(pool) = self.pool.read().await.as_ref() {
            return Ok(pool.clone());
        }

        let _creating = self.create_lock.lock().await;
        if let Some(pool) = self.pool.read().await.as_ref() {
            return Ok(pool.clone());
        }

        {
            let retry = self.retry_state();
            if retry.exhausted {
                return Err(ConnectionError::RetriesExhausted { attempts: retry.attempts });
            }
        }

        match self.create_pool().await {
            Ok(pool) => {
                self.install(pool.clone()).await;
                Ok(pool)
            }
            Err(e) => {
                tracing::error!("pool: creation failed: {}", e);
                self.events.pool_event(PoolEvent::Error { message: e.to_string() });
                self.schedule_retry();
                Err(e)
            }
        }
    }

    /// Manual retry: clears the exhausted state and attempts creation now.
    pub async fn retry_connection(self: &Arc<Self>) -> Result<PgPool, ConnectionError> {
        {
            let mut retry = self.retry_state();
            retry.attempts = 0;
            retry.exhausted = false;
        }
        tracing::info!("pool: manual connection retry requested");
        self.get_pool().await
    }

    fn connect_options(&self) -> Result<PgConnectOptions, ConnectionError> {
        let base = match &self.connect.url {
            Some(url) => PgConnectOptions::from_str(url)
                .map_err(|e| ConnectionError::PoolCreation(format!("invalid DATABASE_URL: {}", e)))?,
            None => {
                let mut opts = PgConnectOptions::new()
                    .host(&self.connect.host)
                    .port(self.connect.port)
                    .username(&self.connect.user)
                    .database(&self.connect.database);
                if let Some(password) = &self.connect.password {
                    opts = opts.password(password);
                }
                opts
            }
        };
        Ok(base
            .statement_cache_capacity(self.cache.max_entries())
            .application_name(APPLICATION_NAME)
            .options([("search_path", self.connect.schema.as_str())]))
    }

    async fn create_pool(&self) -> Result<PgPool, ConnectionError> {
        let options = self.connect_options()?;
        let connected_events = self.events.clone();
        let removed_events = self.events.clone();
        let keepalive = self.settings.keepalive_interval;

        let pool = PgPoolOptions::new()
            .max_connections(self.settings.max_connections)
            .idle_timeout(Some(self.settings.idle_timeout))
            .acquire_timeout(self.settings.connect_timeout)
            .test_before_acquire(false)
            .after_connect(move |_conn, _meta| {
                let events = connected_events.clone();
                Box::pin(async move {
                    tracing::debug!("pool: new physical connection");
                    events.pool_event(PoolEvent::Connected);
                    Ok(())
                })
            })
            .before_acquire(move |conn, meta| {
                let events = removed_events.clone();
                Box::pin(async move {
                    if meta.idle_for < keepalive {
                        return Ok(true);
                    }
                    match conn.ping().await {
                        Ok(()) => Ok(true),
                        Err(e) => {
                            tracing::warn!("pool: idle connection failed keepalive ping, discarding: {}", e);
                            events.pool_event(PoolEvent::Removed);
                            Ok(false)
                        }
                    }
                })
            })
            .connect_lazy_with(options);

        let check = async {
            sqlx::query_scalar::<_, i32>("SELECT 1").persistent(false).fetch_one(&pool).await?;
            sqlx::query_as::<_, (String, String)>("SELECT version(), current_database()")
                .persistent(false)
                .fetch_one(&pool)
                .await
        };

        match tokio::time::timeout(self.settings.connect_timeout, check).await {
            Ok(Ok((version, database))) => {
                tracing::info!(
                    database = %database,
                    max_connections = self.settings.max_connections,
                    "pool: connected ({})",
                    version.split(',').next().unwrap_or(&version)
                );
                Ok(pool)
            }
            Ok(Err(e)) => {
                pool.close().await;
                Err(ConnectionError::PoolCreation(e.to_string()))
            }
            Err(_) => {
                pool.close().await;
                Err(ConnectionError::PoolCreation(format!(
                    "liveness check timed out after {}ms",
                    self.settings.connect_timeout.as_millis()
                )))
            }
        }
    }

    async fn install(self: &Arc<Self>, pool: PgPool) {
        *self.pool.write().await = Some(pool);
        *self.retry_state() = RetryState::default();
        self.record_health(true);
        if !self.health_started.swap(true, Ordering::AcqRel) {
            self.spawn_health_monitor();
        }
    }

    /// Schedule one background creation attempt after the retry delay.
    fn schedule_retry(self: &Arc<Self>) {
        let attempt = {
            let mut retry = self.retry_state();
            if retry.scheduled || retry.exhausted {
                return;
            }
            if retry.attempts >= self.settings.retry_max_attempts {
                retry.exhausted = true;
                tracing::error!(
                    attempts = retry.attempts,
                    "pool: connection retries exhausted; waiting for manual retry"
                );
                return;
            }
            retry.attempts += 1;
            retry.scheduled = true;
            retry.attempts
        };

        tracing::warn!(
            attempt,
            max = self.settings.retry_max_attempts,
            "pool: retrying connection in {}ms",
            self.settings.retry_delay.as_millis()
        );

        let this = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(this.settings.retry_delay) => {}
            }
            this.retry_state().scheduled = false;

            let _creating = this.create_lock.lock().await;
            if this.pool.read().await.is_some() || this.shut_down.load(Ordering::Acquire) {
                return;
            }
            match this.create_pool().await {
                Ok(pool) => {
                    tracing::info!(attempt, "pool: reconnected on background retry");
                    this.install(pool).await;
                }
                Err(e) => {
                    tracing::warn!(attempt, "pool: background retry failed: {}", e);
                    this.schedule_retry();
                }
            }
        });
    }

    /// Tear down the current pool after a lost connection and build a new one.
    /// In-flight callers keep their checked-out connections; the old pool
    /// closes once they are returned.
    pub async fn handle_pool_error(self: &Arc<Self>, message: &str) {
        self.events.pool_event(PoolEvent::Error { message: message.to_string() });
        let old = self.pool.write().await.take();
        let Some(old) = old else {
            // Someone else is already rebuilding.
            return;
        };
        tracing::error!("pool: fatal pool error, recreating: {}", message);
        self.record_health(false);
        self.cache.clear();
        tokio::spawn(async move { old.close().await });

        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.get_pool().await {
                Ok(_) => {
                    tracing::info!("pool: recreated after fatal error");
                    this.events.pool_event(PoolEvent::Recreated);
                }
                Err(e) => tracing::error!("pool: recreation failed, background retry pending: {}", e),
            }
        });
    }

    /// Cancel every background task and close the pool.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
        }
        tracing::info!("pool: shut down");
    }

    // ── Health ──────────────────────────────────────────────────────────────

    fn spawn_health_monitor(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let cancel = self.cancel.clone();
        let period = self.settings.health_interval;
        tokio::spawn(async move {
            tracing::info!("pool: health monitor started (interval={}ms)", period.as_millis());
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let health = this.check_health().await;
                        tracing::debug!(connected = health.connected, "pool: health check");
                    }
                }
            }
        });
    }

    /// Log and publish only on state transitions.
    fn record_health(&self, healthy: bool) {
        let previous = self.healthy.swap(healthy, Ordering::AcqRel);
        if previous == healthy {
            return;
        }
        if healthy {
            tracing::info!("pool: database connection state disconnected -> connected");
        } else {
            tracing::warn!("pool: database connection state connected -> disconnected");
        }
        self.events.pool_event(PoolEvent::HealthChanged { healthy });
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Check the live pool. Never creates a pool.
    pub async fn check_health(self: &Arc<Self>) -> PoolHealth {
        let pool = self.pool.read().await.clone();
        let (retry_attempts, retries_exhausted) = {
            let retry = self.retry_state();
            (retry.attempts, retry.exhausted)
        };
        let checked_at = chrono::Utc::now();

        let Some(pool) = pool else {
            return PoolHealth {
                connected: false,
                latency_ms: None,
                error: None,
                pool_created: false,
                stats: self.pool_stats_of(None),
                retry_attempts,
                retries_exhausted,
                checked_at,
            };
        };

        let started = Instant::now();
        let check = tokio::time::timeout(
            HEALTH_CHECK_TIMEOUT,
            sqlx::query_scalar::<_, i32>("SELECT 1").persistent(false).fetch_one(&pool),
        )
        .await;

        let (connected, error) = match check {
            Ok(Ok(_)) => (true, None),
            Ok(Err(e)) => {
                if is_connection_lost(&e) {
                    self.handle_pool_error(&e.to_string()).await;
                }
                (false, Some(e.to_string()))
            }
            Err(_) => (false, Some(format!("health check timed out after {}s", HEALTH_CHECK_TIMEOUT.as_secs()))),
        };
        self.record_health(connected);

        PoolHealth {
            connected,
            latency_ms: connected.then(|| started.elapsed().as_millis() as u64),
            error,
            pool_created: true,
            stats: self.pool_stats_of(Some(&pool)),
            retry_attempts,
            retries_exhausted,
            checked_at,
        }
    }

    pub async fn pool_stats(&self) -> PoolStats {
        let pool = self.pool.read().await.clone();
        self.pool_stats_of(pool.as_ref())
    }

    fn pool_stats_of(&self, pool: Option<&PgPool>) -> PoolStats {
        PoolStats {
            total: pool.map(|p| p.size()).unwrap_or(0),
            idle: pool.map(|p| p.num_idle()).unwrap_or(0),
            waiting: self.waiting.load(Ordering::Acquire),
            max: self.settings.max_connections,
        }
    }

    // ── Execution ───────────────────────────────────────────────────────────

    async fn acquire(&self, pool: &PgPool, timeout: Duration) -> Result<PoolConnection<Postgres>, ConnectionError> {
        let _waiting = WaitingGuard::enter(&self.waiting);
        match tokio::time::timeout(timeout, pool.acquire()).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(sqlx::Error::PoolTimedOut)) => Err(ConnectionError::AcquireTimeout(timeout)),
            Ok(Err(e)) => Err(ConnectionError::Acquire(e.to_string())),
            Err(_) => {
                tracing::warn!(
                    waiting = self.waiting.load(Ordering::Acquire),
                    "pool: acquisition timed out after {}ms",
                    timeout.as_millis()
                );
                Err(ConnectionError::AcquireTimeout(timeout))
            }
        }
    }

    /// Run one statement with the deadline discipline. The deadline is always
    /// reset before the connection goes back; a connection whose reset fails,
    /// or whose caller went away mid-statement, is closed instead.
    async fn run_on_connection(
        &self,
        conn: &mut PoolConnection<Postgres>,
        sql: &str,
        params: &[SqlParam],
        timeout: Duration,
    ) -> Result<RawOutcome, sqlx::Error> {
        if !self.settings.statement_timeout {
            // No server-side deadline: bound the wait client-side and drop the
            // connection if it expires, since the statement may still be running.
            return match tokio::time::timeout(timeout, run_statement(conn, sql, params)).await {
                Ok(result) => result,
                Err(_) => {
                    conn.close_on_drop();
                    Err(sqlx::Error::Protocol(format!(
                        "statement exceeded {}ms client-side timeout",
                        timeout.as_millis()
                    )))
                }
            };
        }

        let mut deadline = DeadlineGuard::set(conn, timeout).await?;
        let result = run_statement(deadline.conn(), sql, params).await;
        deadline.reset().await;
        result
    }

    /// Plain execution: acquire, run, classify, release.
    pub async fn execute_query(
        self: &Arc<Self>,
        sql: &str,
        params: &[SqlParam],
        timeout: Option<Duration>,
    ) -> Result<QueryResult, GatewayError> {
        let timeout = timeout.unwrap_or(self.settings.query_timeout);
        let pool = self.get_pool().await?;
        let mut conn = self.acquire(&pool, timeout).await?;

        let started = Instant::now();
        let outcome = self.run_on_connection(&mut conn, sql, params, timeout).await;
        drop(conn);
        let elapsed = started.elapsed();

        match outcome {
            Ok(raw) => Ok(self.finish(sql, raw, elapsed, None)),
            Err(e) => Err(self.query_failed(sql, params.len(), elapsed, e)),
        }
    }

    /// Execution through the prepared-statement cache. Falls back to
    /// `execute_query` when there are no parameters, when prepared statements
    /// are disabled, or when the backend rejects the cached statement.
    pub async fn execute_query_with_prepared_statement(
        self: &Arc<Self>,
        sql: &str,
        params: &[SqlParam],
        timeout: Option<Duration>,
    ) -> Result<QueryResult, GatewayError> {
        if params.is_empty() || !self.settings.use_prepared_statements {
            return self.execute_query(sql, params, timeout).await;
        }

        let timeout = timeout.unwrap_or(self.settings.query_timeout);
        let entry = self.cache.get_or_create(sql, params.len());
        let pool = self.get_pool().await?;
        let mut conn = self.acquire(&pool, timeout).await?;

        let started = Instant::now();
        if entry.use_count == 1 {
            tracing::debug!(
                name = %entry.name,
                generation = entry.generation,
                params = params.len(),
                "prepared statement created"
            );
        }
        let outcome = self.run_on_connection(&mut conn, &entry.server_sql(), params, timeout).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(raw) => Ok(self.finish(sql, raw, elapsed, Some(entry.name))),
            Err(e) => {
                let (kind, code) = classify(&e);
                if kind != QueryErrorKind::Generic || matches!(e, sqlx::Error::Encode(_)) {
                    drop(conn);
                    return Err(self.query_failed(sql, params.len(), elapsed, e));
                }
                // Drop the rejected statement from this connection as well.
                if let Err(clear_err) = conn.clear_cached_statements().await {
                    tracing::debug!("pool: failed to clear cached statements: {}", clear_err);
                    conn.close_on_drop();
                }
                drop(conn);
                self.cache.remove(sql, params.len());
                tracing::warn!(
                    name = %entry.name,
                    code = code.as_deref().unwrap_or("-"),
                    "prepared statement rejected, evicted and falling back to plain execution: {}",
                    e
                );
                self.execute_query(sql, params, Some(timeout)).await
            }
        }
    }

    fn finish(&self, sql: &str, raw: RawOutcome, elapsed: Duration, statement_name: Option<String>) -> QueryResult {
        let elapsed_ms = elapsed.as_millis() as u64;
        let row_count = if raw.rows.is_empty() { raw.rows_affected } else { raw.rows.len() as u64 };
        let prepared = statement_name.is_some();

        if elapsed >= self.settings.slow_query_threshold {
            tracing::warn!(elapsed_ms, sql = %truncate_sql(sql), "slow query");
            self.events.query_event(QueryEvent::Slow {
                sql: truncate_sql(sql),
                elapsed_ms,
                threshold_ms: self.settings.slow_query_threshold.as_millis() as u64,
            });
        } else {
            tracing::debug!(elapsed_ms, row_count, prepared, "query executed");
        }
        self.events.query_event(QueryEvent::Succeeded {
            sql: truncate_sql(sql),
            row_count,
            elapsed_ms,
            prepared,
        });

        QueryResult {
            rows: raw.rows,
            fields: raw.fields,
            row_count,
            execution_time_ms: elapsed_ms,
            truncated: false,
            prepared,
            statement_name,
        }
    }

    fn query_failed(self: &Arc<Self>, sql: &str, param_count: usize, elapsed: Duration, err: sqlx::Error) -> GatewayError {
        let (kind, sqlstate) = classify(&err);
        let error = QueryError {
            kind,
            message: database_message(&err),
            sql: truncate_sql(sql),
            param_count,
            elapsed_ms: elapsed.as_millis() as u64,
            sqlstate,
        };
        let gateway = GatewayError::Query(error);

        tracing::error!(code = gateway.code(), "{}", gateway);
        self.events.query_event(QueryEvent::Failed {
            sql: truncate_sql(sql),
            code: gateway.code(),
            message: database_message(&err),
            elapsed_ms: elapsed.as_millis() as u64,
        });

        if kind == QueryErrorKind::ConnectionTerminated && is_connection_lost(&err) {
            let this = Arc::clone(self);
            let message = err.to_string();
            tokio::spawn(async move { this.handle_pool_error(&message).await });
        }
        gateway
    }

    // ── DDL helper ──────────────────────────────────────────────────────────

    /// Create a table with a generated prefixed id, timestamps and an
    /// `updated_at` trigger, all in one transaction.
    pub async fn create_managed_table(
        self: &Arc<Self>,
        name: &str,
        id_prefix: &str,
        extra_columns: &[ColumnSpec],
    ) -> Result<(), GatewayError> {
        let statements = managed_table_statements(name, id_prefix, extra_columns)?;
        let pool = self.get_pool().await?;
        let timeout = self.settings.query_timeout;
        let mut conn = self.acquire(&pool, timeout).await?;
        let started = Instant::now();

        let mut tx = match conn.begin().await {
            Ok(tx) => tx,
            Err(e) => return Err(self.query_failed("BEGIN", 0, started.elapsed(), e)),
        };

        for statement in &statements {
            if let Err(e) = (&mut *tx).execute(statement.as_str()).await {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::error!("create_managed_table: rollback failed: {}", rollback_err);
                }
                return Err(self.query_failed(statement, 0, started.elapsed(), e));
            }
        }

        if let Err(e) = tx.commit().await {
            return Err(self.query_failed("COMMIT", 0, started.elapsed(), e));
        }
        tracing::info!(table = %name, columns = extra_columns.len(), "managed table created");
        Ok(())
    }
}

/// Parse `sql` on the connection (the driver keeps it in the connection's
/// statement cache), convert the parameters to the types the backend resolved
/// for them, then execute. Statements without parameters skip the parse.
async fn run_statement(
    conn: &mut PoolConnection<Postgres>,
    sql: &str,
    params: &[SqlParam],
) -> Result<RawOutcome, sqlx::Error> {
    if params.is_empty() {
        return fetch_all(conn, sqlx::query(sql).persistent(false)).await;
    }

    let statement = (&mut **conn).prepare(sql).await?;
    let declared = match statement.parameters() {
        Some(Either::Left(types)) => types.to_vec(),
        _ => Vec::new(),
    };
    let args = bind_params(params, &declared).map_err(sqlx::Error::Encode)?;

    let mut raw = fetch_all(conn, sqlx::query_with(sql, args)).await?;
    if raw.fields.is_empty() {
        raw.fields = describe_columns(statement.columns());
    }
    Ok(raw)
}

async fn fetch_all<'q>(
    conn: &mut PoolConnection<Postgres>,
    query: Query<'q, Postgres, PgArguments>,
) -> Result<RawOutcome, sqlx::Error> {
    let mut rows = Vec::new();
    let mut fields = Vec::new();
    let mut rows_affected = 0u64;
    let mut stream = (&mut **conn).fetch_many(query);
    while let Some(item) = stream.try_next().await? {
        match item {
            Either::Left(done) => rows_affected += done.rows_affected(),
            Either::Right(row) => {
                if fields.is_empty() {
                    fields = describe_columns(sqlx::Row::columns(&row));
                }
                rows.push(decode_row(&row));
            }
        }
    }
    Ok(RawOutcome { rows, fields, rows_affected })
}

/// Server-side `statement_timeout` scoped to one statement. Unless
/// [`DeadlineGuard::reset`] completes, dropping the guard marks the
/// connection to be closed rather than returned with the deadline still set.
struct DeadlineGuard<'c> {
    conn: &'c mut PoolConnection<Postgres>,
    cleared: bool,
}

impl<'c> DeadlineGuard<'c> {
    async fn set(conn: &'c mut PoolConnection<Postgres>, timeout: Duration) -> Result<Self, sqlx::Error> {
        let set = format!("SET statement_timeout = {}", timeout.as_millis());
        let mut guard = Self { conn, cleared: false };
        (&mut **guard.conn).execute(set.as_str()).await?;
        Ok(guard)
    }

    fn conn(&mut self) -> &mut PoolConnection<Postgres> {
        &mut *self.conn
    }

    async fn reset(&mut self) {
        match (&mut **self.conn).execute("RESET statement_timeout").await {
            Ok(_) => self.cleared = true,
            Err(e) => tracing::warn!("pool: failed to reset statement_timeout, closing connection: {}", e),
        }
    }
}

impl Drop for DeadlineGuard<'_> {
    fn drop(&mut self) {
        if !self.cleared {
            self.conn.close_on_drop();
        }
    }
}

/// Classify an execution error and pull out its SQLSTATE.
pub(crate) fn classify(err: &sqlx::Error) -> (QueryErrorKind, Option<String>) {
    match err {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned());
            let kind = match code.as_deref() {
                Some("57014") => QueryErrorKind::Timeout,
                Some(c) if is_lost_connection_code(c) => {
                    QueryErrorKind::ConnectionTerminated
                }
                _ => QueryErrorKind::Generic,
            };
            (kind, code)
        }
        sqlx::Error::Protocol(msg) if msg.contains("timeout") => (QueryErrorKind::Timeout, None),
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::Protocol(_) | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => (QueryErrorKind::ConnectionTerminated, None),
        _ => (QueryErrorKind::Generic, None),
    }
}

/// Errors that mean the backend connection itself is gone.
pub(crate) fn is_connection_lost(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db.code().is_some_and(|c| is_lost_connection_code(&c)),
        _ => false,
    }
}

/// Connection-exception class (08) and admin shutdown codes. `08P01` is a
/// protocol violation reported over a connection that is still usable.
fn is_lost_connection_code(code: &str) -> bool {
    (code.starts_with("08") && code != "08P01") || matches!(code, "57P01" | "57P02" | "57P03")
}

fn database_message(err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db) => db.message().to_string(),
        other => other.to_string(),
    }
}

static IDENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").unwrap());
static PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]{1,16}$").unwrap());
static TYPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9_ ]{0,40}(\(\s*\d+\s*(,\s*\d+\s*)?\))?(\[\])?$").unwrap()
});

const RESERVED_COLUMNS: &[&str] = &["id", "created_at", "updated_at"];

pub(crate) fn managed_table_statements(
    name: &str,
    id_prefix: &str,
    extra_columns: &[ColumnSpec],
) -> Result<Vec<String>, GatewayError> {
    if !IDENT_RE.is_match(name) {
        return Err(GatewayError::Validation(format!("invalid table name '{}'", name)));
    }
    if !PREFIX_RE.is_match(id_prefix) {
        return Err(GatewayError::Validation(format!("invalid id prefix '{}'", id_prefix)));
    }

    let mut columns = vec![format!(
        "id TEXT PRIMARY KEY DEFAULT ('{}_' || replace(gen_random_uuid()::text, '-', ''))",
        id_prefix
    )];
    for col in extra_columns {
        if !IDENT_RE.is_match(&col.name) || RESERVED_COLUMNS.contains(&col.name.to_ascii_lowercase().as_str()) {
            return Err(GatewayError::Validation(format!("invalid column name '{}'", col.name)));
        }
        if !TYPE_RE.is_match(col.sql_type.trim()) {
            return Err(GatewayError::Validation(format!(
                "invalid type '{}' for column '{}'",
                col.sql_type, col.name
            )));
        }
        columns.push(format!(
            "\"{}\" {}{}",
            col.name,
            col.sql_type.trim(),
            if col.not_null { " NOT NULL" } else { "" }
        ));
    }
    columns.push("created_at TIMESTAMPTZ NOT NULL DEFAULT now()".to_string());
    columns.push("updated_at TIMESTAMPTZ NOT NULL DEFAULT now()".to_string());

    let trigger = format!("{}_touch_updated_at", name);
    Ok(vec![
        format!("CREATE TABLE IF NOT EXISTS \"{}\" ({})", name, columns.join(", ")),
        "CREATE OR REPLACE FUNCTION touch_updated_at() RETURNS TRIGGER AS $$ \
         BEGIN NEW.updated_at = now(); RETURN NEW; END; $$ LANGUAGE plpgsql"
            .to_string(),
        format!("DROP TRIGGER IF EXISTS \"{}\" ON \"{}\"", trigger, name),
        format!(
            "CREATE TRIGGER \"{}\" BEFORE UPDATE ON \"{}\" FOR EACH ROW EXECUTE FUNCTION touch_updated_at()",
            trigger, name
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheSettings;
    use crate::db::value::ValueKind;

    fn unreachable_manager(retry_max_attempts: u32) -> Arc<ConnectionPoolManager> {
        let connect = DbConnectConfig {
            host: "127.0.0.1".into(),
            port: 1,
            ..DbConnectConfig::default()
        };
        let settings = PoolSettings {
            connect_timeout: Duration::from_millis(300),
            retry_delay: Duration::from_millis(20),
            retry_max_attempts,
            ..PoolSettings::default()
        };
        ConnectionPoolManager::new(
            connect,
            settings,
            Arc::new(PreparedStatementCache::new(&CacheSettings::default())),
            EventBus::new(),
        )
    }

    #[tokio::test]
    async fn health_without_pool_does_not_connect() {
        let manager = unreachable_manager(1);
        let health = manager.check_health().await;
        assert!(!health.connected);
        assert!(!health.pool_created);
        assert_eq!(health.stats.total, 0);
        assert_eq!(health.stats.max, 10);
    }

    #[tokio::test]
    async fn unreachable_database_exhausts_retries() {
        let manager = unreachable_manager(1);
        let mut events = manager.events().subscribe_pool();

        let first = manager.get_pool().await;
        assert!(matches!(first, Err(ConnectionError::PoolCreation(_))));
        assert!(matches!(events.recv().await.unwrap(), PoolEvent::Error { .. }));

        // one background retry, then the manager gives up
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let later = manager.get_pool().await;
        assert!(matches!(later, Err(ConnectionError::RetriesExhausted { attempts: 1 })));

        let health = manager.check_health().await;
        assert!(health.retries_exhausted);

        // manual retry clears the exhausted state and tries again
        let manual = manager.retry_connection().await;
        assert!(matches!(manual, Err(ConnectionError::PoolCreation(_))));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn pool_error_without_live_pool_only_publishes() {
        let manager = unreachable_manager(0);
        let mut events = manager.subscribe_pool_events();
        manager.cache().get_or_create("SELECT $1", 1);

        manager.handle_pool_error("server closed the connection").await;

        match events.recv().await.unwrap() {
            PoolEvent::Error { message } => assert!(message.contains("server closed")),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(!manager.check_health().await.pool_created);
        assert_eq!(manager.cache().len(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn query_on_unreachable_database_is_a_connection_error() {
        let manager = unreachable_manager(0);
        let err = manager.execute_query("SELECT 1", &[], None).await.unwrap_err();
        assert_eq!(err.code(), "CONNECTION_ERROR");
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_rejects_further_use() {
        let manager = unreachable_manager(0);
        manager.shutdown().await;
        assert!(matches!(manager.get_pool().await, Err(ConnectionError::ShutDown)));
    }

    #[test]
    fn managed_table_builds_transactional_ddl() {
        let cols = vec![
            ColumnSpec { name: "title".into(), sql_type: "TEXT".into(), not_null: true },
            ColumnSpec { name: "score".into(), sql_type: "NUMERIC(10, 2)".into(), not_null: false },
        ];
        let stmts = managed_table_statements("tasks", "task", &cols).unwrap();
        assert_eq!(stmts.len(), 4);
        assert!(stmts[0].starts_with("CREATE TABLE IF NOT EXISTS \"tasks\""));
        assert!(stmts[0].contains("'task_' ||"));
        assert!(stmts[0].contains("\"title\" TEXT NOT NULL"));
        assert!(stmts[0].contains("\"score\" NUMERIC(10, 2),"));
        assert!(stmts[1].starts_with("CREATE OR REPLACE FUNCTION touch_updated_at()"));
        assert!(stmts[3].contains("BEFORE UPDATE ON \"tasks\""));
    }

    #[test]
    fn managed_table_rejects_injection() {
        assert!(managed_table_statements("tasks; DROP TABLE x", "t", &[]).is_err());
        assert!(managed_table_statements("tasks", "t'", &[]).is_err());
        let bad_type = vec![ColumnSpec { name: "a".into(), sql_type: "TEXT); DROP TABLE x; --".into(), not_null: false }];
        assert!(managed_table_statements("tasks", "t", &bad_type).is_err());
        let reserved = vec![ColumnSpec { name: "updated_at".into(), sql_type: "TEXT".into(), not_null: false }];
        assert!(managed_table_statements("tasks", "t", &reserved).is_err());
    }

    #[test]
    fn classify_io_errors_as_terminated() {
        let err = sqlx::Error::Io(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"));
        assert_eq!(classify(&err).0, QueryErrorKind::ConnectionTerminated);
        assert!(is_connection_lost(&err));
        assert_eq!(classify(&sqlx::Error::RowNotFound).0, QueryErrorKind::Generic);
    }

    #[test]
    fn protocol_violation_is_not_a_lost_connection() {
        assert!(is_lost_connection_code("08006"));
        assert!(is_lost_connection_code("57P01"));
        assert!(!is_lost_connection_code("08P01"));
        assert!(!is_lost_connection_code("42P01"));
    }

    #[test]
    fn bind_errors_are_generic_query_errors() {
        let err = sqlx::Error::Encode("parameter 0: 'x' is not a valid uuid".into());
        assert_eq!(classify(&err).0, QueryErrorKind::Generic);
        assert!(!is_connection_lost(&err));
    }

    #[test]
    fn truncate_marks_result() {
        let mut result = QueryResult {
            rows: vec![vec![CellValue::Integer(1)], vec![CellValue::Integer(2)], vec![CellValue::Integer(3)]],
            fields: vec![FieldDescriptor { name: "n".into(), type_name: "INT4".into(), kind: ValueKind::Integer }],
            row_count: 3,
            execution_time_ms: 1,
            truncated: false,
            prepared: false,
            statement_name: None,
        };
        result.truncate(2);
        assert!(result.truncated);
        assert_eq!(result.rows_as_objects(), vec![serde_json::json!({"n": 1}), serde_json::json!({"n": 2})]);
        assert_eq!(result.row_count, 3);
    }
}
