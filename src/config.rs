// pg-mcp-gateway - Gateway configuration
//
// All settings come from the environment (optionally seeded by `.env` via dotenvy).
// Each component takes its own settings struct so tests can build instances
// directly without touching the process environment.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

// ── Database connection ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DbConnectConfig {
    /// Full connection URL. When set, the discrete host/port/user fields are ignored.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
    /// Value applied to `search_path` on every new physical connection.
    pub schema: String,
}

impl Default for DbConnectConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: None,
            database: "postgres".to_string(),
            schema: "public".to_string(),
        }
    }
}

// ── Pool ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    /// Idle connections older than this are pinged before being handed out.
    pub keepalive_interval: Duration,
    /// Default acquisition + statement deadline for `execute_query`.
    pub query_timeout: Duration,
    pub health_interval: Duration,
    pub retry_delay: Duration,
    pub retry_max_attempts: u32,
    /// Set a server-side `statement_timeout` around every statement.
    pub statement_timeout: bool,
    pub use_prepared_statements: bool,
    pub slow_query_threshold: Duration,
    pub max_rows: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            idle_timeout: Duration::from_millis(30_000),
            connect_timeout: Duration::from_millis(10_000),
            keepalive_interval: Duration::from_millis(10_000),
            query_timeout: Duration::from_millis(5_000),
            health_interval: Duration::from_millis(30_000),
            retry_delay: Duration::from_millis(5_000),
            retry_max_attempts: 5,
            statement_timeout: true,
            use_prepared_statements: true,
            slow_query_threshold: Duration::from_millis(1_000),
            max_rows: 1_000,
        }
    }
}

// ── Prepared statement cache ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub max_entries: usize,
    /// Absolute lifetime of an entry, measured from creation.
    pub ttl: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: 100,
            ttl: Duration::from_millis(3_600_000),
        }
    }
}

// ── Sessions ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub inactivity_timeout: Duration,
    /// Extra lifetime past `inactivity_timeout` for sessions with open streams.
    pub grace_period: Duration,
    pub sweep_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_millis(1_800_000),
            grace_period: Duration::from_millis(300_000),
            sweep_interval: Duration::from_millis(60_000),
            heartbeat_interval: Duration::from_millis(30_000),
        }
    }
}

// ── Top level ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    pub db: DbConnectConfig,
    pub pool: PoolSettings,
    pub cache: CacheSettings,
    pub sessions: SessionSettings,
    /// Enables write statements and disables the read-only keyword/pattern scans.
    pub allow_write: bool,
    pub auth_secret: Option<String>,
    pub port: u16,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let pool_defaults = PoolSettings::default();
        let cache_defaults = CacheSettings::default();
        let session_defaults = SessionSettings::default();

        let db = DbConnectConfig {
            url: env_string("DATABASE_URL"),
            host: env_string("PGHOST").unwrap_or(defaults.db.host),
            port: env_parse("PGPORT", defaults.db.port)?,
            user: env_string("PGUSER").unwrap_or(defaults.db.user),
            password: env_string("PGPASSWORD"),
            database: env_string("PGDATABASE").unwrap_or(defaults.db.database),
            schema: env_string("DB_SCHEMA").unwrap_or(defaults.db.schema),
        };

        let pool = PoolSettings {
            max_connections: env_parse("DB_POOL_MAX", pool_defaults.max_connections)?,
            idle_timeout: env_millis("DB_IDLE_TIMEOUT_MS", pool_defaults.idle_timeout)?,
            connect_timeout: env_millis("DB_CONNECT_TIMEOUT_MS", pool_defaults.connect_timeout)?,
            keepalive_interval: env_millis("DB_KEEPALIVE_MS", pool_defaults.keepalive_interval)?,
            query_timeout: env_millis("DB_QUERY_TIMEOUT_MS", pool_defaults.query_timeout)?,
            health_interval: env_millis("DB_HEALTH_INTERVAL_MS", pool_defaults.health_interval)?,
            retry_delay: env_millis("DB_RETRY_DELAY_MS", pool_defaults.retry_delay)?,
            retry_max_attempts: env_parse("DB_RETRY_MAX_ATTEMPTS", pool_defaults.retry_max_attempts)?,
            statement_timeout: env_bool("DB_STATEMENT_TIMEOUT", pool_defaults.statement_timeout)?,
            use_prepared_statements: env_bool("PREPARED_STATEMENTS", pool_defaults.use_prepared_statements)?,
            slow_query_threshold: env_millis("SLOW_QUERY_MS", pool_defaults.slow_query_threshold)?,
            max_rows: env_parse("MAX_ROWS", pool_defaults.max_rows)?,
        };

        let cache = CacheSettings {
            max_entries: env_parse("PREPARED_CACHE_MAX", cache_defaults.max_entries)?,
            ttl: env_millis("PREPARED_CACHE_TTL_MS", cache_defaults.ttl)?,
        };

        let sessions = SessionSettings {
            inactivity_timeout: env_millis("SESSION_TIMEOUT_MS", session_defaults.inactivity_timeout)?,
            grace_period: env_millis("SESSION_GRACE_MS", session_defaults.grace_period)?,
            sweep_interval: env_millis("SESSION_SWEEP_MS", session_defaults.sweep_interval)?,
            heartbeat_interval: env_millis("HEARTBEAT_MS", session_defaults.heartbeat_interval)?,
        };

        let config = Self {
            db,
            pool,
            cache,
            sessions,
            allow_write: env_bool("ALLOW_WRITE", false)?,
            auth_secret: env_string("AUTH_SECRET"),
            port: env_parse("PORT", 8080)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the background tasks cannot run with. Periodic timers
    /// need a non-zero period.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.max_connections == 0 {
            return Err(ConfigError::Invalid {
                var: "DB_POOL_MAX",
                message: "must be at least 1".to_string(),
            });
        }
        let periods = [
            ("DB_HEALTH_INTERVAL_MS", self.pool.health_interval),
            ("PREPARED_CACHE_TTL_MS", self.cache.ttl),
            ("SESSION_SWEEP_MS", self.sessions.sweep_interval),
            ("HEARTBEAT_MS", self.sessions.heartbeat_interval),
        ];
        for (var, period) in periods {
            if period.is_zero() {
                return Err(ConfigError::Invalid {
                    var,
                    message: "must be greater than 0".to_string(),
                });
            }
        }
        Ok(())
    }
}

// ── Env helpers ─────────────────────────────────────────────────────────────

fn env_string(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|s| !s.trim().is_empty())
}

fn env_parse<T>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_string(var) {
        Some(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            var,
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn env_millis(var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match env_string(var) {
        Some(_) => env_parse::<u64>(var, 0).map(Duration::from_millis),
        None => Ok(default),
    }
}

fn env_bool(var: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env_string(var) {
        Some(raw) => parse_bool(&raw).ok_or_else(|| ConfigError::Invalid {
            var,
            message: format!("expected a boolean, got '{}'", raw),
        }),
        None => Ok(default),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
