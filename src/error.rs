// pg-mcp-gateway - Error taxonomy
//
// Validation failures never reach this module: `QueryValidator` returns them
// as data (`ValidationResult`). Everything that touches the database surfaces
// through `GatewayError`, each variant with a stable code. Session lookups fail
// with `SessionError` (mapped to HTTP by the handlers) and bad settings with
// `ConfigError` at startup.

use std::time::Duration;

/// Maximum number of SQL characters kept in error context and log lines.
pub const SQL_CONTEXT_CHARS: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {message}")]
    Invalid { var: &'static str, message: String },
}

/// Pool creation / acquisition failures.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("failed to create connection pool: {0}")]
    PoolCreation(String),

    #[error("connection retries exhausted after {attempts} attempts; manual retry required")]
    RetriesExhausted { attempts: u32 },

    #[error("timed out after {}ms waiting for a free connection", .0.as_millis())]
    AcquireTimeout(Duration),

    #[error("failed to acquire connection: {0}")]
    Acquire(String),

    #[error("connection pool is shut down")]
    ShutDown,
}

/// How a query execution failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryErrorKind {
    Timeout,
    ConnectionTerminated,
    Generic,
}

/// Execution failure enriched with enough context for the caller to classify it.
#[derive(Debug, thiserror::Error)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub message: String,
    /// Truncated statement text.
    pub sql: String,
    pub param_count: usize,
    pub elapsed_ms: u64,
    /// Backend SQLSTATE (e.g. `42P01` undefined table, `42501` permission denied).
    pub sqlstate: Option<String>,
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self.kind {
            QueryErrorKind::Timeout => "query timed out",
            QueryErrorKind::ConnectionTerminated => "connection terminated",
            QueryErrorKind::Generic => "query failed",
        };
        write!(
            f,
            "{}: {} (sql: {}, params: {}, after {}ms",
            label, self.message, self.sql, self.param_count, self.elapsed_ms
        )?;
        if let Some(code) = &self.sqlstate {
            write!(f, ", code {}", code)?;
        }
        f.write_str(")")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("missing session id")]
    Missing,

    #[error("invalid or expired session id: {0}")]
    Invalid(String),

    #[error("session {0} has been terminated")]
    Closed(String),

    #[error("client id does not match the session owner")]
    ClientMismatch,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Query(#[from] QueryError),
}

impl GatewayError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "VALIDATION_ERROR",
            GatewayError::Connection(ConnectionError::AcquireTimeout(_)) => "ACQUIRE_TIMEOUT",
            GatewayError::Connection(_) => "CONNECTION_ERROR",
            GatewayError::Query(q) => match q.kind {
                QueryErrorKind::Timeout => "QUERY_TIMEOUT",
                QueryErrorKind::ConnectionTerminated => "CONNECTION_TERMINATED",
                QueryErrorKind::Generic => "QUERY_ERROR",
            },
        }
    }

    /// Backend SQLSTATE, when the failure came from the database.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            GatewayError::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }
}

/// Truncate SQL for error context and logs, respecting char boundaries.
pub fn truncate_sql(sql: &str) -> String {
    let trimmed = sql.trim();
    match trimmed.char_indices().nth(SQL_CONTEXT_CHARS) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_sql_keeps_short_statements() {
        assert_eq!(truncate_sql("  SELECT 1  "), "SELECT 1");
    }

    #[test]
    fn truncate_sql_cuts_on_char_boundary() {
        let long = "é".repeat(SQL_CONTEXT_CHARS + 10);
        let out = truncate_sql(&long);
        assert!(out.ends_with("..."));
        assert_eq!(out.chars().count(), SQL_CONTEXT_CHARS + 3);
    }

    #[test]
    fn query_error_codes_follow_kind() {
        let err = GatewayError::Query(QueryError {
            kind: QueryErrorKind::Timeout,
            message: "canceling statement due to statement timeout".into(),
            sql: "SELECT pg_sleep(10)".into(),
            param_count: 0,
            elapsed_ms: 5001,
            sqlstate: Some("57014".into()),
        });
        assert_eq!(err.code(), "QUERY_TIMEOUT");
        assert_eq!(err.sqlstate(), Some("57014"));
        assert!(err.to_string().contains("code 57014"));
    }

    #[test]
    fn acquire_timeout_has_its_own_code() {
        let err = GatewayError::from(ConnectionError::AcquireTimeout(Duration::from_millis(250)));
        assert_eq!(err.code(), "ACQUIRE_TIMEOUT");
        assert!(err.to_string().contains("250ms"));
    }
}
