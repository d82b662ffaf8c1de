//! Tools exposed over MCP. Each one is a thin consumer of the gateway:
//! validate, convert parameters, execute, shape the result.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};

use crate::db::{ColumnSpec, SqlParam};
use crate::error::GatewayError;
use crate::state::Gateway;

const MAX_TIMEOUT_MS: u64 = 300_000;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl ToolError {
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::UnknownTool(_) => "UNKNOWN_TOOL",
            ToolError::InvalidArguments(_) => "INVALID_ARGUMENTS",
            ToolError::Gateway(e) => e.code(),
        }
    }
}

/// Successful tool output: the JSON payload, also rendered as text content.
pub struct ToolOutput {
    pub structured: Value,
}

impl ToolOutput {
    fn new(structured: Value) -> Self {
        Self { structured }
    }

    pub fn text(&self) -> String {
        serde_json::to_string_pretty(&self.structured).unwrap_or_else(|_| self.structured.to_string())
    }
}

// ── Arguments ───────────────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct QueryArgs {
    sql: String,
    #[serde(default)]
    params: Vec<Value>,
    timeout_ms: Option<u64>,
    max_rows: Option<usize>,
    #[serde(default = "default_true")]
    use_prepared: bool,
}

#[derive(Debug, Deserialize)]
struct ValidateArgs {
    sql: String,
    #[serde(default)]
    params: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct ManagedTableArgs {
    name: String,
    id_prefix: String,
    #[serde(default)]
    columns: Vec<ColumnSpec>,
}

fn parse_args<T: for<'de> Deserialize<'de>>(args: &Value) -> Result<T, ToolError> {
    let args = if args.is_null() { json!({}) } else { args.clone() };
    serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

// ── Dispatch ────────────────────────────────────────────────────────────────

pub async fn call_tool(gateway: &Gateway, name: &str, args: &Value) -> Result<ToolOutput, ToolError> {
    match name {
        "query" => run_query(gateway, parse_args(args)?).await,
        "validate_query" => {
            let args: ValidateArgs = parse_args(args)?;
            let result = gateway.validator.validate(&args.sql, &args.params);
            Ok(ToolOutput::new(json!(result)))
        }
        "pool_status" => {
            let health = gateway.pool.check_health().await;
            Ok(ToolOutput::new(json!({
                "health": health,
                "cache": gateway.pool.cache().stats(),
            })))
        }
        "cache_stats" => Ok(ToolOutput::new(json!(gateway.pool.cache().stats()))),
        "create_managed_table" if gateway.validator.allows_write() => {
            let args: ManagedTableArgs = parse_args(args)?;
            gateway
                .pool
                .create_managed_table(&args.name, &args.id_prefix, &args.columns)
                .await?;
            Ok(ToolOutput::new(json!({ "created": true, "table": args.name })))
        }
        "create_managed_table" => Err(GatewayError::Validation(
            "create_managed_table requires write mode (ALLOW_WRITE=true)".to_string(),
        )
        .into()),
        other => Err(ToolError::UnknownTool(other.to_string())),
    }
}

async fn run_query(gateway: &Gateway, args: QueryArgs) -> Result<ToolOutput, ToolError> {
    let validation = gateway.validator.validate(&args.sql, &args.params);
    if !validation.valid {
        let message = validation.error.unwrap_or_else(|| "invalid query".to_string());
        return Err(GatewayError::Validation(message).into());
    }
    let params = SqlParam::from_json_list(&args.params).map_err(GatewayError::Validation)?;
    let timeout = args
        .timeout_ms
        .map(|ms| Duration::from_millis(ms.clamp(1, MAX_TIMEOUT_MS)));

    let pool = &gateway.pool;
    let mut result = if args.use_prepared {
        pool.execute_query_with_prepared_statement(&args.sql, &params, timeout).await?
    } else {
        pool.execute_query(&args.sql, &params, timeout).await?
    };

    let limit = args
        .max_rows
        .map_or(gateway.max_rows(), |requested| requested.min(gateway.max_rows()));
    result.truncate(limit);

    Ok(ToolOutput::new(json!({
        "rows": result.rows_as_objects(),
        "fields": result.fields,
        "rowCount": result.row_count,
        "executionTimeMs": result.execution_time_ms,
        "truncated": result.truncated,
        "preparedStatement": result.prepared,
        "statementName": result.statement_name,
        "queryType": validation.query_type,
    })))
}

// ── tools/list ──────────────────────────────────────────────────────────────

/// MCP tool descriptors. `create_managed_table` is only listed in write mode.
pub fn tool_list(allow_write: bool) -> Vec<Value> {
    let mode = if allow_write { "read/write" } else { "read-only" };
    let mut tools = vec![
        mcp_tool(
            "query",
            &format!("Execute a validated SQL statement against PostgreSQL ({mode} mode). Use $1, $2, ... placeholders with `params`."),
            json!({
                "type": "object",
                "properties": {
                    "sql": { "type": "string", "description": "SQL statement" },
                    "params": {
                        "type": "array",
                        "description": "Positional parameters: string, number, boolean, null, {\"$date\": rfc3339} or {\"$binary\": base64}"
                    },
                    "timeout_ms": { "type": "integer", "description": "Statement timeout in milliseconds" },
                    "max_rows": { "type": "integer", "description": "Maximum rows to return" },
                    "use_prepared": { "type": "boolean", "description": "Use the prepared-statement cache (default true)" }
                },
                "required": ["sql"]
            }),
        ),
        mcp_tool(
            "validate_query",
            "Check a statement and its parameters without executing it.",
            json!({
                "type": "object",
                "properties": {
                    "sql": { "type": "string" },
                    "params": { "type": "array" }
                },
                "required": ["sql"]
            }),
        ),
        mcp_tool(
            "pool_status",
            "Connection pool health, counters and prepared-statement cache stats.",
            json!({ "type": "object", "properties": {} }),
        ),
        mcp_tool(
            "cache_stats",
            "Prepared-statement cache size, hit rate, evictions and expirations.",
            json!({ "type": "object", "properties": {} }),
        ),
    ];

    if allow_write {
        tools.push(mcp_tool(
            "create_managed_table",
            "Create a table with a prefixed text id, created_at/updated_at timestamps and an updated_at trigger.",
            json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string", "description": "Table name" },
                    "id_prefix": { "type": "string", "description": "Prefix for generated ids, e.g. 'usr'" },
                    "columns": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "name": { "type": "string" },
                                "type": { "type": "string" },
                                "not_null": { "type": "boolean" }
                            },
                            "required": ["name", "type"]
                        }
                    }
                },
                "required": ["name", "id_prefix"]
            }),
        ));
    }

    tools
}

fn mcp_tool(name: &str, description: &str, input_schema: Value) -> Value {
    json!({
        "name": name,
        "description": description,
        "inputSchema": input_schema,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;

    fn gateway(allow_write: bool) -> Gateway {
        Gateway::new(&GatewayConfig {
            allow_write,
            ..GatewayConfig::default()
        })
    }

    #[test]
    fn write_tools_only_listed_in_write_mode() {
        let names = |tools: Vec<Value>| -> Vec<String> {
            tools.iter().map(|t| t["name"].as_str().unwrap().to_string()).collect()
        };
        assert!(!names(tool_list(false)).contains(&"create_managed_table".to_string()));
        assert!(names(tool_list(true)).contains(&"create_managed_table".to_string()));
    }

    #[tokio::test]
    async fn rejected_query_never_reaches_the_pool() {
        let gw = gateway(false);
        let err = call_tool(&gw, "query", &json!({ "sql": "DELETE FROM t" }))
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(err.to_string().contains("not allowed"));
        assert!(!gw.pool.check_health().await.pool_created);
    }

    #[tokio::test]
    async fn bad_parameter_type_is_a_validation_error() {
        let gw = gateway(false);
        let err = call_tool(&gw, "query", &json!({ "sql": "SELECT $1", "params": [[1, 2]] }))
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn missing_sql_is_invalid_arguments() {
        let gw = gateway(false);
        let err = call_tool(&gw, "query", &json!({})).await.err().unwrap();
        assert_eq!(err.code(), "INVALID_ARGUMENTS");
    }

    #[tokio::test]
    async fn validate_query_returns_structured_result() {
        let gw = gateway(false);
        let out = call_tool(&gw, "validate_query", &json!({ "sql": "SELECT * FROM t" }))
            .await
            .unwrap();
        assert_eq!(out.structured["valid"], true);
        assert_eq!(out.structured["queryType"], "SELECT");
    }

    #[tokio::test]
    async fn managed_table_refused_in_read_only_mode() {
        let gw = gateway(false);
        let err = call_tool(&gw, "create_managed_table", &json!({ "name": "t", "id_prefix": "t" }))
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn unknown_tool_is_reported() {
        let gw = gateway(false);
        let err = call_tool(&gw, "drop_everything", &json!({})).await.err().unwrap();
        assert!(matches!(err, ToolError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn cache_stats_start_empty() {
        let gw = gateway(false);
        let out = call_tool(&gw, "cache_stats", &Value::Null).await.unwrap();
        assert_eq!(out.structured["size"], 0);
        assert_eq!(out.structured["max_size"], 100);
    }
}
