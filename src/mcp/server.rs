//! MCP protocol handler, one instance per session.
//!
//! Speaks JSON-RPC 2.0. Supported methods:
//! - `initialize`: server info + capabilities, marks the transport initialized
//! - `notifications/initialized`: client ack (no response)
//! - `ping`
//! - `tools/list` / `tools/call`
//! - `logging/setLevel`: enables `notifications/message` on the session stream

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde_json::{Value, json};

use super::tools::{self, ToolError};
use super::transport::StreamTransport;
use crate::error::truncate_sql;
use crate::state::Gateway;

pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];
const SERVER_NAME: &str = "pg-mcp-gateway";

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
pub const SERVER_ERROR: i32 = -32000;

/// RFC 5424 severities, as used by MCP logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "debug" => Self::Debug,
            "info" => Self::Info,
            "notice" => Self::Notice,
            "warning" => Self::Warning,
            "error" => Self::Error,
            "critical" => Self::Critical,
            "alert" => Self::Alert,
            "emergency" => Self::Emergency,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Notice => "notice",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
            Self::Alert => "alert",
            Self::Emergency => "emergency",
        }
    }
}

pub struct McpHandler {
    gateway: Gateway,
    transport: Arc<StreamTransport>,
    client_info: Mutex<Option<Value>>,
    log_level: Mutex<Option<LogLevel>>,
    client_ready: AtomicBool,
}

impl McpHandler {
    pub fn new(gateway: Gateway, transport: Arc<StreamTransport>) -> Self {
        Self {
            gateway,
            transport,
            client_info: Mutex::new(None),
            log_level: Mutex::new(None),
            client_ready: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> &str {
        self.transport.session_id()
    }

    pub fn client_info(&self) -> Option<Value> {
        self.client_info.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// `true` once the client sent `notifications/initialized`.
    pub fn client_ready(&self) -> bool {
        self.client_ready.load(Ordering::Acquire)
    }

    pub fn log_level(&self) -> Option<LogLevel> {
        *self.log_level.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Handle one JSON-RPC message. Returns `None` for notifications.
    pub async fn handle(&self, request: &Value) -> Option<Value> {
        let Some(obj) = request.as_object() else {
            return Some(json_rpc_error(Value::Null, INVALID_REQUEST, "Invalid Request: expected an object"));
        };
        let id = obj.get("id").cloned();
        let is_notification = id.is_none();
        let id = id.unwrap_or(Value::Null);

        if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            return Some(json_rpc_error(id, INVALID_REQUEST, "Invalid Request: jsonrpc must be \"2.0\""));
        }
        let Some(method) = obj.get("method").and_then(Value::as_str) else {
            // A bare response from the client (e.g. to a server ping) needs no reply.
            return None;
        };
        let params = obj.get("params").cloned().unwrap_or_else(|| json!({}));

        tracing::debug!(session_id = %self.session_id(), method = %method, "mcp: incoming request");

        let response = match method {
            "initialize" => self.handle_initialize(&id, &params),
            "notifications/initialized" => {
                self.client_ready.store(true, Ordering::Release);
                return None;
            }
            "ping" => json_rpc_result(&id, json!({})),
            "tools/list" => json_rpc_result(
                &id,
                json!({ "tools": tools::tool_list(self.gateway.validator.allows_write()) }),
            ),
            "tools/call" => self.handle_tools_call(&id, &params).await,
            "logging/setLevel" => self.handle_set_level(&id, &params),
            _ if is_notification => return None,
            _ => json_rpc_error(id, METHOD_NOT_FOUND, &format!("Method not found: {}", method)),
        };

        if is_notification { None } else { Some(response) }
    }

    // ── initialize ──────────────────────────────────────────────────────────

    fn handle_initialize(&self, id: &Value, params: &Value) -> Value {
        let requested = params.get("protocolVersion").and_then(Value::as_str);
        let version = requested
            .filter(|v| SUPPORTED_PROTOCOL_VERSIONS.contains(v))
            .unwrap_or(SUPPORTED_PROTOCOL_VERSIONS[0]);

        if let Some(info) = params.get("clientInfo") {
            *self.client_info.lock().unwrap_or_else(|p| p.into_inner()) = Some(info.clone());
        }
        self.transport.mark_initialized();

        let client = params.pointer("/clientInfo/name").and_then(|v| v.as_str()).unwrap_or("unknown");
        tracing::info!(session_id = %self.session_id(), protocol = version, client, "mcp: initialized");

        let mode = if self.gateway.validator.allows_write() { "read/write" } else { "read-only" };
        json_rpc_result(
            id,
            json!({
                "protocolVersion": version,
                "capabilities": {
                    "tools": { "listChanged": false },
                    "logging": {}
                },
                "serverInfo": {
                    "name": SERVER_NAME,
                    "version": env!("CARGO_PKG_VERSION")
                },
                "instructions": format!(
                    "PostgreSQL gateway in {mode} mode. Use `query` with $n placeholders and `params`; `validate_query` checks a statement without running it."
                )
            }),
        )
    }

    // ── logging/setLevel ────────────────────────────────────────────────────

    fn handle_set_level(&self, id: &Value, params: &Value) -> Value {
        let Some(level) = params.get("level").and_then(Value::as_str).and_then(LogLevel::parse) else {
            return json_rpc_error(id.clone(), INVALID_PARAMS, "Invalid or missing 'level'");
        };
        *self.log_level.lock().unwrap_or_else(|p| p.into_inner()) = Some(level);
        json_rpc_result(id, json!({}))
    }

    /// Push a `notifications/message` to the session stream if the client
    /// asked for messages at this level.
    fn notify(&self, level: LogLevel, data: Value) {
        match self.log_level() {
            Some(min) if level >= min => {}
            _ => return,
        }
        self.transport.send(&json!({
            "jsonrpc": "2.0",
            "method": "notifications/message",
            "params": {
                "level": level.as_str(),
                "logger": SERVER_NAME,
                "data": data
            }
        }));
    }

    // ── tools/call ──────────────────────────────────────────────────────────

    async fn handle_tools_call(&self, id: &Value, params: &Value) -> Value {
        let tool_name = params.get("name").and_then(Value::as_str).unwrap_or("");
        if tool_name.is_empty() {
            return json_rpc_error(id.clone(), INVALID_PARAMS, "Missing 'name' in params");
        }
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        tracing::info!(session_id = %self.session_id(), tool = %tool_name, "mcp: tools/call");
        let started = Instant::now();
        let outcome = tools::call_tool(&self.gateway, tool_name, &arguments).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(output) => {
                let threshold_ms = self.gateway.pool.settings().slow_query_threshold.as_millis() as u64;
                if elapsed_ms > threshold_ms {
                    self.notify(
                        LogLevel::Warning,
                        json!({ "tool": tool_name, "message": "slow tool call", "elapsed_ms": elapsed_ms, "threshold_ms": threshold_ms }),
                    );
                }
                json_rpc_result(
                    id,
                    json!({
                        "content": [{ "type": "text", "text": output.text() }],
                        "structuredContent": output.structured,
                        "isError": false
                    }),
                )
            }
            Err(ToolError::UnknownTool(name)) => {
                json_rpc_error(id.clone(), INVALID_PARAMS, &format!("Unknown tool: {}", name))
            }
            Err(e) => {
                let code = e.code();
                tracing::warn!(session_id = %self.session_id(), tool = %tool_name, code, elapsed_ms, "mcp: tool failed: {}", e);

                let mut data = json!({ "tool": tool_name, "code": code, "message": e.to_string(), "elapsed_ms": elapsed_ms });
                if let Some(sql) = arguments.get("sql").and_then(Value::as_str) {
                    data["sql"] = json!(truncate_sql(sql));
                }
                self.notify(LogLevel::Error, data);

                let mut error = json!({ "code": code, "message": e.to_string() });
                if let ToolError::Gateway(inner) = &e {
                    if let Some(state) = inner.sqlstate() {
                        error["sqlstate"] = json!(state);
                    }
                }
                json_rpc_result(
                    id,
                    json!({
                        "content": [{ "type": "text", "text": format!("{}: {}", code, e) }],
                        "structuredContent": { "error": error },
                        "isError": true
                    }),
                )
            }
        }
    }
}

// ── JSON-RPC helpers ────────────────────────────────────────────────────────

pub fn json_rpc_result(id: &Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result
    })
}

pub fn json_rpc_error(id: Value, code: i32, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": code,
            "message": message
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;

    fn handler() -> McpHandler {
        let gateway = Gateway::new(&GatewayConfig::default());
        McpHandler::new(gateway, StreamTransport::new())
    }

    #[tokio::test]
    async fn initialize_marks_transport_and_negotiates_version() {
        let h = handler();
        let resp = h
            .handle(&json!({
                "jsonrpc": "2.0", "id": 1, "method": "initialize",
                "params": { "protocolVersion": "2024-11-05", "clientInfo": { "name": "test" } }
            }))
            .await
            .unwrap();
        assert_eq!(resp["result"]["protocolVersion"], "2024-11-05");
        assert_eq!(resp["result"]["serverInfo"]["name"], SERVER_NAME);
        assert!(h.transport.is_initialized());
        assert_eq!(h.client_info().unwrap()["name"], "test");
    }

    #[tokio::test]
    async fn unsupported_version_falls_back_to_latest() {
        let h = handler();
        let resp = h
            .handle(&json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": { "protocolVersion": "1999-01-01" } }))
            .await
            .unwrap();
        assert_eq!(resp["result"]["protocolVersion"], SUPPORTED_PROTOCOL_VERSIONS[0]);
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let h = handler();
        assert!(h.handle(&json!({ "jsonrpc": "2.0", "method": "notifications/initialized" })).await.is_none());
        assert!(h.client_ready());
        assert!(h.handle(&json!({ "jsonrpc": "2.0", "method": "notifications/whatever" })).await.is_none());
    }

    #[tokio::test]
    async fn unknown_method_and_bad_envelope() {
        let h = handler();
        let resp = h.handle(&json!({ "jsonrpc": "2.0", "id": 7, "method": "resources/list" })).await.unwrap();
        assert_eq!(resp["error"]["code"], METHOD_NOT_FOUND);
        assert_eq!(resp["id"], 7);

        let resp = h.handle(&json!({ "id": 1, "method": "ping" })).await.unwrap();
        assert_eq!(resp["error"]["code"], INVALID_REQUEST);

        let resp = h.handle(&json!([1, 2])).await.unwrap();
        assert_eq!(resp["error"]["code"], INVALID_REQUEST);
    }

    #[tokio::test]
    async fn tool_failure_is_an_error_result_not_a_protocol_error() {
        let h = handler();
        let resp = h
            .handle(&json!({
                "jsonrpc": "2.0", "id": 2, "method": "tools/call",
                "params": { "name": "query", "arguments": { "sql": "DROP TABLE users" } }
            }))
            .await
            .unwrap();
        assert_eq!(resp["result"]["isError"], true);
        assert_eq!(resp["result"]["structuredContent"]["error"]["code"], "VALIDATION_ERROR");
        let text = resp["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.starts_with("VALIDATION_ERROR"));
    }

    #[tokio::test]
    async fn unknown_tool_is_invalid_params() {
        let h = handler();
        let resp = h
            .handle(&json!({ "jsonrpc": "2.0", "id": 3, "method": "tools/call", "params": { "name": "nope" } }))
            .await
            .unwrap();
        assert_eq!(resp["error"]["code"], INVALID_PARAMS);
    }

    #[tokio::test]
    async fn failures_are_pushed_to_stream_once_level_is_set() {
        let h = handler();
        let call = json!({
            "jsonrpc": "2.0", "id": 4, "method": "tools/call",
            "params": { "name": "query", "arguments": { "sql": "DELETE FROM t" } }
        });

        h.handle(&call).await;
        assert_eq!(h.transport.last_event_id(), 0);

        let resp = h
            .handle(&json!({ "jsonrpc": "2.0", "id": 5, "method": "logging/setLevel", "params": { "level": "warning" } }))
            .await
            .unwrap();
        assert!(resp.get("error").is_none());
        assert_eq!(h.log_level(), Some(LogLevel::Warning));

        h.handle(&call).await;
        let events = h.transport.replay_after(0);
        assert_eq!(events.len(), 1);
        let msg: Value = serde_json::from_str(&events[0].data).unwrap();
        assert_eq!(msg["method"], "notifications/message");
        assert_eq!(msg["params"]["level"], "error");
        assert_eq!(msg["params"]["data"]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn set_level_rejects_unknown_level() {
        let h = handler();
        let resp = h
            .handle(&json!({ "jsonrpc": "2.0", "id": 6, "method": "logging/setLevel", "params": { "level": "loud" } }))
            .await
            .unwrap();
        assert_eq!(resp["error"]["code"], INVALID_PARAMS);
    }

    #[tokio::test]
    async fn tools_list_reflects_mode() {
        let h = handler();
        let resp = h.handle(&json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" })).await.unwrap();
        let tools = resp["result"]["tools"].as_array().unwrap();
        assert!(tools.iter().any(|t| t["name"] == "query"));
        assert!(!tools.iter().any(|t| t["name"] == "create_managed_table"));
    }
}
