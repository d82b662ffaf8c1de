//! MCP (Model Context Protocol) surface of the gateway.
//!
//! **Server** (`server`): per-session JSON-RPC 2.0 handler.
//! **Tools** (`tools`): `query`, `validate_query`, `pool_status`, `cache_stats`,
//! `create_managed_table`.
//! **Transport** (`transport`) + **sessions** (`session`): streamable HTTP,
//! POST for calls, GET for the SSE stream, DELETE to terminate.

pub mod server;
pub mod session;
pub mod tools;
pub mod transport;

pub use server::McpHandler;
pub use session::{RegistryStats, Routed, SessionHandle, SessionRegistry, StreamGuard};
pub use transport::StreamTransport;
