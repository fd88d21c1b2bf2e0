//! Model Context Protocol (MCP) primitives used by the droidnotify server.
//!
//! Scoped to what the server needs:
//! - JSON-RPC 2.0 envelopes
//! - the per-session lifecycle state machine (`McpConnection`)

mod jsonrpc;
mod server;
mod types;

pub use jsonrpc::{
    JsonRpcError, JsonRpcId, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, parse_message,
};
pub use server::{ConnState, McpConnection, McpHandler, McpServerConfig};
pub use types::{
    CallToolParams, CallToolResult, ContentBlock, InitializeParams, InitializeResult,
    ListToolsParams, ListToolsResult, McpClientInfo, McpServerInfo, Tool,
};

/// Latest protocol version supported by this implementation.
pub const PROTOCOL_VERSION_LATEST: &str = "2025-06-18";

/// Older protocol versions still spoken by SSE-era clients.
pub const PROTOCOL_VERSION_2025_03_26: &str = "2025-03-26";
pub const PROTOCOL_VERSION_2024_11_05: &str = "2024-11-05";
