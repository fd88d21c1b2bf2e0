use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::jsonrpc::{
    JsonRpcError, JsonRpcId, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};
use crate::types::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, ListToolsParams,
    ListToolsResult, McpServerInfo,
};
use crate::{PROTOCOL_VERSION_2024_11_05, PROTOCOL_VERSION_2025_03_26, PROTOCOL_VERSION_LATEST};

/// Tool surface driven by every session, whatever transport carries it.
#[async_trait]
pub trait McpHandler: Send + Sync {
    async fn list_tools(&self, params: ListToolsParams) -> anyhow::Result<ListToolsResult>;
    async fn call_tool(&self, params: CallToolParams) -> anyhow::Result<CallToolResult>;
}

#[derive(Debug, Clone)]
pub struct McpServerConfig {
    pub server_info: McpServerInfo,
    pub instructions: Option<String>,
    pub capabilities: Value,
    pub supported_protocol_versions: Vec<String>,
}

impl McpServerConfig {
    pub fn default_for_binary(name: &str, version: &str) -> Self {
        Self {
            server_info: McpServerInfo {
                name: name.to_string(),
                version: version.to_string(),
            },
            instructions: None,
            capabilities: serde_json::json!({
                "tools": {
                    "listChanged": false
                }
            }),
            supported_protocol_versions: vec![
                PROTOCOL_VERSION_LATEST.to_string(),
                PROTOCOL_VERSION_2025_03_26.to_string(),
                PROTOCOL_VERSION_2024_11_05.to_string(),
            ],
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    fn negotiate_protocol(&self, requested: &str) -> String {
        if self
            .supported_protocol_versions
            .iter()
            .any(|v| v == requested)
        {
            requested.to_string()
        } else {
            PROTOCOL_VERSION_LATEST.to_string()
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnState {
    Uninitialized,
    Active,
}

struct Lifecycle {
    state: ConnState,
    protocol_version: Option<String>,
}

/// Per-session MCP state machine: lifecycle enforcement and method routing.
///
/// Transport concerns (session ids, push channels, closing) live with the
/// caller; this type only sees decoded JSON-RPC messages. The lifecycle lock
/// is never held across a handler call, so a slow tool call does not hold up
/// other requests of the same session.
pub struct McpConnection {
    cfg: McpServerConfig,
    handler: Arc<dyn McpHandler>,
    lifecycle: Mutex<Lifecycle>,
}

impl McpConnection {
    pub fn new(cfg: McpServerConfig, handler: Arc<dyn McpHandler>) -> Self {
        Self {
            cfg,
            handler,
            lifecycle: Mutex::new(Lifecycle {
                state: ConnState::Uninitialized,
                protocol_version: None,
            }),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ConnState {
        self.lifecycle().state
    }

    pub fn protocol_version(&self) -> Option<String> {
        self.lifecycle().protocol_version.clone()
    }

    /// Handle a single JSON-RPC message.
    ///
    /// Returns `Some(response)` for requests, `None` for notifications or ignored messages.
    pub async fn handle_message(&self, msg: JsonRpcMessage) -> Option<JsonRpcResponse> {
        match msg {
            JsonRpcMessage::Request(req) => Some(self.handle_request(req).await),
            JsonRpcMessage::Notification(n) => {
                self.handle_notification(n);
                None
            }
            JsonRpcMessage::Response(_) => None,
        }
    }

    fn error(id: JsonRpcId, code: i64, message: &str, detail: Option<String>) -> JsonRpcResponse {
        JsonRpcResponse::err(
            id,
            JsonRpcError {
                code,
                message: message.to_string(),
                data: detail.map(|d| serde_json::json!({ "detail": d })),
            },
        )
    }

    async fn handle_request(&self, req: JsonRpcRequest) -> JsonRpcResponse {
        if req.jsonrpc != "2.0" {
            return Self::error(req.id, -32600, "invalid jsonrpc version", None);
        }

        match req.method.as_str() {
            "initialize" => self.handle_initialize(req),
            "ping" => JsonRpcResponse::ok(req.id, serde_json::json!({})),
            "tools/list" => {
                if self.state() != ConnState::Active {
                    return Self::error(req.id, -32002, "not initialized", None);
                }
                let params = match req.params {
                    Some(v) => serde_json::from_value::<ListToolsParams>(v),
                    None => Ok(ListToolsParams::default()),
                };
                let params = match params {
                    Ok(p) => p,
                    Err(e) => return Self::error(req.id, -32602, "invalid params", Some(e.to_string())),
                };

                match self.handler.list_tools(params).await {
                    Ok(res) => to_response(req.id, &res),
                    Err(e) => Self::error(req.id, -32603, "internal error", Some(e.to_string())),
                }
            }
            "tools/call" => {
                if self.state() != ConnState::Active {
                    return Self::error(req.id, -32002, "not initialized", None);
                }
                let Some(v) = req.params else {
                    return Self::error(
                        req.id,
                        -32602,
                        "invalid params",
                        Some("missing params".to_string()),
                    );
                };
                let params = match serde_json::from_value::<CallToolParams>(v) {
                    Ok(p) => p,
                    Err(e) => return Self::error(req.id, -32602, "invalid params", Some(e.to_string())),
                };

                match self.handler.call_tool(params).await {
                    Ok(res) => to_response(req.id, &res),
                    Err(e) => Self::error(req.id, -32603, "internal error", Some(e.to_string())),
                }
            }
            _ => Self::error(req.id, -32601, "method not found", None),
        }
    }

    fn handle_initialize(&self, req: JsonRpcRequest) -> JsonRpcResponse {
        if self.state() != ConnState::Uninitialized {
            return Self::error(req.id, -32600, "already initialized", None);
        }

        let Some(params) = req.params else {
            return Self::error(
                req.id,
                -32602,
                "invalid params",
                Some("missing params".to_string()),
            );
        };

        let init: InitializeParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return Self::error(req.id, -32602, "invalid params", Some(e.to_string())),
        };

        let negotiated = self.cfg.negotiate_protocol(&init.protocol_version);
        debug!(
            client = %init.client_info.name,
            requested = %init.protocol_version,
            negotiated = %negotiated,
            "mcp initialize"
        );
        {
            // Re-checked under the lock: two racing initializes must not both win.
            let mut lc = self.lifecycle();
            if lc.state != ConnState::Uninitialized {
                return Self::error(req.id, -32600, "already initialized", None);
            }
            lc.protocol_version = Some(negotiated.clone());
            lc.state = ConnState::Active;
        }

        let result = InitializeResult {
            protocol_version: negotiated,
            capabilities: self.cfg.capabilities.clone(),
            server_info: self.cfg.server_info.clone(),
            instructions: self.cfg.instructions.clone(),
        };

        to_response(req.id, &result)
    }

    fn handle_notification(&self, n: JsonRpcNotification) {
        if n.jsonrpc != "2.0" {
            return;
        }
        // `notifications/initialized` carries no state change: a session is
        // active as soon as initialize has been answered.
        debug!(method = %n.method, "mcp notification");
    }
}

fn to_response<T: serde::Serialize>(id: JsonRpcId, value: &T) -> JsonRpcResponse {
    JsonRpcResponse::ok(id, serde_json::to_value(value).unwrap_or(Value::Null))
}
