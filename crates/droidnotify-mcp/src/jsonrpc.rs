use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcId {
    Number(i64),
    String(String),
    Null,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: JsonRpcId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: JsonRpcId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: JsonRpcId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn ok(id: JsonRpcId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: JsonRpcId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn parse_error(detail: impl Into<String>) -> Self {
        Self::err(
            JsonRpcId::Null,
            JsonRpcError {
                code: -32700,
                message: "parse error".to_string(),
                data: Some(serde_json::json!({ "detail": detail.into() })),
            },
        )
    }

    pub fn invalid_request(detail: Option<String>, message: &str) -> Self {
        Self::err(
            JsonRpcId::Null,
            JsonRpcError {
                code: -32600,
                message: message.to_string(),
                data: detail.map(|d| serde_json::json!({ "detail": d })),
            },
        )
    }
}

/// Any JSON-RPC message, classified by which members are present.
///
/// `method` + `id` is a request, `method` alone a notification, and an `id`
/// with `result` or `error` a response.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
}

impl<'de> Deserialize<'de> for JsonRpcMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = Value::deserialize(deserializer)?;
        let Some(obj) = v.as_object() else {
            return Err(D::Error::custom("json-rpc message must be an object"));
        };

        let has_method = obj.contains_key("method");
        let has_id = obj.contains_key("id");
        let is_response = obj.contains_key("result") || obj.contains_key("error");

        if has_method && has_id {
            serde_json::from_value(v)
                .map(JsonRpcMessage::Request)
                .map_err(D::Error::custom)
        } else if has_method {
            serde_json::from_value(v)
                .map(JsonRpcMessage::Notification)
                .map_err(D::Error::custom)
        } else if has_id && is_response {
            serde_json::from_value(v)
                .map(JsonRpcMessage::Response)
                .map_err(D::Error::custom)
        } else {
            Err(D::Error::custom("not a json-rpc request, notification or response"))
        }
    }
}

impl From<JsonRpcResponse> for JsonRpcMessage {
    fn from(r: JsonRpcResponse) -> Self {
        JsonRpcMessage::Response(r)
    }
}

impl From<JsonRpcNotification> for JsonRpcMessage {
    fn from(n: JsonRpcNotification) -> Self {
        JsonRpcMessage::Notification(n)
    }
}

/// Parse one line/body of transport input into a single message.
///
/// On failure returns the JSON-RPC error response the transport should send
/// back (parse error, batch rejection, or invalid request).
pub fn parse_message(raw: &str) -> Result<JsonRpcMessage, JsonRpcResponse> {
    let val: Value =
        serde_json::from_str(raw).map_err(|e| JsonRpcResponse::parse_error(e.to_string()))?;

    if val.is_array() {
        return Err(JsonRpcResponse::invalid_request(
            None,
            "batching not supported",
        ));
    }

    serde_json::from_value(val)
        .map_err(|e| JsonRpcResponse::invalid_request(Some(e.to_string()), "invalid request"))
}
