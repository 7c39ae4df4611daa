//! Wire protocol types (JSON-RPC 2.0 based).
//!
//! Every transport exchanges the same envelope. A message carrying an `id`
//! and a `result` or `error` is a response; a message carrying a `method` is
//! a request (with `id`) or a notification (without one, no reply expected).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Standard JSON-RPC error codes plus the implementation-defined range used
/// for transport, auth and timeout failures.
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    // Implementation-defined range (-32000..-32099).
    pub const SERVER_ERROR: i32 = -32000;
    pub const REQUEST_TIMEOUT: i32 = -32001;
    pub const AUTH_FAILED: i32 = -32002;
    pub const TRANSPORT_ERROR: i32 = -32003;
}

/// Standard method names understood by capability servers.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const TOOLS_CHANGED: &str = "notifications/tools/list_changed";
}

/// Correlation token for a request (string or number on the wire).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: id.into(),
            method: method.into(),
            params: None,
        }
    }

    pub fn with_params(mut self, params: impl Serialize) -> Self {
        self.params = Some(serde_json::to_value(params).unwrap_or(Value::Null));
        self
    }
}

/// JSON-RPC 2.0 notification (a request without an id; no reply expected).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    pub id: RequestId,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Returns the result if successful, or the protocol error.
    ///
    /// A missing `result` on a non-error response is treated as `null`;
    /// some servers omit it for void methods.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for JsonRpcError {}

/// A decoded inbound frame, classified per the envelope rules.
#[derive(Debug, Clone)]
pub enum Incoming {
    Response(JsonRpcResponse),
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

impl Incoming {
    /// Classify a raw frame. `id` + (`result` | `error`) is a response;
    /// `method` with an `id` is a server-initiated request; `method` without
    /// one is a notification.
    pub fn classify(value: Value) -> Result<Self, crate::Error> {
        let is_reply = value.get("result").is_some() || value.get("error").is_some();
        if is_reply && value.get("id").is_some() {
            let response: JsonRpcResponse = serde_json::from_value(value)?;
            return Ok(Self::Response(response));
        }

        let Some(method) = value.get("method").and_then(Value::as_str) else {
            return Err(crate::Error::InvalidResponse(
                "frame has neither method nor result/error".to_string(),
            ));
        };
        let method = method.to_string();
        let params = value.get("params").cloned();

        match value.get("id") {
            Some(id) => {
                let id: RequestId = serde_json::from_value(id.clone())?;
                Ok(Self::Request { id, method, params })
            }
            None => Ok(Self::Notification { method, params }),
        }
    }
}

// --- Capability server payloads ---

/// Params for the `initialize` request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub client_info: ClientInfo,
}

impl Default for InitializeParams {
    fn default() -> Self {
        Self {
            protocol_version: "2024-11-05".to_string(),
            client_info: ClientInfo {
                name: "capstan".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// Result of the `initialize` request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub protocol_version: Option<String>,
    pub server_info: ServerInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// Filesystem access level a tool declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemAccess {
    #[default]
    None,
    Read,
    Write,
}

/// Permission block of a capability definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolPermissions {
    #[serde(default)]
    pub filesystem: FilesystemAccess,
    #[serde(default)]
    pub network: bool,
    #[serde(default)]
    pub shell: bool,
}

/// A capability definition advertised by a server (`tools/list`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub input_schema: Value,
    #[serde(default)]
    pub permissions: Option<ToolPermissions>,
    /// One of `never`, `always`, `destructive-only`, `adaptive`.
    #[serde(default)]
    pub confirmation: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Result of `tools/list`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<ToolDef>,
}

/// Params for `tools/call`.
#[derive(Debug, Clone, Serialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

/// One content item of a `tools/call` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text { text: String },
    Json { json: Value },
}

impl ToolContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::Json { .. } => None,
        }
    }
}

/// Result of `tools/call`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

/// Extra headers attached by transports (used for auth handles).
pub type HeaderMap = HashMap<String, String>;
