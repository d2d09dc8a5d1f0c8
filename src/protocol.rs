//! JSON-RPC 2.0 protocol implementation
//!
//! Defines the core protocol types for MCP communication across all
//! transports, plus protocol-version negotiation for the `initialize`
//! handshake.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol versions this gateway speaks, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// Version offered to clients whose requested version we do not know.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2025-03-26";

/// Negotiate a protocol version with a client or backend.
///
/// The peer's version is accepted verbatim when it is in the supported
/// set; anything else falls back to [`DEFAULT_PROTOCOL_VERSION`].
pub fn negotiate_version(requested: Option<&str>) -> &'static str {
    match requested {
        Some(v) => SUPPORTED_PROTOCOL_VERSIONS
            .iter()
            .find(|s| **s == v)
            .copied()
            .unwrap_or(DEFAULT_PROTOCOL_VERSION),
        None => DEFAULT_PROTOCOL_VERSION,
    }
}

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (must be "2.0")
    pub jsonrpc: String,

    /// Method name to invoke
    pub method: String,

    /// Parameters (object when present)
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,

    /// Request ID (absent for notifications)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a request with an id.
    pub fn new(id: impl Into<Value>, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params: params.unwrap_or(Value::Null),
            id: Some(id.into()),
        }
    }

    /// Create a notification (no id, no response expected).
    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params: params.unwrap_or(Value::Null),
            id: None,
        }
    }

    /// Whether this message is a notification.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC 2.0 response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (must be "2.0")
    pub jsonrpc: String,

    /// Result (present if successful)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error (present if failed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,

    /// Request ID (echoed from request; null when the request id was
    /// unrecoverable, e.g. a parse error)
    pub id: Value,
}

impl JsonRpcResponse {
    /// Create a success response
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Create an error response
    pub fn error(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code
    pub code: i64,

    /// Error message
    pub message: String,

    /// Additional error data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Parse error (-32700)
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self {
            code: -32700,
            message: message.into(),
            data: None,
        }
    }

    /// Invalid request (-32600)
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: -32600,
            message: message.into(),
            data: None,
        }
    }

    /// Method not found (-32601)
    pub fn method_not_found(method: impl Into<String>) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {}", method.into()),
            data: None,
        }
    }

    /// Invalid params (-32602)
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
            data: None,
        }
    }

    /// Internal error (-32603)
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self {
            code: -32603,
            message: message.into(),
            data: None,
        }
    }

    /// Application error (custom code)
    pub fn application_error(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// Structural validation of an already-parsed JSON-RPC message.
///
/// Checks the shape rules the dispatcher relies on: version marker,
/// method string, id type, params type. Returns the error to embed in
/// the response when the message is malformed.
pub fn validate_request(raw: &Value) -> std::result::Result<JsonRpcRequest, JsonRpcError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| JsonRpcError::invalid_request("message must be a JSON object"))?;

    match obj.get("jsonrpc").and_then(Value::as_str) {
        Some("2.0") => {}
        _ => return Err(JsonRpcError::invalid_request("jsonrpc must be '2.0'")),
    }

    if !obj.get("method").map(Value::is_string).unwrap_or(false) {
        return Err(JsonRpcError::invalid_request(
            "method must be present and a string",
        ));
    }

    if let Some(id) = obj.get("id") {
        if !(id.is_string() || id.is_number() || id.is_null()) {
            return Err(JsonRpcError::invalid_request(
                "id must be a string, a number, or absent",
            ));
        }
    }

    if let Some(params) = obj.get("params") {
        if !(params.is_object() || params.is_null()) {
            return Err(JsonRpcError::invalid_request("params must be an object"));
        }
    }

    serde_json::from_value(raw.clone())
        .map_err(|e| JsonRpcError::invalid_request(format!("malformed request: {e}")))
}

// ─── MCP payload types ──────────────────────────────────────────────────────

/// MCP `initialize` result payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(rename = "serverInfo", default)]
    pub server_info: Option<ServerInfo>,
}

/// Server identity advertised during the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// MCP `tools/list` result payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<crate::types::ToolDescriptor>,
}
