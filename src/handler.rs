//! JSON-RPC message handler
//!
//! Stateless dispatcher over one message at a time: validates the
//! envelope, routes `initialize` / `tools/list` / `tools/call` / `ping`
//! against the service registry, and maps every failure onto the
//! standard JSON-RPC error codes. Valid notifications never produce a
//! response; unknown notification methods are logged and dropped.

use crate::protocol::{
    negotiate_version, validate_request, JsonRpcError, JsonRpcRequest, JsonRpcResponse,
};
use crate::registry::ServiceRegistry;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// Stateless JSON-RPC dispatcher for the gateway's front surface.
pub struct ProtocolHandler {
    registry: Arc<ServiceRegistry>,
}

impl ProtocolHandler {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self { registry }
    }

    /// Process one raw JSON-RPC message.
    ///
    /// Returns `None` when no response must be sent (notifications).
    /// Error responses carry the inbound id when one was recoverable,
    /// null otherwise.
    pub async fn handle(&self, raw: &str) -> Option<JsonRpcResponse> {
        let parsed: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                return Some(JsonRpcResponse::error(
                    Value::Null,
                    JsonRpcError::parse_error(format!("Invalid JSON: {e}")),
                ));
            }
        };

        let request = match validate_request(&parsed) {
            Ok(request) => request,
            Err(error) => {
                return Some(JsonRpcResponse::error(recover_id(&parsed), error));
            }
        };

        self.dispatch(request).await
    }

    /// Route a validated request to its handler.
    async fn dispatch(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let is_notification = request.is_notification();
        let id = request.id.clone().unwrap_or(Value::Null);

        let response = match request.method.as_str() {
            "initialize" => self.handle_initialize(id, &request.params),
            "notifications/initialized" => {
                debug!("front client initialized");
                return None;
            }
            "tools/list" => self.handle_tools_list(id).await,
            "tools/call" => self.handle_tools_call(id, &request.params).await,
            "ping" => JsonRpcResponse::success(id, json!({})),

            // Resources and prompts are advertised but empty: the
            // gateway aggregates tools only.
            "resources/list" => JsonRpcResponse::success(id, json!({ "resources": [] })),
            "prompts/list" => JsonRpcResponse::success(id, json!({ "prompts": [] })),

            method => {
                if is_notification {
                    debug!(method, "unknown notification, dropping");
                    return None;
                }
                JsonRpcResponse::error(id, JsonRpcError::method_not_found(method))
            }
        };

        if is_notification {
            // A notification to a known method is acknowledged by silence
            return None;
        }
        Some(response)
    }

    fn handle_initialize(&self, id: Value, params: &Value) -> JsonRpcResponse {
        let requested = params.get("protocolVersion").and_then(Value::as_str);
        let negotiated = negotiate_version(requested);
        debug!(requested, negotiated, "protocol version negotiation");

        JsonRpcResponse::success(
            id,
            json!({
                "protocolVersion": negotiated,
                "capabilities": {
                    "tools": { "listChanged": true },
                    "resources": {},
                    "prompts": {},
                },
                "serverInfo": {
                    "name": "switchboard",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        )
    }

    async fn handle_tools_list(&self, id: Value) -> JsonRpcResponse {
        let tools: Vec<_> = self
            .registry
            .all_tools()
            .await
            .iter()
            .map(|tool| tool.to_wire())
            .collect();

        JsonRpcResponse::success(id, json!({ "tools": tools }))
    }

    async fn handle_tools_call(&self, id: Value, params: &Value) -> JsonRpcResponse {
        let Some(params) = params.as_object() else {
            return JsonRpcResponse::error(id, JsonRpcError::invalid_params("params must be an object"));
        };

        let name = match params.get("name").and_then(Value::as_str) {
            Some(name) if !name.is_empty() => name,
            _ => {
                return JsonRpcResponse::error(
                    id,
                    JsonRpcError::invalid_params("missing or empty 'name' field"),
                );
            }
        };

        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or(Value::Object(serde_json::Map::new()));

        match self.registry.call_tool(name, arguments).await {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(e) => JsonRpcResponse::error(
                id,
                JsonRpcError::application_error(e.to_rpc_code(), e.to_string()),
            ),
        }
    }
}

/// Best-effort id extraction from a message that failed validation.
fn recover_id(raw: &Value) -> Value {
    match raw.get("id") {
        Some(id) if id.is_string() || id.is_number() => id.clone(),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::connection::ServiceConnection;
    use crate::error::Result;
    use crate::events::NullSink;
    use crate::protocol::ToolsListResult;
    use crate::transport::{Transport, TransportState};
    use crate::types::ToolDescriptor;
    use async_trait::async_trait;

    struct FakeTransport {
        connected: bool,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn connect(&mut self) -> Result<()> {
            self.connected = true;
            Ok(())
        }

        async fn request(&self, method: &str, _params: Option<Value>) -> Result<JsonRpcResponse> {
            let result = match method {
                "initialize" => json!({"protocolVersion": "2025-03-26", "capabilities": {}}),
                "tools/list" => serde_json::to_value(ToolsListResult {
                    tools: vec![ToolDescriptor {
                        name: "now".to_string(),
                        description: "Current time".to_string(),
                        input_schema: json!({"type": "object"}),
                    }],
                })
                .unwrap(),
                "tools/call" => json!({"content": [{"type": "text", "text": "12:00"}]}),
                _ => json!({}),
            };
            Ok(JsonRpcResponse::success(json!(1), result))
        }

        async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<()> {
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            self.connected = false;
            Ok(())
        }

        fn state(&self) -> TransportState {
            if self.connected {
                TransportState::Connected
            } else {
                TransportState::Disconnected
            }
        }
    }

    async fn handler_with_time_backend() -> ProtocolHandler {
        let registry = Arc::new(ServiceRegistry::new(Arc::new(NullSink)));
        let connection = Arc::new(ServiceConnection::with_transport(
            BackendConfig::stdio("time", "unused", &[]),
            Box::new(FakeTransport { connected: false }),
        ));
        connection.connect().await.unwrap();
        registry.add_service(connection).await.unwrap();
        registry.rebuild_catalog().await;
        ProtocolHandler::new(registry)
    }

    #[tokio::test]
    async fn test_tools_list_returns_prefixed_names() {
        let handler = handler_with_time_backend().await;

        let response = handler
            .handle(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#)
            .await
            .unwrap();

        let tools = &response.result.unwrap()["tools"];
        assert_eq!(tools[0]["name"], "time:now");
    }

    #[tokio::test]
    async fn test_missing_jsonrpc_is_invalid_request() {
        let handler = handler_with_time_backend().await;

        let response = handler.handle(r#"{"id":1,"method":"tools/list"}"#).await.unwrap();
        assert_eq!(response.error.as_ref().unwrap().code, -32600);
        assert_eq!(response.id, json!(1));
    }

    #[tokio::test]
    async fn test_notification_gets_no_response() {
        let handler = handler_with_time_backend().await;

        let response = handler.handle(r#"{"jsonrpc":"2.0","method":"ping"}"#).await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn test_unknown_notification_dropped_silently() {
        let handler = handler_with_time_backend().await;

        let response = handler
            .handle(r#"{"jsonrpc":"2.0","method":"wibble/wobble"}"#)
            .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn test_unknown_request_method_not_found() {
        let handler = handler_with_time_backend().await;

        let response = handler
            .handle(r#"{"jsonrpc":"2.0","id":7,"method":"wibble/wobble"}"#)
            .await
            .unwrap();
        assert_eq!(response.error.as_ref().unwrap().code, -32601);
        assert_eq!(response.id, json!(7));
    }

    #[tokio::test]
    async fn test_parse_error_synthesizes_null_id() {
        let handler = handler_with_time_backend().await;

        let response = handler.handle("{not json").await.unwrap();
        assert_eq!(response.error.as_ref().unwrap().code, -32700);
        assert_eq!(response.id, Value::Null);
    }

    #[tokio::test]
    async fn test_initialize_negotiates_version() {
        let handler = handler_with_time_backend().await;

        let response = handler
            .handle(
                r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05"}}"#,
            )
            .await
            .unwrap();

        let result = response.result.unwrap();
        assert_eq!(result["protocolVersion"], "2024-11-05");
        assert_eq!(result["serverInfo"]["name"], "switchboard");
    }

    #[tokio::test]
    async fn test_initialize_unknown_version_falls_back() {
        let handler = handler_with_time_backend().await;

        let response = handler
            .handle(
                r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"1066-10-14"}}"#,
            )
            .await
            .unwrap();

        assert_eq!(
            response.result.unwrap()["protocolVersion"],
            crate::protocol::DEFAULT_PROTOCOL_VERSION
        );
    }

    #[tokio::test]
    async fn test_tools_call_requires_name() {
        let handler = handler_with_time_backend().await;

        let response = handler
            .handle(r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{}}"#)
            .await
            .unwrap();
        assert_eq!(response.error.as_ref().unwrap().code, -32602);

        let response = handler
            .handle(r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":""}}"#)
            .await
            .unwrap();
        assert_eq!(response.error.as_ref().unwrap().code, -32602);
    }

    #[tokio::test]
    async fn test_tools_call_routes_to_backend() {
        let handler = handler_with_time_backend().await;

        let response = handler
            .handle(
                r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"time:now","arguments":{}}}"#,
            )
            .await
            .unwrap();

        assert!(response.error.is_none());
        assert_eq!(response.result.unwrap()["content"][0]["text"], "12:00");
    }

    #[tokio::test]
    async fn test_tools_call_unknown_tool() {
        let handler = handler_with_time_backend().await;

        let response = handler
            .handle(
                r#"{"jsonrpc":"2.0","id":5,"method":"tools/call","params":{"name":"ghost:tool"}}"#,
            )
            .await
            .unwrap();
        assert_eq!(response.error.as_ref().unwrap().code, -32002);
    }

    #[tokio::test]
    async fn test_ping_echoes() {
        let handler = handler_with_time_backend().await;

        let response = handler
            .handle(r#"{"jsonrpc":"2.0","id":9,"method":"ping"}"#)
            .await
            .unwrap();
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn test_resources_and_prompts_are_stubs() {
        let handler = handler_with_time_backend().await;

        let response = handler
            .handle(r#"{"jsonrpc":"2.0","id":1,"method":"resources/list"}"#)
            .await
            .unwrap();
        assert_eq!(response.result.unwrap()["resources"], json!([]));

        let response = handler
            .handle(r#"{"jsonrpc":"2.0","id":2,"method":"prompts/list"}"#)
            .await
            .unwrap();
        assert_eq!(response.result.unwrap()["prompts"], json!([]));
    }
}
