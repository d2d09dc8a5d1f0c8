//! HTTP server for the inbound JSON-RPC endpoint
//!
//! One POST path carries the whole MCP surface. Notifications yield an
//! empty 204; parse and invalid-request failures map to 400; every
//! other error is a JSON-RPC error payload on a 200, because it is
//! protocol traffic, not an HTTP failure. Oversized payloads are
//! rejected with a JSON-RPC error before any parsing happens.

use crate::gateway::Gateway;
use crate::handler::ProtocolHandler;
use crate::protocol::{JsonRpcError, JsonRpcResponse, DEFAULT_PROTOCOL_VERSION};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info};

/// Protocol-version header exchanged with front clients.
const PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Server address
    pub addr: SocketAddr,
    /// Payloads above this many bytes are rejected before parsing
    pub max_body_bytes: usize,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            addr: ([127, 0, 0, 1], 3930).into(),
            max_body_bytes: crate::config::DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// API server state
#[derive(Clone)]
struct AppState {
    gateway: Arc<Gateway>,
    handler: Arc<ProtocolHandler>,
    max_body_bytes: usize,
}

/// API server
pub struct ApiServer {
    config: ApiServerConfig,
    gateway: Arc<Gateway>,
}

impl ApiServer {
    /// Create new API server over a running gateway
    pub fn new(config: ApiServerConfig, gateway: Arc<Gateway>) -> Self {
        Self { config, gateway }
    }

    /// Build router
    fn build_router(state: AppState) -> Router {
        Router::new()
            .route("/mcp", post(mcp_handler))
            .route("/health", get(health_handler))
            .with_state(state)
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
    }

    /// Start serving. Runs until the listener fails.
    pub async fn serve(self) -> anyhow::Result<()> {
        let state = AppState {
            handler: Arc::new(ProtocolHandler::new(self.gateway.registry())),
            gateway: self.gateway,
            max_body_bytes: self.config.max_body_bytes,
        };

        let router = Self::build_router(state);

        let listener = tokio::net::TcpListener::bind(self.config.addr).await?;
        info!("JSON-RPC endpoint listening on http://{}/mcp", self.config.addr);
        axum::serve(listener, router).await?;
        Ok(())
    }
}

/// The single JSON-RPC endpoint.
async fn mcp_handler(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    // Size gate runs before any parsing
    if body.len() > state.max_body_bytes {
        let response = JsonRpcResponse::error(
            Value::Null,
            JsonRpcError::invalid_request(format!(
                "payload of {} bytes exceeds limit of {} bytes",
                body.len(),
                state.max_body_bytes
            )),
        );
        return rpc_response(StatusCode::BAD_REQUEST, &headers, Some(response));
    }

    let raw = match std::str::from_utf8(&body) {
        Ok(raw) => raw,
        Err(_) => {
            let response = JsonRpcResponse::error(
                Value::Null,
                JsonRpcError::parse_error("body is not valid UTF-8"),
            );
            return rpc_response(StatusCode::BAD_REQUEST, &headers, Some(response));
        }
    };

    debug!(bytes = body.len(), "inbound JSON-RPC message");

    match state.handler.handle(raw).await {
        // Notification: no body at all
        None => rpc_response(StatusCode::NO_CONTENT, &headers, None),
        Some(response) => {
            let status = match response.error.as_ref().map(|e| e.code) {
                Some(-32700) | Some(-32600) => StatusCode::BAD_REQUEST,
                _ => StatusCode::OK,
            };
            rpc_response(status, &headers, Some(response))
        }
    }
}

/// Attach the negotiated protocol-version response header.
fn rpc_response(
    status: StatusCode,
    request_headers: &HeaderMap,
    body: Option<JsonRpcResponse>,
) -> Response {
    let version = request_headers
        .get(PROTOCOL_VERSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| crate::protocol::negotiate_version(Some(v)))
        .unwrap_or(DEFAULT_PROTOCOL_VERSION);

    let mut response = match body {
        Some(body) => (status, Json(body)).into_response(),
        None => status.into_response(),
    };
    if let Ok(value) = version.parse() {
        response
            .headers_mut()
            .insert(PROTOCOL_VERSION_HEADER, value);
    }
    response
}

/// Health check handler
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    backends: usize,
    connected: usize,
    tools: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let statuses = state.gateway.connection_status().await;
    let connected = statuses
        .iter()
        .filter(|s| s.state == crate::types::ConnectionState::Connected)
        .count();

    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        backends: statuses.len(),
        connected,
        tools: state.gateway.all_tools().await.len(),
    })
}
