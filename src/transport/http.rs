//! Streamable-HTTP transport: JSON-RPC over plain HTTP POSTs
//!
//! Each message is POSTed to the backend's URL. The server may answer
//! with a JSON body or a single-response SSE body; both are handled.
//! A server-assigned `Mcp-Session-Id` is captured after `initialize`
//! and echoed on every subsequent message.

use crate::config::BackendConfig;
use crate::error::{GatewayError, Result};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::transport::{StateCell, Transport, TransportState};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

const SESSION_HEADER: &str = "Mcp-Session-Id";

/// JSON-RPC transport over per-message HTTP POSTs.
pub struct StreamableHttpTransport {
    name: String,
    url: String,
    headers: HashMap<String, String>,
    api_key: Option<String>,

    state: Arc<StateCell>,
    next_id: AtomicU64,
    http: reqwest::Client,
    session_id: Arc<RwLock<Option<String>>>,
}

impl StreamableHttpTransport {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            name: config.name.clone(),
            url: config.url.clone().unwrap_or_default(),
            headers: config.headers.clone(),
            api_key: config.api_key.clone(),
            state: StateCell::new(),
            next_id: AtomicU64::new(1),
            http: reqwest::Client::new(),
            session_id: Arc::new(RwLock::new(None)),
        }
    }

    fn transport_err(&self, reason: impl Into<String>) -> GatewayError {
        GatewayError::Transport {
            backend: self.name.clone(),
            reason: reason.into(),
        }
    }

    async fn post(&self, body: &JsonRpcRequest) -> Result<reqwest::Response> {
        let mut post = self
            .http
            .post(&self.url)
            .header("Accept", "application/json, text/event-stream")
            .json(body);

        for (name, value) in &self.headers {
            post = post.header(name, value);
        }
        if let Some(key) = &self.api_key {
            if !self.headers.contains_key("Authorization") {
                post = post.header("Authorization", format!("Bearer {key}"));
            }
        }
        if let Some(session) = self.session_id.read().await.clone() {
            post = post.header(SESSION_HEADER, session);
        }

        let response = post
            .send()
            .await
            .map_err(|e| self.transport_err(format!("POST failed: {e}")))?;

        if !response.status().is_success() {
            return Err(self.transport_err(format!("HTTP {}", response.status())));
        }

        // Capture or refresh the session id the server assigned
        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut guard = self.session_id.write().await;
            if guard.as_deref() != Some(session) {
                debug!(backend = %self.name, session, "captured session id");
                *guard = Some(session.to_string());
            }
        }

        Ok(response)
    }
}

/// Extract the JSON payload from a response body that may be plain JSON
/// or a single-response SSE stream (`data: {...}` lines).
fn extract_json_payload(body: &str) -> Option<&str> {
    let trimmed = body.trim();
    if trimmed.starts_with('{') {
        return Some(trimmed);
    }
    trimmed
        .lines()
        .find_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn connect(&mut self) -> Result<()> {
        // No persistent channel to open; validate the URL and go live.
        self.state.set(TransportState::Connecting);
        reqwest::Url::parse(&self.url).map_err(|e| {
            self.state.set(TransportState::Disconnected);
            self.transport_err(format!("invalid url: {e}"))
        })?;
        self.state.set(TransportState::Connected);
        Ok(())
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        if self.state.get() != TransportState::Connected {
            return Err(self.transport_err("not connected"));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);

        let response = self.post(&request).await?;
        let body = response
            .text()
            .await
            .map_err(|e| self.transport_err(format!("failed to read body: {e}")))?;

        let payload = extract_json_payload(&body)
            .ok_or_else(|| self.transport_err("empty response body"))?;

        serde_json::from_str(payload)
            .map_err(|e| self.transport_err(format!("invalid response JSON: {e}")))
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        if self.state.get() != TransportState::Connected {
            return Err(self.transport_err("not connected"));
        }
        let note = JsonRpcRequest::notification(method, params);
        self.post(&note).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // Best-effort session teardown, then forget the session.
        let session = self.session_id.write().await.take();
        if let Some(session) = session {
            let _ = self
                .http
                .delete(&self.url)
                .header(SESSION_HEADER, session)
                .send()
                .await;
        }
        self.state.set(TransportState::Disconnected);
        Ok(())
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_config(url: &str) -> BackendConfig {
        BackendConfig::from_raw(
            "remote",
            serde_json::from_value(serde_json::json!({"url": url})).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_extract_plain_json() {
        let body = r#"{"jsonrpc":"2.0","id":1,"result":{}}"#;
        assert_eq!(extract_json_payload(body), Some(body));
    }

    #[test]
    fn test_extract_sse_framed_json() {
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n\n";
        assert_eq!(
            extract_json_payload(body),
            Some(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#)
        );
    }

    #[test]
    fn test_extract_empty_body() {
        assert_eq!(extract_json_payload(""), None);
        assert_eq!(extract_json_payload("event: ping\n\n"), None);
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let mut t = StreamableHttpTransport::new(&http_config("https://example.com/mcp"));
        t.url = "not a url".to_string();
        let err = t.connect().await.unwrap_err();
        assert!(matches!(err, GatewayError::Transport { .. }));
        assert_eq!(t.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_then_close() {
        let mut t = StreamableHttpTransport::new(&http_config("https://example.com/mcp"));
        t.connect().await.unwrap();
        assert_eq!(t.state(), TransportState::Connected);
        t.close().await.unwrap();
        t.close().await.unwrap();
        assert_eq!(t.state(), TransportState::Disconnected);
    }
}
