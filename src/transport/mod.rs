//! Transport adapters
//!
//! One adapter per wire protocol a backend can speak: stdio child
//! process, SSE, streamable HTTP, WebSocket. Every adapter exposes the
//! same contract (connect, request, notify, close, state) so the
//! service connection above it never cares which wire it is on.
//!
//! State machine: `Disconnected → Connecting → Connected`; any
//! transport-level error or close forces `Disconnected`. Adapters never
//! retry themselves; retry policy lives in the lifecycle orchestrator.

pub mod http;
pub mod sse;
pub mod stdio;
pub mod websocket;

use crate::config::BackendConfig;
use crate::error::Result;
use crate::protocol::JsonRpcResponse;
use crate::types::TransportKind;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

/// Adapter-level connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
}

/// Shared, lock-free state cell for one adapter.
///
/// Reader tasks flip this to `Disconnected` on stream close while the
/// owning connection may be reading it concurrently.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> Arc<Self> {
        Arc::new(Self(AtomicU8::new(0)))
    }

    pub fn set(&self, state: TransportState) {
        let v = match state {
            TransportState::Disconnected => 0,
            TransportState::Connecting => 1,
            TransportState::Connected => 2,
        };
        self.0.store(v, Ordering::SeqCst);
    }

    pub fn get(&self) -> TransportState {
        match self.0.load(Ordering::SeqCst) {
            1 => TransportState::Connecting,
            2 => TransportState::Connected,
            _ => TransportState::Disconnected,
        }
    }
}

/// Requests in flight on one adapter, keyed by the JSON-RPC id the
/// adapter generated for them.
pub(crate) type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// Route one inbound message to the pending request it answers.
///
/// Payloads that are not JSON-RPC responses (server-side notifications,
/// stray output) are logged at debug and skipped.
pub(crate) async fn route_response(backend: &str, payload: &str, pending: &PendingMap) {
    let trimmed = payload.trim();
    if trimmed.is_empty() {
        return;
    }

    match serde_json::from_str::<JsonRpcResponse>(trimmed) {
        Ok(response) if response.result.is_some() || response.error.is_some() => {
            let Some(id) = response.id.as_u64() else {
                debug!(backend, "response with non-numeric id, dropping");
                return;
            };
            let sender = pending.lock().await.remove(&id);
            match sender {
                Some(tx) => {
                    let _ = tx.send(response);
                }
                None => debug!(backend, id, "response for unknown request id"),
            }
        }
        _ => {
            debug!(backend, payload = trimmed, "non-response message from backend");
        }
    }
}

/// Uniform contract over one logical connection to one backend.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the underlying channel. Idempotent on an already-open
    /// adapter is not required; the connection closes before reconnecting.
    async fn connect(&mut self) -> Result<()>;

    /// Send a request and wait for the matching response.
    ///
    /// No timeout is applied here; the service connection wraps every
    /// call with the backend's configured deadline.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse>;

    /// Send a notification (no response expected).
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;

    /// Tear down the channel. Must be idempotent.
    async fn close(&mut self) -> Result<()>;

    /// Current adapter state.
    fn state(&self) -> TransportState;
}

/// Build the adapter matching a backend's configured transport kind.
pub fn build(config: &BackendConfig) -> Box<dyn Transport> {
    match config.transport {
        TransportKind::Stdio => Box::new(stdio::StdioTransport::new(config)),
        TransportKind::Sse => Box::new(sse::SseTransport::new(config)),
        TransportKind::StreamableHttp => Box::new(http::StreamableHttpTransport::new(config)),
        TransportKind::WebSocket => Box::new(websocket::WebSocketTransport::new(config)),
    }
}
