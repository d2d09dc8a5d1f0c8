//! WebSocket transport: JSON-RPC over a persistent socket
//!
//! One text frame per JSON-RPC message. A reader task routes inbound
//! frames to pending requests; close and error frames tear the
//! connection down to `Disconnected`.

use crate::config::BackendConfig;
use crate::error::{GatewayError, Result};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::transport::{route_response, PendingMap, StateCell, Transport, TransportState};
use async_trait::async_trait;
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// JSON-RPC transport over a WebSocket connection.
pub struct WebSocketTransport {
    name: String,
    url: String,
    headers: HashMap<String, String>,
    api_key: Option<String>,

    state: Arc<StateCell>,
    next_id: AtomicU64,
    pending: PendingMap,

    writer: Arc<Mutex<Option<WsSink>>>,
    reader_task: Option<tokio::task::JoinHandle<()>>,
}

impl WebSocketTransport {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            name: config.name.clone(),
            url: config.url.clone().unwrap_or_default(),
            headers: config.headers.clone(),
            api_key: config.api_key.clone(),
            state: StateCell::new(),
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            writer: Arc::new(Mutex::new(None)),
            reader_task: None,
        }
    }

    fn transport_err(&self, reason: impl Into<String>) -> GatewayError {
        GatewayError::Transport {
            backend: self.name.clone(),
            reason: reason.into(),
        }
    }

    async fn send_frame(&self, payload: String) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| self.transport_err("socket not open"))?;
        sink.send(Message::Text(payload))
            .await
            .map_err(|e| self.transport_err(format!("failed to send frame: {e}")))
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&mut self) -> Result<()> {
        self.state.set(TransportState::Connecting);
        // Fresh socket, fresh id space
        self.next_id.store(1, Ordering::Relaxed);

        let mut request = self
            .url
            .clone()
            .into_client_request()
            .map_err(|e| {
                self.state.set(TransportState::Disconnected);
                GatewayError::Transport {
                    backend: self.name.clone(),
                    reason: format!("invalid websocket url: {e}"),
                }
            })?;

        {
            let headers = request.headers_mut();
            for (name, value) in &self.headers {
                if let (Ok(name), Ok(value)) = (
                    name.parse::<tokio_tungstenite::tungstenite::http::HeaderName>(),
                    value.parse(),
                ) {
                    headers.insert(name, value);
                }
            }
            if let Some(key) = &self.api_key {
                if let Ok(value) = format!("Bearer {key}").parse() {
                    headers.insert("Authorization", value);
                }
            }
        }

        let (socket, _response) = connect_async(request).await.map_err(|e| {
            self.state.set(TransportState::Disconnected);
            GatewayError::Transport {
                backend: self.name.clone(),
                reason: format!("websocket connect failed: {e}"),
            }
        })?;

        let (sink, mut stream) = socket.split();
        *self.writer.lock().await = Some(sink);

        let name = self.name.clone();
        let pending = self.pending.clone();
        let state = self.state.clone();
        self.reader_task = Some(tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => route_response(&name, &text, &pending).await,
                    Ok(Message::Binary(bytes)) => {
                        if let Ok(text) = String::from_utf8(bytes) {
                            route_response(&name, &text, &pending).await;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!(backend = %name, "websocket closed by peer");
                        break;
                    }
                    Ok(_) => {
                        // Ping/pong handled by tungstenite
                    }
                    Err(e) => {
                        warn!(backend = %name, error = %e, "websocket read error");
                        break;
                    }
                }
            }
            state.set(TransportState::Disconnected);
            pending.lock().await.clear();
        }));

        self.state.set(TransportState::Connected);
        Ok(())
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        if self.state.get() != TransportState::Connected {
            return Err(self.transport_err("not connected"));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);
        let payload = serde_json::to_string(&request)?;

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if let Err(e) = self.send_frame(payload).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        rx.await
            .map_err(|_| self.transport_err("socket closed before responding"))
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let note = JsonRpcRequest::notification(method, params);
        self.send_frame(serde_json::to_string(&note)?).await
    }

    async fn close(&mut self) -> Result<()> {
        self.state.set(TransportState::Disconnected);

        // Polite close frame, best effort
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
        }
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.pending.lock().await.clear();
        Ok(())
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }
}
