//! SSE transport: JSON-RPC over HTTP + Server-Sent Events
//!
//! Server-to-client traffic rides an SSE stream; client-to-server
//! messages are POSTed to the endpoint the server advertises in its
//! initial `endpoint` event. Bearer/API-key headers are attached when
//! configured; ModelScope-hosted backends always get an `Authorization`
//! header injected into the event-source request.

use crate::config::BackendConfig;
use crate::error::{GatewayError, Result};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::transport::{route_response, PendingMap, StateCell, Transport, TransportState};
use async_trait::async_trait;
use eventsource_client as es;
use eventsource_client::Client as _;
use futures::TryStreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

/// JSON-RPC transport over an SSE stream plus endpoint POSTs.
pub struct SseTransport {
    name: String,
    url: String,
    headers: HashMap<String, String>,
    api_key: Option<String>,

    state: Arc<StateCell>,
    next_id: AtomicU64,
    pending: PendingMap,
    http: reqwest::Client,

    /// Endpoint advertised by the server's `endpoint` event.
    endpoint_tx: watch::Sender<Option<String>>,
    endpoint_rx: watch::Receiver<Option<String>>,
    stream_task: Option<tokio::task::JoinHandle<()>>,
}

impl SseTransport {
    pub fn new(config: &BackendConfig) -> Self {
        let (endpoint_tx, endpoint_rx) = watch::channel(None);
        Self {
            name: config.name.clone(),
            url: config.url.clone().unwrap_or_default(),
            headers: config.headers.clone(),
            api_key: config.api_key.clone(),
            state: StateCell::new(),
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            http: reqwest::Client::new(),
            endpoint_tx,
            endpoint_rx,
            stream_task: None,
        }
    }

    /// Whether this backend is hosted on ModelScope, which requires the
    /// bearer token on the event-source request itself.
    fn is_modelscope(&self) -> bool {
        self.url.contains("modelscope")
    }

    fn transport_err(&self, reason: impl Into<String>) -> GatewayError {
        GatewayError::Transport {
            backend: self.name.clone(),
            reason: reason.into(),
        }
    }

    /// Resolve the endpoint event's data against the stream URL.
    fn resolve_endpoint(base: &str, data: &str) -> Option<String> {
        if data.starts_with("http://") || data.starts_with("https://") {
            return Some(data.to_string());
        }
        let base = reqwest::Url::parse(base).ok()?;
        base.join(data).ok().map(|u| u.to_string())
    }

    /// Headers attached to POSTed messages.
    fn request_headers(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(key) = &self.api_key {
            if !self.headers.contains_key("Authorization") {
                out.push(("Authorization".to_string(), format!("Bearer {key}")));
            }
        }
        out
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn connect(&mut self) -> Result<()> {
        self.state.set(TransportState::Connecting);
        self.endpoint_tx.send_replace(None);
        // Fresh stream, fresh id space
        self.next_id.store(1, Ordering::Relaxed);

        let mut builder = es::ClientBuilder::for_url(&self.url)
            .map_err(|e| self.transport_err(format!("invalid SSE url: {e}")))?;

        for (name, value) in &self.headers {
            builder = builder
                .header(name, value)
                .map_err(|e| self.transport_err(format!("invalid header '{name}': {e}")))?;
        }

        // ModelScope rejects unauthenticated event-source requests even
        // when the POST side carries the key.
        if let Some(key) = &self.api_key {
            if self.is_modelscope() || !self.headers.contains_key("Authorization") {
                builder = builder
                    .header("Authorization", &format!("Bearer {key}"))
                    .map_err(|e| self.transport_err(format!("invalid auth header: {e}")))?;
            }
        }

        // Reconnection is owned by the lifecycle orchestrator, not here.
        let client = builder
            .reconnect(es::ReconnectOptions::reconnect(false).build())
            .build();

        let name = self.name.clone();
        let base_url = self.url.clone();
        let pending = self.pending.clone();
        let state = self.state.clone();
        let endpoint_tx = self.endpoint_tx.clone();

        self.stream_task = Some(tokio::spawn(async move {
            let mut stream = Box::pin(client.stream());
            loop {
                match stream.try_next().await {
                    Ok(Some(es::SSE::Connected(_))) => {
                        debug!(backend = %name, "SSE stream connected");
                    }
                    Ok(Some(es::SSE::Event(event))) => match event.event_type.as_str() {
                        "endpoint" => {
                            match SseTransport::resolve_endpoint(&base_url, &event.data) {
                                Some(endpoint) => {
                                    debug!(backend = %name, %endpoint, "endpoint received");
                                    endpoint_tx.send_replace(Some(endpoint));
                                }
                                None => {
                                    warn!(backend = %name, data = %event.data, "unresolvable endpoint event");
                                }
                            }
                        }
                        _ => route_response(&name, &event.data, &pending).await,
                    },
                    Ok(Some(es::SSE::Comment(_))) => {
                        // Keepalive
                    }
                    Ok(None) => {
                        debug!(backend = %name, "SSE stream ended");
                        break;
                    }
                    Err(e) => {
                        warn!(backend = %name, error = %e, "SSE stream error");
                        break;
                    }
                }
            }
            state.set(TransportState::Disconnected);
            pending.lock().await.clear();
        }));

        // The handshake cannot proceed until the server tells us where
        // to POST. The caller's connect timeout bounds this wait; the
        // stream task flips the state cell if the stream dies first.
        let mut rx = self.endpoint_rx.clone();
        loop {
            if rx.borrow().is_some() {
                break;
            }
            if self.state.get() == TransportState::Disconnected {
                return Err(self.transport_err("SSE stream closed before endpoint event"));
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(self.transport_err("SSE stream closed before endpoint event"));
                    }
                }
                _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
            }
        }

        self.state.set(TransportState::Connected);
        Ok(())
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        if self.state.get() != TransportState::Connected {
            return Err(self.transport_err("not connected"));
        }

        let endpoint = self
            .endpoint_rx
            .borrow()
            .clone()
            .ok_or_else(|| self.transport_err("no endpoint received"))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let mut post = self.http.post(&endpoint).json(&request);
        for (name, value) in self.request_headers() {
            post = post.header(name, value);
        }

        let response = match post.send().await {
            Ok(r) => r,
            Err(e) => {
                self.pending.lock().await.remove(&id);
                return Err(self.transport_err(format!("endpoint POST failed: {e}")));
            }
        };

        if !response.status().is_success() {
            self.pending.lock().await.remove(&id);
            return Err(self.transport_err(format!(
                "endpoint POST returned HTTP {}",
                response.status()
            )));
        }

        // Some servers answer in the POST body, most over the stream.
        if let Ok(body) = response.text().await {
            if let Ok(direct) = serde_json::from_str::<JsonRpcResponse>(&body) {
                if direct.id.as_u64() == Some(id)
                    && (direct.result.is_some() || direct.error.is_some())
                {
                    self.pending.lock().await.remove(&id);
                    return Ok(direct);
                }
            }
        }

        rx.await
            .map_err(|_| self.transport_err("SSE stream closed before response"))
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let endpoint = self
            .endpoint_rx
            .borrow()
            .clone()
            .ok_or_else(|| self.transport_err("no endpoint received"))?;

        let note = JsonRpcRequest::notification(method, params);
        let mut post = self.http.post(&endpoint).json(&note);
        for (name, value) in self.request_headers() {
            post = post.header(name, value);
        }

        let response = post
            .send()
            .await
            .map_err(|e| self.transport_err(format!("notification POST failed: {e}")))?;

        if !response.status().is_success() {
            return Err(self.transport_err(format!(
                "notification POST returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.state.set(TransportState::Disconnected);
        if let Some(task) = self.stream_task.take() {
            task.abort();
        }
        self.endpoint_tx.send_replace(None);
        self.pending.lock().await.clear();
        Ok(())
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }
}
