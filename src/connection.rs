//! Service connection: one backend's transport, handshake, and tools
//!
//! Owns exactly one transport adapter and that backend's lifecycle
//! state. All `ConnectionState` transitions happen through the methods
//! here; no other component mutates it.

use crate::config::BackendConfig;
use crate::error::{GatewayError, Result};
use crate::protocol::{InitializeResult, ToolsListResult, SUPPORTED_PROTOCOL_VERSIONS};
use crate::transport::{self, Transport};
use crate::types::{ConnectionState, ConnectionStatus, ToolDescriptor};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Rolling call statistics for health evaluation.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallStats {
    pub calls: u64,
    pub errors: u64,
    pub total_latency_ms: u64,
}

impl CallStats {
    /// Fraction of calls that failed, 0.0 when idle.
    pub fn error_rate(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.errors as f64 / self.calls as f64
        }
    }

    /// Mean latency across recorded calls, 0 when idle.
    pub fn avg_latency_ms(&self) -> u64 {
        if self.calls == 0 {
            0
        } else {
            self.total_latency_ms / self.calls
        }
    }
}

/// One backend's connection: transport + handshake + discovered tools.
pub struct ServiceConnection {
    config: BackendConfig,
    transport: RwLock<Box<dyn Transport>>,
    state: RwLock<ConnectionState>,
    tools: RwLock<Vec<ToolDescriptor>>,
    last_error: RwLock<Option<String>>,
    negotiated_version: RwLock<Option<String>>,
    retry_count: AtomicU32,
    stats: Mutex<CallStats>,
    /// Held for the duration of connect/reconnect; a second attempt
    /// while one is running is rejected as already-in-progress.
    connect_guard: Mutex<()>,
}

impl ServiceConnection {
    /// Create a connection with the adapter matching the config.
    pub fn new(config: BackendConfig) -> Self {
        let transport = transport::build(&config);
        Self::with_transport(config, transport)
    }

    /// Create a connection over an explicit adapter. Tests inject fakes
    /// through this.
    pub fn with_transport(config: BackendConfig, transport: Box<dyn Transport>) -> Self {
        Self {
            config,
            transport: RwLock::new(transport),
            state: RwLock::new(ConnectionState::Disconnected),
            tools: RwLock::new(Vec::new()),
            last_error: RwLock::new(None),
            negotiated_version: RwLock::new(None),
            retry_count: AtomicU32::new(0),
            stats: Mutex::new(CallStats::default()),
            connect_guard: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Tools discovered during the last successful handshake.
    pub async fn tools(&self) -> Vec<ToolDescriptor> {
        self.tools.read().await.clone()
    }

    /// Rolling call statistics.
    pub async fn stats(&self) -> CallStats {
        *self.stats.lock().await
    }

    /// Protocol version agreed during the last successful handshake.
    pub async fn negotiated_version(&self) -> Option<String> {
        self.negotiated_version.read().await.clone()
    }

    /// Retry bookkeeping, owned by the lifecycle orchestrator.
    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::Relaxed)
    }

    pub fn increment_retry(&self) -> u32 {
        self.retry_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reset_retry(&self) {
        self.retry_count.store(0, Ordering::Relaxed);
    }

    /// Mark this backend as sitting in the failed set awaiting retry.
    pub async fn mark_failed(&self, error: &GatewayError) {
        *self.last_error.write().await = Some(error.to_string());
        self.set_state(ConnectionState::Failed).await;
    }

    /// Point-in-time snapshot for the administrative interface.
    pub async fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            name: self.config.name.clone(),
            transport: self.config.transport,
            state: self.state().await,
            tool_count: self.tools.read().await.len(),
            last_error: self.last_error.read().await.clone(),
            retry_count: self.retry_count(),
            updated_at: Utc::now(),
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────────

    /// Open the transport, run the MCP handshake, and discover tools.
    ///
    /// On failure the adapter is closed and the state returns to
    /// `Disconnected`; the caller decides whether to schedule a retry.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self
            .connect_guard
            .try_lock()
            .map_err(|_| GatewayError::AlreadyInProgress(self.config.name.clone()))?;

        self.set_state(ConnectionState::Connecting).await;

        match self.connect_inner().await {
            Ok(tools) => {
                let count = tools.len();
                *self.tools.write().await = tools;
                *self.last_error.write().await = None;
                self.set_state(ConnectionState::Connected).await;
                info!(backend = %self.config.name, tools = count, "backend connected");
                Ok(())
            }
            Err(e) => {
                let mut transport = self.transport.write().await;
                if let Err(close_err) = transport.close().await {
                    debug!(backend = %self.config.name, error = %close_err, "close after failed connect");
                }
                drop(transport);

                *self.last_error.write().await = Some(e.to_string());
                self.set_state(ConnectionState::Disconnected).await;
                warn!(backend = %self.config.name, error = %e, "backend connect failed");
                Err(e)
            }
        }
    }

    async fn connect_inner(&self) -> Result<Vec<ToolDescriptor>> {
        let timeout = self.timeout();

        {
            let mut transport = self.transport.write().await;
            tokio::time::timeout(timeout, transport.connect())
                .await
                .map_err(|_| GatewayError::HandshakeTimeout {
                    backend: self.config.name.clone(),
                    timeout_ms: self.config.timeout_ms,
                })??;
        }

        let transport = self.transport.read().await;

        // initialize: offer our newest version, accept whatever the
        // backend answers as long as we speak it too
        let init_params = json!({
            "protocolVersion": SUPPORTED_PROTOCOL_VERSIONS[0],
            "capabilities": { "tools": {} },
            "clientInfo": {
                "name": "switchboard",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        let response = tokio::time::timeout(timeout, transport.request("initialize", Some(init_params)))
            .await
            .map_err(|_| GatewayError::HandshakeTimeout {
                backend: self.config.name.clone(),
                timeout_ms: self.config.timeout_ms,
            })??;

        if let Some(error) = response.error {
            return Err(GatewayError::Backend {
                code: error.code,
                message: error.message,
                data: error.data,
            });
        }

        let init: InitializeResult =
            serde_json::from_value(response.result.unwrap_or(Value::Null)).map_err(|e| {
                GatewayError::Transport {
                    backend: self.config.name.clone(),
                    reason: format!("invalid initialize response: {e}"),
                }
            })?;

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&init.protocol_version.as_str()) {
            return Err(GatewayError::ProtocolMismatch {
                backend: self.config.name.clone(),
                version: init.protocol_version,
            });
        }
        *self.negotiated_version.write().await = Some(init.protocol_version.clone());

        transport
            .notify("notifications/initialized", None)
            .await?;

        let response = tokio::time::timeout(timeout, transport.request("tools/list", None))
            .await
            .map_err(|_| GatewayError::HandshakeTimeout {
                backend: self.config.name.clone(),
                timeout_ms: self.config.timeout_ms,
            })??;

        if let Some(error) = response.error {
            return Err(GatewayError::Backend {
                code: error.code,
                message: error.message,
                data: error.data,
            });
        }

        let list: ToolsListResult =
            serde_json::from_value(response.result.unwrap_or(Value::Null)).map_err(|e| {
                GatewayError::Transport {
                    backend: self.config.name.clone(),
                    reason: format!("invalid tools/list response: {e}"),
                }
            })?;

        Ok(list.tools)
    }

    /// Re-fetch this backend's tool list without a full reconnect.
    pub async fn refresh_tools(&self) -> Result<usize> {
        if self.state().await != ConnectionState::Connected {
            return Err(GatewayError::BackendNotReady(self.config.name.clone()));
        }

        let transport = self.transport.read().await;
        let response = tokio::time::timeout(self.timeout(), transport.request("tools/list", None))
            .await
            .map_err(|_| GatewayError::OperationTimeout {
                operation: format!("tools/list ({})", self.config.name),
                timeout_ms: self.config.timeout_ms,
            })??;
        drop(transport);

        if let Some(error) = response.error {
            return Err(GatewayError::Backend {
                code: error.code,
                message: error.message,
                data: error.data,
            });
        }

        let list: ToolsListResult =
            serde_json::from_value(response.result.unwrap_or(Value::Null))?;
        let count = list.tools.len();
        *self.tools.write().await = list.tools;
        Ok(count)
    }

    /// Close the transport. Closing an already-closed connection is a
    /// no-op, not an error.
    pub async fn disconnect(&self) -> Result<()> {
        if self.state().await == ConnectionState::Disconnected {
            return Ok(());
        }

        let mut transport = self.transport.write().await;
        let result = transport.close().await;
        drop(transport);

        self.set_state(ConnectionState::Disconnected).await;
        debug!(backend = %self.config.name, "backend disconnected");
        result
    }

    /// Tear down and re-establish the connection. Used by health-check
    /// auto-recovery.
    pub async fn reconnect(&self) -> Result<()> {
        self.set_state(ConnectionState::Reconnecting).await;
        // disconnect() would early-return once state flips, so close
        // the transport directly here
        {
            let mut transport = self.transport.write().await;
            let _ = transport.close().await;
        }
        self.connect().await
    }

    // ─── Tool calls ──────────────────────────────────────────────────

    /// Forward a tool call to the backend using its original tool name.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        if self.state().await != ConnectionState::Connected {
            return Err(GatewayError::BackendNotReady(self.config.name.clone()));
        }

        let params = json!({
            "name": name,
            "arguments": arguments,
        });

        let start = Instant::now();
        let transport = self.transport.read().await;
        let outcome = tokio::time::timeout(
            self.timeout(),
            transport.request("tools/call", Some(params)),
        )
        .await;
        drop(transport);

        let elapsed_ms = start.elapsed().as_millis() as u64;

        let result = match outcome {
            Err(_) => Err(GatewayError::OperationTimeout {
                operation: format!("tools/call {name} ({})", self.config.name),
                timeout_ms: self.config.timeout_ms,
            }),
            Ok(Err(e)) => Err(e),
            Ok(Ok(response)) => {
                if let Some(error) = response.error {
                    Err(GatewayError::Backend {
                        code: error.code,
                        message: error.message,
                        data: error.data,
                    })
                } else {
                    Ok(response.result.unwrap_or(Value::Null))
                }
            }
        };

        let mut stats = self.stats.lock().await;
        stats.calls += 1;
        stats.total_latency_ms += elapsed_ms;
        if result.is_err() {
            stats.errors += 1;
        }

        result
    }
}
