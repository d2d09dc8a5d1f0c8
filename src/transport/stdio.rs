//! Stdio transport: JSON-RPC over a child process's standard streams
//!
//! Messages are framed as newline-delimited JSON, one object per line.
//! A partial line stays buffered in the codec until its newline arrives.
//! Stderr output from the child is logged as diagnostics, never parsed.

use crate::config::BackendConfig;
use crate::error::{GatewayError, Result};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::transport::{route_response, PendingMap, StateCell, Transport, TransportState};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, warn};

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    name: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,

    state: Arc<StateCell>,
    next_id: AtomicU64,
    pending: PendingMap,

    child: Option<Child>,
    writer: Arc<Mutex<Option<ChildStdin>>>,
    reader_task: Option<tokio::task::JoinHandle<()>>,
    stderr_task: Option<tokio::task::JoinHandle<()>>,
}

impl StdioTransport {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            name: config.name.clone(),
            command: config.command.clone().unwrap_or_default(),
            args: config.args.clone(),
            env: config.env.clone(),
            state: StateCell::new(),
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            child: None,
            writer: Arc::new(Mutex::new(None)),
            reader_task: None,
            stderr_task: None,
        }
    }

    async fn write_line(&self, payload: String) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| GatewayError::Transport {
            backend: self.name.clone(),
            reason: "stdin not open".to_string(),
        })?;

        let mut line = payload;
        line.push('\n');

        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| GatewayError::Transport {
                backend: self.name.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })?;
        writer.flush().await.map_err(|e| GatewayError::Transport {
            backend: self.name.clone(),
            reason: format!("failed to flush stdin: {e}"),
        })?;
        Ok(())
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn connect(&mut self) -> Result<()> {
        self.state.set(TransportState::Connecting);
        // Fresh process, fresh id space
        self.next_id.store(1, Ordering::Relaxed);

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            self.state.set(TransportState::Disconnected);
            GatewayError::Transport {
                backend: self.name.clone(),
                reason: format!("failed to spawn '{}': {e}", self.command),
            }
        })?;

        let stdin = child.stdin.take().ok_or_else(|| GatewayError::Transport {
            backend: self.name.clone(),
            reason: "failed to capture stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| GatewayError::Transport {
            backend: self.name.clone(),
            reason: "failed to capture stdout".to_string(),
        })?;
        let stderr = child.stderr.take();

        *self.writer.lock().await = Some(stdin);

        // Reader task: route stdout lines to pending requests until EOF.
        let name = self.name.clone();
        let pending = self.pending.clone();
        let state = self.state.clone();
        self.reader_task = Some(tokio::spawn(async move {
            let mut lines = FramedRead::new(stdout, LinesCodec::new());
            while let Some(item) = lines.next().await {
                match item {
                    Ok(line) => route_response(&name, &line, &pending).await,
                    Err(e) => {
                        warn!(backend = %name, error = %e, "stdout framing error");
                        break;
                    }
                }
            }
            debug!(backend = %name, "stdout closed, marking transport disconnected");
            state.set(TransportState::Disconnected);
            // Dropping the senders wakes every in-flight request with an error
            pending.lock().await.clear();
        }));

        // Stderr task: surface child diagnostics in our logs.
        if let Some(stderr) = stderr {
            let name = self.name.clone();
            self.stderr_task = Some(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(backend = %name, "stderr: {line}");
                }
            }));
        }

        self.child = Some(child);
        self.state.set(TransportState::Connected);
        Ok(())
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        if self.state.get() != TransportState::Connected {
            return Err(GatewayError::Transport {
                backend: self.name.clone(),
                reason: "not connected".to_string(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);
        let payload = serde_json::to_string(&request)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if let Err(e) = self.write_line(payload).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        rx.await.map_err(|_| GatewayError::Transport {
            backend: self.name.clone(),
            reason: "backend closed before responding (process may have exited)".to_string(),
        })
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let note = JsonRpcRequest::notification(method, params);
        self.write_line(serde_json::to_string(&note)?).await
    }

    async fn close(&mut self) -> Result<()> {
        self.state.set(TransportState::Disconnected);

        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }

        *self.writer.lock().await = None;
        self.pending.lock().await.clear();

        if let Some(mut child) = self.child.take() {
            // Already-exited children make start_kill fail; that is fine.
            let _ = child.start_kill();
        }
        Ok(())
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }
}
