//! Child-process aggregation proxy
//!
//! The second face of the gateway: spawns one stdio tool server per
//! configured backend, merges their tool lists under `service__tool`
//! names, and re-exposes the union as a single MCP server on its own
//! stdin/stdout. Every forwarded request is tagged with a freshly
//! generated id and matched to the response line carrying the same id.
//!
//! Shutdown sends SIGTERM, waits out a grace period, then SIGKILLs
//! whatever is left.

use crate::config::BackendConfig;
use crate::error::{GatewayError, Result};
use crate::protocol::{
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, ToolsListResult, SUPPORTED_PROTOCOL_VERSIONS,
};
use crate::transport::{route_response, PendingMap};
use crate::types::{ToolDescriptor, AGGREGATOR_SEPARATOR};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// How long a child gets between SIGTERM and SIGKILL.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// One spawned tool-server process and its discovered tools.
pub struct AggregatedBackend {
    name: String,
    timeout: Duration,
    child: Mutex<Option<Child>>,
    writer: Mutex<Option<ChildStdin>>,
    pending: PendingMap,
    next_id: AtomicU64,
    ready: Arc<AtomicBool>,
    tools: RwLock<Vec<ToolDescriptor>>,
    reader_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    stderr_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AggregatedBackend {
    /// Whether the child is alive and handshaken.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn tools(&self) -> Vec<ToolDescriptor> {
        self.tools.read().await.clone()
    }

    /// Spawn the child and run the MCP handshake.
    async fn spawn(config: &BackendConfig) -> Result<Arc<Self>> {
        let command = config.command.clone().ok_or_else(|| {
            GatewayError::InvalidBackendConfig {
                backend: config.name.clone(),
                reason: "aggregated backend requires a command".to_string(),
            }
        })?;

        // Merged environment: ours plus the configured overrides
        let mut cmd = Command::new(&command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| GatewayError::Transport {
            backend: config.name.clone(),
            reason: format!("failed to spawn '{command}': {e}"),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| GatewayError::Transport {
            backend: config.name.clone(),
            reason: "failed to capture stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| GatewayError::Transport {
            backend: config.name.clone(),
            reason: "failed to capture stdout".to_string(),
        })?;
        let stderr = child.stderr.take();

        let backend = Arc::new(Self {
            name: config.name.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            child: Mutex::new(Some(child)),
            writer: Mutex::new(Some(stdin)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            ready: Arc::new(AtomicBool::new(false)),
            tools: RwLock::new(Vec::new()),
            reader_task: Mutex::new(None),
            stderr_task: Mutex::new(None),
        });

        // Reader: correlate response lines to forwarded requests. An
        // exiting child closes stdout, which marks the backend unready
        // so the next catalog build drops its tools.
        {
            let name = backend.name.clone();
            let pending = backend.pending.clone();
            let ready = backend.ready.clone();
            let handle = tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    route_response(&name, &line, &pending).await;
                }
                warn!(backend = %name, "child exited, marking unready");
                ready.store(false, Ordering::SeqCst);
                pending.lock().await.clear();
            });
            *backend.reader_task.lock().await = Some(handle);
        }

        if let Some(stderr) = stderr {
            let name = backend.name.clone();
            let handle = tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(backend = %name, "stderr: {line}");
                }
            });
            *backend.stderr_task.lock().await = Some(handle);
        }

        backend.handshake().await?;
        backend.ready.store(true, Ordering::SeqCst);
        Ok(backend)
    }

    async fn handshake(&self) -> Result<()> {
        let init_params = json!({
            "protocolVersion": SUPPORTED_PROTOCOL_VERSIONS[0],
            "capabilities": { "tools": {} },
            "clientInfo": {
                "name": "switchboard-aggregator",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        self.request("initialize", Some(init_params)).await?;
        self.notify("notifications/initialized", None).await?;

        let response = self.request("tools/list", None).await?;
        let list: ToolsListResult = serde_json::from_value(response)?;
        info!(backend = %self.name, tools = list.tools.len(), "aggregated backend ready");
        *self.tools.write().await = list.tools;
        Ok(())
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

    /// Forward a request, correlating by generated id, and unwrap the
    /// result payload.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if let Err(e) = self.write_line(serde_json::to_string(&request)?).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        let response = tokio::time::timeout(self.timeout, rx)
            .await
            .map_err(|_| {
                GatewayError::OperationTimeout {
                    operation: format!("{method} ({})", self.name),
                    timeout_ms: self.timeout.as_millis() as u64,
                }
            })?
            .map_err(|_| GatewayError::Transport {
                backend: self.name.clone(),
                reason: "child exited before responding".to_string(),
            })?;

        if let Some(error) = response.error {
            return Err(GatewayError::Backend {
                code: error.code,
                message: error.message,
                data: error.data,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let note = JsonRpcRequest::notification(method, params);
        self.write_line(serde_json::to_string(&note)?).await
    }

    /// SIGTERM, grace period, then SIGKILL.
    async fn shutdown(&self) {
        self.ready.store(false, Ordering::SeqCst);

        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
        if let Some(task) = self.stderr_task.lock().await.take() {
            task.abort();
        }
        *self.writer.lock().await = None;

        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };

        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(_) => debug!(backend = %self.name, "child exited after SIGTERM"),
            Err(_) => {
                warn!(backend = %self.name, "child ignored SIGTERM, killing");
                let _ = child.kill().await;
            }
        }
    }
}

/// A spawned-function tool: one command run per call.
///
/// The handler-kind replacement for dynamically loaded function tools:
/// the call arguments are written to the child's stdin as one JSON
/// line, and the first stdout line is the result.
pub struct FunctionBackend {
    name: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    timeout: Duration,
}

impl FunctionBackend {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let command = config.command.clone().ok_or_else(|| {
            GatewayError::InvalidBackendConfig {
                backend: config.name.clone(),
                reason: "function entry requires a command".to_string(),
            }
        })?;
        Ok(Self {
            name: config.name.clone(),
            command,
            args: config.args.clone(),
            env: config.env.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
        })
    }

    /// The single tool this entry exposes.
    pub fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name.clone(),
            description: format!("spawned function ({})", self.command),
            input_schema: json!({"type": "object"}),
        }
    }

    /// Run the command once: arguments in, one result line out.
    pub async fn invoke(&self, arguments: Value) -> Result<Value> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GatewayError::Transport {
                backend: self.name.clone(),
                reason: format!("failed to spawn '{}': {e}", self.command),
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| GatewayError::Transport {
            backend: self.name.clone(),
            reason: "failed to capture stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| GatewayError::Transport {
            backend: self.name.clone(),
            reason: "failed to capture stdout".to_string(),
        })?;

        let name = self.name.clone();
        let run = async move {
            let mut payload = serde_json::to_string(&arguments)?;
            payload.push('\n');
            stdin.write_all(payload.as_bytes()).await?;
            stdin.flush().await?;
            drop(stdin);

            let mut lines = BufReader::new(stdout).lines();
            let line = lines
                .next_line()
                .await?
                .ok_or_else(|| GatewayError::Transport {
                    backend: name.clone(),
                    reason: "function produced no output".to_string(),
                })?;
            Ok::<Value, GatewayError>(serde_json::from_str(&line)?)
        };

        let result = tokio::time::timeout(self.timeout, run).await;
        match result {
            Ok(result) => result,
            Err(_) => {
                let _ = child.kill().await;
                Err(GatewayError::OperationTimeout {
                    operation: format!("function {}", self.name),
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }
}

/// Merges several stdio tool servers into one process's tool list.
pub struct Aggregator {
    backends: RwLock<HashMap<String, Arc<AggregatedBackend>>>,
    functions: RwLock<HashMap<String, Arc<FunctionBackend>>>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self {
            backends: RwLock::new(HashMap::new()),
            functions: RwLock::new(HashMap::new()),
        }
    }

    /// Register spawned-function entries alongside the aggregated
    /// servers. Their tool names are not prefixed: each entry is
    /// exactly one tool.
    pub async fn register_functions(&self, configs: Vec<BackendConfig>) -> Vec<(String, GatewayError)> {
        let mut failures = Vec::new();
        for config in configs {
            match FunctionBackend::new(&config) {
                Ok(function) => {
                    self.functions
                        .write()
                        .await
                        .insert(config.name.clone(), Arc::new(function));
                }
                Err(e) => failures.push((config.name, e)),
            }
        }
        failures
    }

    /// Spawn every configured backend concurrently. A backend that
    /// fails to spawn or handshake is logged and skipped; the rest
    /// proceed.
    pub async fn start(&self, configs: Vec<BackendConfig>) -> Vec<(String, GatewayError)> {
        let mut tasks = JoinSet::new();
        for config in configs {
            tasks.spawn(async move {
                let name = config.name.clone();
                (name, AggregatedBackend::spawn(&config).await)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let Ok((name, result)) = joined else { continue };
            match result {
                Ok(backend) => {
                    self.backends.write().await.insert(name, backend);
                }
                Err(e) => {
                    error!(backend = %name, error = %e, "aggregated backend failed to start");
                    failures.push((name, e));
                }
            }
        }
        failures
    }

    /// The merged, prefixed tool list across all ready backends, plus
    /// the unprefixed function entries.
    pub async fn list_tools(&self) -> Vec<ToolDescriptor> {
        let backends = self.backends.read().await;
        let mut names: Vec<&String> = backends.keys().collect();
        names.sort();

        let mut merged = Vec::new();
        for name in names {
            let backend = &backends[name];
            if !backend.is_ready() {
                continue;
            }
            for tool in backend.tools().await {
                merged.push(ToolDescriptor {
                    name: format!("{name}{AGGREGATOR_SEPARATOR}{}", tool.name),
                    description: tool.description,
                    input_schema: tool.input_schema,
                });
            }
        }
        drop(backends);

        let functions = self.functions.read().await;
        let mut function_names: Vec<&String> = functions.keys().collect();
        function_names.sort();
        for name in function_names {
            merged.push(functions[name].descriptor());
        }

        merged
    }

    /// Route a prefixed call to its owning child with the original
    /// name; unprefixed names resolve against the function entries.
    pub async fn call_tool(&self, prefixed: &str, arguments: Value) -> Result<Value> {
        let Some((service, original)) = prefixed.split_once(AGGREGATOR_SEPARATOR) else {
            let function = self.functions.read().await.get(prefixed).cloned();
            return match function {
                Some(function) => function.invoke(arguments).await,
                None => Err(GatewayError::ToolNotFound(prefixed.to_string())),
            };
        };

        let backend = self
            .backends
            .read()
            .await
            .get(service)
            .cloned()
            .ok_or_else(|| GatewayError::ToolNotFound(prefixed.to_string()))?;

        if !backend.is_ready() {
            return Err(GatewayError::BackendNotReady(service.to_string()));
        }

        backend
            .request(
                "tools/call",
                Some(json!({ "name": original, "arguments": arguments })),
            )
            .await
    }

    /// Shut down every child.
    pub async fn shutdown(&self) {
        let backends: Vec<Arc<AggregatedBackend>> =
            self.backends.write().await.drain().map(|(_, b)| b).collect();
        for backend in backends {
            backend.shutdown().await;
        }
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Stdio server loop ──────────────────────────────────────────────────────

/// MCP server over this process's own stdin/stdout, backed by the
/// aggregator. This is what a front client spawns as a child process.
pub struct AggregatorServer {
    aggregator: Arc<Aggregator>,
}

impl AggregatorServer {
    pub fn new(aggregator: Arc<Aggregator>) -> Self {
        Self { aggregator }
    }

    /// Run the server (blocking, processes stdin/stdout).
    pub async fn run(&self) -> Result<()> {
        info!("aggregator serving MCP on stdio");

        let stdin = tokio::io::stdin();
        let mut reader = BufReader::new(stdin);
        let mut stdout = tokio::io::stdout();

        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    debug!("stdin closed, shutting down aggregator");
                    break;
                }
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let Some(response) = self.process_request(trimmed).await else {
                        continue;
                    };

                    let payload = serde_json::to_string(&response).unwrap_or_else(|e| {
                        error!("failed to serialize response: {e}");
                        serde_json::to_string(&JsonRpcResponse::error(
                            Value::Null,
                            JsonRpcError::internal_error(format!("serialization error: {e}")),
                        ))
                        .unwrap_or_default()
                    });

                    if stdout.write_all(payload.as_bytes()).await.is_err()
                        || stdout.write_all(b"\n").await.is_err()
                        || stdout.flush().await.is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    error!("failed to read stdin: {e}");
                    break;
                }
            }
        }

        self.aggregator.shutdown().await;
        info!("aggregator stopped");
        Ok(())
    }

    /// Process a single request line; `None` means no response.
    async fn process_request(&self, raw: &str) -> Option<JsonRpcResponse> {
        let request: JsonRpcRequest = match serde_json::from_str(raw) {
            Ok(request) => request,
            Err(e) => {
                return Some(JsonRpcResponse::error(
                    Value::Null,
                    JsonRpcError::parse_error(format!("Invalid JSON: {e}")),
                ));
            }
        };

        if request.jsonrpc != "2.0" {
            return Some(JsonRpcResponse::error(
                request.id.unwrap_or(Value::Null),
                JsonRpcError::invalid_request("jsonrpc must be '2.0'"),
            ));
        }

        let is_notification = request.is_notification();
        let id = request.id.unwrap_or(Value::Null);

        let response = match request.method.as_str() {
            "initialize" => {
                let requested = request
                    .params
                    .get("protocolVersion")
                    .and_then(Value::as_str);
                JsonRpcResponse::success(
                    id,
                    json!({
                        "protocolVersion": crate::protocol::negotiate_version(requested),
                        "capabilities": { "tools": {} },
                        "serverInfo": {
                            "name": "switchboard-aggregator",
                            "version": env!("CARGO_PKG_VERSION"),
                        },
                    }),
                )
            }
            "notifications/initialized" => return None,
            "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/list" => {
                let tools = self.aggregator.list_tools().await;
                JsonRpcResponse::success(id, json!({ "tools": tools }))
            }
            "tools/call" => {
                let name = request.params.get("name").and_then(Value::as_str);
                let Some(name) = name.filter(|n| !n.is_empty()) else {
                    return Some(JsonRpcResponse::error(
                        id,
                        JsonRpcError::invalid_params("missing or empty 'name' field"),
                    ));
                };
                let arguments = request
                    .params
                    .get("arguments")
                    .cloned()
                    .unwrap_or(Value::Object(serde_json::Map::new()));

                match self.aggregator.call_tool(name, arguments).await {
                    Ok(result) => JsonRpcResponse::success(id, result),
                    Err(e) => JsonRpcResponse::error(
                        id,
                        JsonRpcError::application_error(e.to_rpc_code(), e.to_string()),
                    ),
                }
            }
            method => {
                if is_notification {
                    debug!(method, "unknown notification, dropping");
                    return None;
                }
                JsonRpcResponse::error(id, JsonRpcError::method_not_found(method))
            }
        };

        if is_notification {
            return None;
        }
        Some(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_command_fails_fast() {
        let aggregator = Aggregator::new();
        let failures = aggregator
            .start(vec![BackendConfig::stdio(
                "ghost",
                "definitely-not-a-real-binary-xyz",
                &[],
            )])
            .await;

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "ghost");
        assert!(aggregator.list_tools().await.is_empty());
    }

    #[tokio::test]
    async fn test_call_unknown_prefix() {
        let aggregator = Aggregator::new();
        let err = aggregator
            .call_tool("ghost__tool", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn test_call_unprefixed_name() {
        let aggregator = Aggregator::new();
        let err = aggregator.call_tool("bare", json!({})).await.unwrap_err();
        assert!(matches!(err, GatewayError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn test_function_invocation_round_trip() {
        let mut config = BackendConfig::stdio(
            "check",
            "sh",
            &["-c", "read line; printf '{\"ok\":true}\\n'"],
        );
        config.timeout_ms = 5_000;

        let function = FunctionBackend::new(&config).unwrap();
        let result = function.invoke(json!({"text": "hi"})).await.unwrap();
        assert_eq!(result["ok"], true);
    }

    #[tokio::test]
    async fn test_function_tool_listed_unprefixed() {
        let mut config = BackendConfig::stdio("check", "sh", &["-c", "cat"]);
        config.timeout_ms = 1_000;

        let aggregator = Aggregator::new();
        let failures = aggregator.register_functions(vec![config]).await;
        assert!(failures.is_empty());

        let tools = aggregator.list_tools().await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "check");
    }

    #[tokio::test]
    async fn test_server_rejects_bad_version() {
        let server = AggregatorServer::new(Arc::new(Aggregator::new()));
        let response = server
            .process_request(r#"{"jsonrpc":"1.0","id":1,"method":"ping"}"#)
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, -32600);
    }

    #[tokio::test]
    async fn test_server_lists_merged_tools_empty() {
        let server = AggregatorServer::new(Arc::new(Aggregator::new()));
        let response = server
            .process_request(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#)
            .await
            .unwrap();
        assert_eq!(response.result.unwrap()["tools"], json!([]));
    }

    #[tokio::test]
    async fn test_server_notification_silent() {
        let server = AggregatorServer::new(Arc::new(Aggregator::new()));
        let response = server
            .process_request(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .await;
        assert!(response.is_none());
    }
}
