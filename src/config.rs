//! Gateway configuration
//!
//! Backend definitions are keyed by name. The transport kind is inferred
//! from the shape of the definition: a `command` field means a stdio
//! child process, a `url` field means a network transport, further
//! disambiguated by an explicit `type` or by the URL itself. The gateway
//! only reads this shape; the on-disk file is owned by the config-store
//! collaborator.

use crate::error::{GatewayError, Result};
use crate::types::TransportKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;

/// Default per-backend request timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Default cap on inbound JSON-RPC payloads (bytes).
pub const DEFAULT_MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// A backend definition as persisted, before transport inference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawBackendConfig {
    /// Explicit transport override ("stdio", "sse", "streamable-http",
    /// "websocket"). Optional; inferred when absent.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// How the entry is served: "proxy" (default), "aggregate", or
    /// "function". Resolved to a [`HandlerKind`] at load time; there is
    /// no runtime dispatch on strings after this point.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,

    // stdio fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    // network fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// How a configured entry is served, resolved once at config-load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HandlerKind {
    /// A live connection proxied through the tool router (the default).
    ProxyToBackend,
    /// A stdio child merged by the child-process aggregator.
    StdioAggregated,
    /// A command spawned once per call, args on stdin, result on stdout.
    SpawnedFunction,
}

impl Default for HandlerKind {
    fn default() -> Self {
        HandlerKind::ProxyToBackend
    }
}

/// Validated, immutable description of one backend.
///
/// Replaced wholesale on update, deleted on removal; never mutated in
/// place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    pub transport: TransportKind,
    #[serde(default)]
    pub handler: HandlerKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    pub timeout_ms: u64,
}

impl BackendConfig {
    /// Build a validated config from a raw persisted definition.
    pub fn from_raw(name: &str, raw: RawBackendConfig) -> Result<Self> {
        let transport = infer_transport(name, &raw)?;
        let handler = resolve_handler(name, &raw)?;

        match transport {
            TransportKind::Stdio => {
                if raw.command.as_deref().map_or(true, str::is_empty) {
                    return Err(GatewayError::InvalidBackendConfig {
                        backend: name.to_string(),
                        reason: "stdio backend requires a non-empty command".to_string(),
                    });
                }
            }
            _ => {
                if raw.url.as_deref().map_or(true, str::is_empty) {
                    return Err(GatewayError::InvalidBackendConfig {
                        backend: name.to_string(),
                        reason: format!("{transport} backend requires a url"),
                    });
                }
            }
        }

        if handler != HandlerKind::ProxyToBackend && transport != TransportKind::Stdio {
            return Err(GatewayError::InvalidBackendConfig {
                backend: name.to_string(),
                reason: format!("{handler:?} entries must be stdio commands"),
            });
        }

        Ok(Self {
            name: name.to_string(),
            transport,
            handler,
            command: raw.command,
            args: raw.args,
            env: raw.env,
            url: raw.url,
            headers: raw.headers,
            api_key: raw.api_key,
            timeout_ms: raw.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
        })
    }

    /// Shorthand for a stdio backend (used heavily in tests and by the
    /// aggregator CLI).
    pub fn stdio(name: &str, command: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            transport: TransportKind::Stdio,
            handler: HandlerKind::ProxyToBackend,
            command: Some(command.to_string()),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: HashMap::new(),
            url: None,
            headers: HashMap::new(),
            api_key: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

/// Resolve the handler kind from a raw definition.
fn resolve_handler(name: &str, raw: &RawBackendConfig) -> Result<HandlerKind> {
    match raw.handler.as_deref() {
        None | Some("proxy") => Ok(HandlerKind::ProxyToBackend),
        Some("aggregate") => Ok(HandlerKind::StdioAggregated),
        Some("function") => Ok(HandlerKind::SpawnedFunction),
        Some(other) => Err(GatewayError::InvalidBackendConfig {
            backend: name.to_string(),
            reason: format!("unknown handler kind '{other}'"),
        }),
    }
}

/// Infer the transport kind from a raw definition.
///
/// Precedence: explicit `type` field, then `command` vs `url` presence,
/// then URL shape (`ws://`/`wss://` scheme, `/sse` path suffix).
fn infer_transport(name: &str, raw: &RawBackendConfig) -> Result<TransportKind> {
    if let Some(kind) = raw.kind.as_deref() {
        return match kind {
            "stdio" => Ok(TransportKind::Stdio),
            "sse" => Ok(TransportKind::Sse),
            "streamable-http" | "http" => Ok(TransportKind::StreamableHttp),
            "websocket" | "ws" => Ok(TransportKind::WebSocket),
            other => Err(GatewayError::InvalidBackendConfig {
                backend: name.to_string(),
                reason: format!("unknown transport type '{other}'"),
            }),
        };
    }

    if raw.command.is_some() {
        return Ok(TransportKind::Stdio);
    }

    if let Some(url) = raw.url.as_deref() {
        if url.starts_with("ws://") || url.starts_with("wss://") {
            return Ok(TransportKind::WebSocket);
        }
        if url.trim_end_matches('/').ends_with("/sse") {
            return Ok(TransportKind::Sse);
        }
        return Ok(TransportKind::StreamableHttp);
    }

    Err(GatewayError::InvalidBackendConfig {
        backend: name.to_string(),
        reason: "backend needs either a command (stdio) or a url (network)".to_string(),
    })
}

/// Retry schedule knobs for the lifecycle orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial_delay_secs: u64,
    /// Cap on the doubled delay.
    pub max_delay_secs: u64,
    /// Window the per-backend deterministic jitter is drawn from.
    pub jitter_window_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: 30,
            max_delay_secs: 300,
            jitter_window_ms: 10_000,
        }
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Address the inbound JSON-RPC endpoint binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Inbound payloads above this size are rejected before parsing.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Interval between health-check sweeps. Zero disables the loop.
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Backend definitions keyed by name.
    #[serde(default)]
    pub backends: HashMap<String, RawBackendConfig>,
}

fn default_listen_addr() -> SocketAddr {
    ([127, 0, 0, 1], 3930).into()
}

fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

fn default_health_interval() -> u64 {
    60
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_body_bytes: default_max_body_bytes(),
            health_check_interval_secs: default_health_interval(),
            retry: RetryConfig::default(),
            backends: HashMap::new(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a file, with `SWITCHBOARD_*` environment
    /// variables layered on top.
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("SWITCHBOARD").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Validate and resolve every backend definition.
    pub fn resolved_backends(&self) -> Result<Vec<BackendConfig>> {
        let mut out = Vec::with_capacity(self.backends.len());
        for (name, raw) in &self.backends {
            out.push(BackendConfig::from_raw(name, raw.clone())?);
        }
        // Deterministic order for startup logging and tests
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}
