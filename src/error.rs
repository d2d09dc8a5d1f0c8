//! Error types for the Switchboard gateway
//!
//! This module provides comprehensive error handling using thiserror for
//! structured error definitions and anyhow for error propagation at the
//! binary boundary.

use thiserror::Error;

/// Main error type for Switchboard operations
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Transport-level failure (connect refused, stream closed, write failed)
    #[error("transport error for backend '{backend}': {reason}")]
    Transport { backend: String, reason: String },

    /// The MCP initialize handshake did not complete in time
    #[error("backend '{backend}' handshake timed out after {timeout_ms}ms")]
    HandshakeTimeout { backend: String, timeout_ms: u64 },

    /// The backend negotiated a protocol version we do not support
    #[error("backend '{backend}' protocol mismatch: {version}")]
    ProtocolMismatch { backend: String, version: String },

    /// Backend returned a JSON-RPC error response
    #[error("backend error [{code}]: {message}")]
    Backend {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// No backend registered under this name
    #[error("backend not found: {0}")]
    BackendNotFound(String),

    /// Tool name resolved to no backend or no tool on its backend
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// Backend exists but is not in a connected state
    #[error("backend '{0}' is not connected")]
    BackendNotReady(String),

    /// A backend with this name is already registered
    #[error("backend already registered: {0}")]
    DuplicateBackend(String),

    /// A connect/reconnect for this backend is already in flight
    #[error("connect already in progress for backend '{0}'")]
    AlreadyInProgress(String),

    /// A call or administrative operation exceeded its deadline
    #[error("operation timed out after {timeout_ms}ms: {operation}")]
    OperationTimeout { operation: String, timeout_ms: u64 },

    /// The administrative operation queue rejected the submission
    #[error("operation queue saturated: {0}")]
    QueueSaturated(String),

    /// An administrative operation failed after exhausting its retries
    #[error("operation '{operation}' failed after {attempts} attempts: {reason}")]
    OperationFailed {
        operation: String,
        attempts: u32,
        reason: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Invalid backend definition (bad transport fields, missing url/command)
    #[error("invalid backend config for '{backend}': {reason}")]
    InvalidBackendConfig { backend: String, reason: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl GatewayError {
    /// Map this error onto a JSON-RPC error code.
    ///
    /// Standard codes for protocol-level failures, application codes
    /// (-32000..-32099) for gateway-specific routing and operational ones.
    pub fn to_rpc_code(&self) -> i64 {
        match self {
            GatewayError::Serialization(_) => -32700,
            GatewayError::Backend { code, .. } => *code,
            GatewayError::BackendNotFound(_) => -32001,
            GatewayError::ToolNotFound(_) => -32002,
            GatewayError::BackendNotReady(_) => -32003,
            GatewayError::OperationTimeout { .. } | GatewayError::HandshakeTimeout { .. } => -32000,
            _ => -32603,
        }
    }

    /// Whether this error is a timeout, as opposed to a hard failure.
    ///
    /// Status reporting keeps the distinction so operators can tell
    /// "backend slow" from "backend broken".
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            GatewayError::OperationTimeout { .. } | GatewayError::HandshakeTimeout { .. }
        )
    }
}

/// Result type alias for Switchboard operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Convert anyhow::Error to GatewayError
impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        GatewayError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GatewayError::ToolNotFound("fs:read_file".to_string());
        assert_eq!(err.to_string(), "tool not found: fs:read_file");
    }

    #[test]
    fn test_rpc_code_mapping() {
        let parse = GatewayError::Serialization(serde_json::from_str::<i32>("x").unwrap_err());
        assert_eq!(parse.to_rpc_code(), -32700);

        assert_eq!(
            GatewayError::BackendNotFound("a".into()).to_rpc_code(),
            -32001
        );
        assert_eq!(GatewayError::ToolNotFound("a".into()).to_rpc_code(), -32002);
        assert_eq!(GatewayError::Other("boom".into()).to_rpc_code(), -32603);
    }

    #[test]
    fn test_timeout_distinguished() {
        let timeout = GatewayError::OperationTimeout {
            operation: "tools/call".into(),
            timeout_ms: 30_000,
        };
        assert!(timeout.is_timeout());
        assert!(!GatewayError::BackendNotFound("a".into()).is_timeout());
    }

    #[test]
    fn test_backend_error_keeps_code() {
        let err = GatewayError::Backend {
            code: -32601,
            message: "Method not found".into(),
            data: None,
        };
        assert_eq!(err.to_rpc_code(), -32601);
    }
}
