//! Core data structures for the gateway
//!
//! Tool descriptors, namespacing, connection states, and the status
//! snapshots handed to the administrative interface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Separator between backend name and tool name on the router surface
/// (e.g. `time:now`).
pub const ROUTER_SEPARATOR: char = ':';

/// Separator used by the child-process aggregator (e.g. `time__now`).
/// Distinct from the router separator so the two surfaces cannot collide
/// and aggregated names stay inside conservative tool-name alphabets.
pub const AGGREGATOR_SEPARATOR: &str = "__";

/// Which wire protocol a backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Stdio,
    Sse,
    StreamableHttp,
    WebSocket,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Stdio => write!(f, "stdio"),
            TransportKind::Sse => write!(f, "sse"),
            TransportKind::StreamableHttp => write!(f, "streamable-http"),
            TransportKind::WebSocket => write!(f, "websocket"),
        }
    }
}

/// Lifecycle state of one backend connection.
///
/// Owned exclusively by the backend's `ServiceConnection`; all
/// transitions go through its lifecycle methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A tool as reported by a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// A backend tool lifted into the gateway's namespaced catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespacedTool {
    /// Owning backend name.
    pub service_name: String,
    /// Tool name as the backend knows it.
    pub original_name: String,
    /// The underlying descriptor (schema, description).
    pub tool: ToolDescriptor,
}

impl NamespacedTool {
    /// The externally visible, globally unique name.
    pub fn visible_name(&self) -> String {
        format!(
            "{}{}{}",
            self.service_name, ROUTER_SEPARATOR, self.original_name
        )
    }

    /// Wire form for `tools/list`: the descriptor with the namespaced name.
    pub fn to_wire(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.visible_name(),
            description: self.tool.description.clone(),
            input_schema: self.tool.input_schema.clone(),
        }
    }
}

/// Split a namespaced name into `(service, original)` parts.
pub fn split_namespaced(name: &str) -> Option<(&str, &str)> {
    name.split_once(ROUTER_SEPARATOR)
        .filter(|(service, tool)| !service.is_empty() && !tool.is_empty())
}

/// Point-in-time status snapshot of one backend connection.
///
/// Returned from every administrative operation so callers can emit a
/// state-change notification without a second query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub name: String,
    pub transport: TransportKind,
    pub state: ConnectionState,
    pub tool_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> NamespacedTool {
        NamespacedTool {
            service_name: "filesystem".to_string(),
            original_name: "read_file".to_string(),
            tool: ToolDescriptor {
                name: "read_file".to_string(),
                description: "Read a file".to_string(),
                input_schema: json!({"type": "object"}),
            },
        }
    }

    #[test]
    fn test_visible_name() {
        assert_eq!(sample().visible_name(), "filesystem:read_file");
    }

    #[test]
    fn test_wire_form_uses_namespaced_name() {
        let wire = sample().to_wire();
        assert_eq!(wire.name, "filesystem:read_file");
        assert_eq!(wire.description, "Read a file");
    }

    #[test]
    fn test_split_namespaced() {
        assert_eq!(
            split_namespaced("filesystem:read_file"),
            Some(("filesystem", "read_file"))
        );
        assert_eq!(split_namespaced("no_separator"), None);
        assert_eq!(split_namespaced(":tool"), None);
        assert_eq!(split_namespaced("svc:"), None);
    }

    #[test]
    fn test_tool_descriptor_accepts_camel_case_schema() {
        let tool: ToolDescriptor = serde_json::from_value(json!({
            "name": "now",
            "description": "Current time",
            "inputSchema": {"type": "object", "properties": {}}
        }))
        .unwrap();
        assert_eq!(tool.name, "now");
        assert!(tool.input_schema.is_object());
    }

    #[test]
    fn test_connection_state_serde_snake_case() {
        let s = serde_json::to_string(&ConnectionState::Reconnecting).unwrap();
        assert_eq!(s, "\"reconnecting\"");
    }
}
