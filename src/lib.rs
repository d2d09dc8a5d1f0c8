//! Switchboard - MCP Aggregation Gateway
//!
//! A Rust gateway that connects to many independent MCP tool backends
//! over heterogeneous transports and exposes them as one namespaced
//! JSON-RPC 2.0 surface:
//! - Transport adapters for stdio child processes, SSE, streamable
//!   HTTP, and WebSocket backends
//! - Per-backend connection lifecycle with reconnect and exponential
//!   backoff
//! - Namespaced tool aggregation with atomic catalog rebuilds
//! - A priority queue serializing administrative operations
//! - A child-process aggregation proxy merging stdio tool servers
//!
//! # Architecture
//!
//! The system is organized leaf-to-root:
//! - **Transport**: one adapter per wire protocol, uniform contract
//! - **Connection**: one backend's handshake, state, and tool list
//! - **Registry**: the backend map and the namespaced tool catalog
//! - **Lifecycle**: parallel startup, retry scheduling, health sweeps
//! - **Ops**: admission-controlled administrative operation queue
//! - **Handler / Api**: JSON-RPC dispatch and the HTTP endpoint
//!
//! # Example
//!
//! ```ignore
//! use switchboard_core::{Gateway, GatewayConfig, EventBus};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = GatewayConfig::load("switchboard.json")?;
//!     let gateway = Gateway::new(config, Arc::new(EventBus::default()));
//!
//!     let report = gateway.start().await?;
//!     println!("{} backends up", report.connected.len());
//!
//!     let tools = gateway.all_tools().await;
//!     println!("{} tools aggregated", tools.len());
//!     Ok(())
//! }
//! ```

pub mod aggregator;
pub mod api;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod gateway;
pub mod handler;
pub mod health;
pub mod lifecycle;
pub mod ops;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use config::{BackendConfig, GatewayConfig};
pub use connection::ServiceConnection;
pub use error::{GatewayError, Result};
pub use events::{EventBus, EventSink, GatewayEvent, NullSink};
pub use gateway::Gateway;
pub use handler::ProtocolHandler;
pub use registry::ServiceRegistry;
pub use types::{
    ConnectionState, ConnectionStatus, NamespacedTool, ToolDescriptor, TransportKind,
};
