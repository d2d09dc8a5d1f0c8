//! Inbound HTTP surface: the JSON-RPC endpoint and health probe

pub mod server;

pub use server::{ApiServer, ApiServerConfig};
