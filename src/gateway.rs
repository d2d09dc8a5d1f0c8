//! Gateway facade: the administrative interface
//!
//! Composes the registry, lifecycle orchestrator, and operation queue
//! into the surface the HTTP layer (and CLI) consume: add/remove/
//! connect/disconnect backends, inspect status, list and call tools.
//! Mutating operations go through the operation queue so they cannot
//! collide with each other; every one returns the post-operation
//! connection status so the caller can emit a state-change
//! notification.

use crate::config::{BackendConfig, GatewayConfig, HandlerKind};
use crate::connection::ServiceConnection;
use crate::error::{GatewayError, Result};
use crate::events::EventSink;
use crate::health::HealthThresholds;
use crate::lifecycle::{LifecycleManager, RetryStats, StartReport};
use crate::ops::{OpKind, OperationQueue, QueueConfig};
use crate::registry::ServiceRegistry;
use crate::types::{ConnectionStatus, NamespacedTool};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

// Operation priorities: removals outrank config updates outrank adds
// outrank background tool syncs.
const PRIORITY_REMOVE: u8 = 8;
const PRIORITY_UPDATE: u8 = 6;
const PRIORITY_ADD: u8 = 5;
const PRIORITY_SYNC: u8 = 3;

/// The aggregation gateway.
pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<ServiceRegistry>,
    lifecycle: Arc<LifecycleManager>,
    ops: Arc<OperationQueue>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, events: Arc<dyn EventSink>) -> Self {
        let registry = Arc::new(ServiceRegistry::new(events.clone()));
        let lifecycle = LifecycleManager::new(
            registry.clone(),
            events.clone(),
            config.retry.clone(),
            HealthThresholds::default(),
        );
        let ops = OperationQueue::new(QueueConfig::default(), events);

        Self {
            config,
            registry,
            lifecycle,
            ops,
        }
    }

    pub fn registry(&self) -> Arc<ServiceRegistry> {
        self.registry.clone()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    // ─── Lifecycle ───────────────────────────────────────────────────

    /// Register every configured backend and start them in parallel.
    ///
    /// Aggregated and function entries belong to the aggregator
    /// surface, not the router; they are skipped here.
    pub async fn start(&self) -> Result<StartReport> {
        for backend in self.config.resolved_backends()? {
            if backend.handler != HandlerKind::ProxyToBackend {
                debug!(backend = %backend.name, "entry served by the aggregator, skipping");
                continue;
            }
            let connection = Arc::new(ServiceConnection::new(backend));
            self.registry.add_service(connection).await?;
        }

        let report = self.lifecycle.start_all().await;

        let interval = Duration::from_secs(self.config.health_check_interval_secs);
        self.lifecycle.start_health_monitor(interval).await;

        Ok(report)
    }

    /// Cancel retries, stop the health sweep, disconnect everything.
    pub async fn stop(&self) {
        self.lifecycle.stop_all().await;
        info!("gateway stopped");
    }

    // ─── Administrative operations ───────────────────────────────────

    /// Add a backend and connect it.
    ///
    /// Duplicate names are rejected before any connection attempt. A
    /// connect failure does not fail the add: the backend lands in the
    /// failed set with a retry scheduled, visible in the returned
    /// status.
    pub async fn add_backend(&self, backend: BackendConfig) -> Result<ConnectionStatus> {
        let name = backend.name.clone();
        let connection = Arc::new(ServiceConnection::new(backend));

        // Conflict policy: reject before connecting
        self.registry.add_service(connection.clone()).await?;

        let registry = self.registry.clone();
        let conn = connection.clone();
        let handle = self
            .ops
            .submit(
                OpKind::AddBackend,
                &name,
                PRIORITY_ADD,
                Box::new(move || {
                    let registry = registry.clone();
                    let conn = conn.clone();
                    Box::pin(async move {
                        conn.connect().await?;
                        registry.rebuild_catalog().await;
                        Ok(())
                    })
                }),
            )
            .await?;

        if let Err(e) = handle.wait().await {
            connection.mark_failed(&e).await;
            self.lifecycle.schedule_retry(&name).await;
        }

        Ok(connection.status().await)
    }

    /// Remove a backend: cancel anything queued against it, cancel its
    /// retry timer, disconnect it, and purge its tools.
    pub async fn remove_backend(&self, name: &str) -> Result<()> {
        // Queued-but-not-started operations against this target are
        // moot once it is gone
        self.ops.cancel_target(name).await;
        self.lifecycle.cancel_retry(name).await;

        let registry = self.registry.clone();
        let target = name.to_string();
        let handle = self
            .ops
            .submit(
                OpKind::RemoveBackend,
                name,
                PRIORITY_REMOVE,
                Box::new(move || {
                    let registry = registry.clone();
                    let target = target.clone();
                    Box::pin(async move {
                        if let Some(connection) = registry.remove_service(&target).await {
                            // Disconnect failures must not leave the
                            // backend half-registered
                            let _ = connection.disconnect().await;
                        }
                        Ok(())
                    })
                }),
            )
            .await?;

        handle.wait().await
    }

    /// Replace a backend's definition wholesale: disconnect the old
    /// connection, register the new config, reconnect.
    pub async fn update_backend(&self, name: &str, backend: BackendConfig) -> Result<ConnectionStatus> {
        if backend.name != name {
            return Err(GatewayError::InvalidBackendConfig {
                backend: name.to_string(),
                reason: "update cannot rename a backend".to_string(),
            });
        }
        if self.registry.get(name).await.is_none() {
            return Err(GatewayError::BackendNotFound(name.to_string()));
        }

        self.lifecycle.cancel_retry(name).await;

        let registry = self.registry.clone();
        let replacement = Arc::new(ServiceConnection::new(backend));
        let conn = replacement.clone();
        let target = name.to_string();
        let handle = self
            .ops
            .submit(
                OpKind::UpdateConfig,
                name,
                PRIORITY_UPDATE,
                Box::new(move || {
                    let registry = registry.clone();
                    let conn = conn.clone();
                    let target = target.clone();
                    Box::pin(async move {
                        if let Some(old) = registry.remove_service(&target).await {
                            let _ = old.disconnect().await;
                        }
                        registry.add_service(conn.clone()).await?;
                        conn.connect().await?;
                        registry.rebuild_catalog().await;
                        Ok(())
                    })
                }),
            )
            .await?;

        if let Err(e) = handle.wait().await {
            replacement.mark_failed(&e).await;
            self.lifecycle.schedule_retry(name).await;
        }

        Ok(replacement.status().await)
    }

    /// Re-fetch one backend's tool list and rebuild the catalog.
    pub async fn sync_tools(&self, name: &str) -> Result<ConnectionStatus> {
        let connection = self
            .registry
            .get(name)
            .await
            .ok_or_else(|| GatewayError::BackendNotFound(name.to_string()))?;

        let registry = self.registry.clone();
        let conn = connection.clone();
        let handle = self
            .ops
            .submit(
                OpKind::SyncTools,
                name,
                PRIORITY_SYNC,
                Box::new(move || {
                    let registry = registry.clone();
                    let conn = conn.clone();
                    Box::pin(async move {
                        conn.refresh_tools().await?;
                        registry.rebuild_catalog().await;
                        Ok(())
                    })
                }),
            )
            .await?;

        handle.wait().await?;
        Ok(connection.status().await)
    }

    /// Connect one backend on demand.
    pub async fn connect_backend(&self, name: &str) -> Result<ConnectionStatus> {
        let connection = self
            .registry
            .get(name)
            .await
            .ok_or_else(|| GatewayError::BackendNotFound(name.to_string()))?;

        let result = connection.connect().await;
        self.registry.rebuild_catalog().await;
        result?;
        Ok(connection.status().await)
    }

    /// Disconnect one backend on demand (idempotent).
    pub async fn disconnect_backend(&self, name: &str) -> Result<ConnectionStatus> {
        let connection = self
            .registry
            .get(name)
            .await
            .ok_or_else(|| GatewayError::BackendNotFound(name.to_string()))?;

        self.lifecycle.cancel_retry(name).await;
        connection.disconnect().await?;
        self.registry.rebuild_catalog().await;
        Ok(connection.status().await)
    }

    // ─── Queries and routing ─────────────────────────────────────────

    /// Status snapshots for every backend, sorted by name.
    pub async fn connection_status(&self) -> Vec<ConnectionStatus> {
        let mut statuses = Vec::new();
        for connection in self.registry.services().await {
            statuses.push(connection.status().await);
        }
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// The aggregated namespaced catalog.
    pub async fn all_tools(&self) -> Vec<NamespacedTool> {
        self.registry.all_tools().await
    }

    /// Route a namespaced tool call.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        self.registry.call_tool(name, arguments).await
    }

    /// Retry table snapshot.
    pub async fn retry_stats(&self) -> RetryStats {
        self.lifecycle.retry_stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullSink;

    fn gateway() -> Gateway {
        Gateway::new(GatewayConfig::default(), Arc::new(NullSink))
    }

    /// A stdio backend whose handshake fails fast: `cat` echoes our
    /// request back instead of answering it, so connect times out.
    fn unresponsive_backend(name: &str) -> BackendConfig {
        let mut config = BackendConfig::stdio(name, "cat", &[]);
        config.timeout_ms = 200;
        config
    }

    #[tokio::test]
    async fn test_empty_gateway_starts() {
        let gw = gateway();
        let report = gw.start().await.unwrap();
        assert!(report.connected.is_empty());
        assert!(report.failed.is_empty());
        assert!(gw.all_tools().await.is_empty());
    }

    #[tokio::test]
    async fn test_add_backend_with_bad_command_schedules_retry() {
        let gw = gateway();
        let status = gw
            .add_backend(BackendConfig::stdio(
                "ghost",
                "definitely-not-a-real-binary-xyz",
                &[],
            ))
            .await
            .unwrap();

        assert_eq!(status.name, "ghost");
        assert_eq!(status.state, crate::types::ConnectionState::Failed);
        assert!(status.last_error.is_some());

        let stats = gw.retry_stats().await;
        assert_eq!(stats.failed_services, vec!["ghost".to_string()]);

        gw.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_add_rejected() {
        let gw = gateway();
        gw.add_backend(unresponsive_backend("cat")).await.unwrap();

        let err = gw
            .add_backend(unresponsive_backend("cat"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::DuplicateBackend(_)));

        gw.stop().await;
    }

    #[tokio::test]
    async fn test_remove_unknown_backend_is_idempotent() {
        let gw = gateway();
        gw.remove_backend("ghost").await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_unknown_backend() {
        let gw = gateway();
        let err = gw.connect_backend("ghost").await.unwrap_err();
        assert!(matches!(err, GatewayError::BackendNotFound(_)));
    }

    #[tokio::test]
    async fn test_update_rejects_rename() {
        let gw = gateway();
        gw.add_backend(unresponsive_backend("cat")).await.unwrap();

        let err = gw
            .update_backend("cat", unresponsive_backend("dog"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidBackendConfig { .. }));

        gw.stop().await;
    }
}
