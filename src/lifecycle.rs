//! Lifecycle and retry orchestration
//!
//! Starts and stops every backend connection, isolates per-backend
//! startup failures, schedules retries with exponential backoff, and
//! runs the periodic health sweep with auto-recovery.
//!
//! Retries are modelled as a scheduled-task table (backend → running
//! timer task) rather than callback chains: each entry can be cancelled
//! individually, and `stop_all` cancels the whole table before any
//! connection is torn down so no retry can fire against a dying
//! connection.

use crate::config::RetryConfig;
use crate::events::{EventSink, GatewayEvent};
use crate::health::{self, HealthThresholds};
use crate::registry::ServiceRegistry;
use crate::types::ConnectionState;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Outcome of a parallel startup pass.
#[derive(Debug, Clone, Default)]
pub struct StartReport {
    pub connected: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Snapshot of the retry table for status reporting.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RetryStats {
    pub failed_services: Vec<String>,
    pub attempts: HashMap<String, u32>,
}

struct RetryEntry {
    attempt: u32,
    handle: tokio::task::JoinHandle<()>,
}

/// Orchestrates connection lifecycles across all registered backends.
pub struct LifecycleManager {
    registry: Arc<ServiceRegistry>,
    events: Arc<dyn EventSink>,
    retry_config: RetryConfig,
    thresholds: HealthThresholds,
    /// Scheduled-task table: backend name → pending retry timer.
    retries: Mutex<HashMap<String, RetryEntry>>,
    health_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Delay before retry number `attempt` (1-based) for a backend.
///
/// First retry waits the initial delay; each subsequent failure doubles
/// it up to the cap. A deterministic per-backend jitter derived from the
/// name is added on top so simultaneous failures do not retry in
/// lockstep.
pub fn compute_retry_delay(attempt: u32, config: &RetryConfig, backend: &str) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    let secs = config
        .initial_delay_secs
        .saturating_mul(1u64 << exponent)
        .min(config.max_delay_secs);
    Duration::from_secs(secs) + Duration::from_millis(name_jitter_ms(backend, config.jitter_window_ms))
}

/// FNV-1a hash of the backend name folded into the jitter window.
fn name_jitter_ms(name: &str, window_ms: u64) -> u64 {
    if window_ms == 0 {
        return 0;
    }
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in name.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash % window_ms
}

impl LifecycleManager {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        events: Arc<dyn EventSink>,
        retry_config: RetryConfig,
        thresholds: HealthThresholds,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            events,
            retry_config,
            thresholds,
            retries: Mutex::new(HashMap::new()),
            health_task: Mutex::new(None),
        })
    }

    // ─── Startup / shutdown ──────────────────────────────────────────

    /// Connect every registered backend in parallel.
    ///
    /// Failures are isolated: one backend failing never prevents or
    /// delays the others, and the call itself never errors: even when
    /// every backend fails, the gateway keeps running so retries or
    /// manual intervention can recover.
    pub async fn start_all(self: &Arc<Self>) -> StartReport {
        let services = self.registry.services().await;
        info!(backends = services.len(), "starting all backends");

        let mut tasks = JoinSet::new();
        for connection in services {
            tasks.spawn(async move {
                let name = connection.name().to_string();
                let result = connection.connect().await;
                (name, connection, result)
            });
        }

        // Settle-all: every task runs to completion regardless of the
        // others' outcomes.
        let mut report = StartReport::default();
        while let Some(joined) = tasks.join_next().await {
            let Ok((name, connection, result)) = joined else {
                warn!("backend startup task panicked");
                continue;
            };
            match result {
                Ok(()) => {
                    self.events.emit(GatewayEvent::backend_connected(
                        name.clone(),
                        connection.tools().await.len(),
                    ));
                    report.connected.push(name);
                }
                Err(e) => {
                    self.events
                        .emit(GatewayEvent::backend_failed(name.clone(), e.to_string()));
                    connection.mark_failed(&e).await;
                    self.schedule_retry(&name).await;
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        report.connected.sort();
        self.registry.rebuild_catalog().await;

        info!(
            connected = report.connected.len(),
            failed = report.failed.len(),
            "startup pass complete"
        );
        report
    }

    /// Cancel all retry timers, stop the health sweep, then disconnect
    /// every backend. Individual disconnect failures are logged and
    /// skipped, never aborting the loop.
    pub async fn stop_all(&self) {
        // Timers first, so nothing reconnects mid-teardown
        {
            let mut retries = self.retries.lock().await;
            for (name, entry) in retries.drain() {
                debug!(backend = %name, "cancelling retry timer");
                entry.handle.abort();
            }
        }

        if let Some(task) = self.health_task.lock().await.take() {
            task.abort();
        }

        for connection in self.registry.services().await {
            let name = connection.name().to_string();
            if let Err(e) = connection.disconnect().await {
                warn!(backend = %name, error = %e, "disconnect failed during shutdown");
            } else {
                self.events.emit(GatewayEvent::backend_disconnected(name));
            }
        }

        self.registry.rebuild_catalog().await;
        info!("all backends stopped");
    }

    // ─── Retry scheduling ────────────────────────────────────────────

    /// Schedule the next retry for a failed backend.
    ///
    /// No-op when a retry is already pending for it.
    pub async fn schedule_retry(self: &Arc<Self>, name: &str) {
        // The body lives behind a boxed `dyn Future + Send` so the
        // recursive reschedule below does not trip the compiler's
        // auto-`Send` inference for a self-spawning async fn.
        self.schedule_retry_inner(name).await
    }

    fn schedule_retry_inner<'a>(
        self: &'a Arc<Self>,
        name: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let Some(connection) = self.registry.get(name).await else {
                return;
            };

            let mut retries = self.retries.lock().await;
            if retries.contains_key(name) {
                return;
            }

            let attempt = connection.increment_retry();
            let delay = compute_retry_delay(attempt, &self.retry_config, name);
            self.events.emit(GatewayEvent::retry_scheduled(
                name.to_string(),
                attempt,
                delay.as_millis() as u64,
            ));
            debug!(backend = %name, attempt, delay_ms = delay.as_millis() as u64, "retry scheduled");

            let manager = Arc::clone(self);
            let backend = name.to_string();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(delay).await;

                // Entry must clear before a potential reschedule below
                manager.retries.lock().await.remove(&backend);

                match connection.connect().await {
                    Ok(()) => {
                        connection.reset_retry();
                        manager.events.emit(GatewayEvent::backend_connected(
                            backend.clone(),
                            connection.tools().await.len(),
                        ));
                        manager.registry.rebuild_catalog().await;
                        info!(backend = %backend, "retry succeeded");
                    }
                    Err(e) => {
                        connection.mark_failed(&e).await;
                        manager
                            .events
                            .emit(GatewayEvent::backend_failed(backend.clone(), e.to_string()));
                        manager.schedule_retry(&backend).await;
                    }
                }
            });

            retries.insert(name.to_string(), RetryEntry { attempt, handle });
        })
    }

    /// Cancel a pending retry for one backend (used on removal).
    pub async fn cancel_retry(&self, name: &str) {
        if let Some(entry) = self.retries.lock().await.remove(name) {
            entry.handle.abort();
            debug!(backend = %name, "retry cancelled");
        }
    }

    /// Current retry table and failed set.
    pub async fn retry_stats(&self) -> RetryStats {
        let mut stats = RetryStats::default();

        for connection in self.registry.services().await {
            let state = connection.state().await;
            if state == ConnectionState::Failed {
                stats.failed_services.push(connection.name().to_string());
            }
            let retries = connection.retry_count();
            if retries > 0 {
                stats
                    .attempts
                    .insert(connection.name().to_string(), retries);
            }
        }

        stats.failed_services.sort();
        stats
    }

    // ─── Health monitoring ───────────────────────────────────────────

    /// Start the periodic health sweep. A zero interval disables it.
    pub async fn start_health_monitor(self: &Arc<Self>, interval: Duration) {
        if interval.is_zero() {
            return;
        }

        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick would race startup
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.run_health_sweep().await;
            }
        });

        let mut guard = self.health_task.lock().await;
        if let Some(old) = guard.replace(handle) {
            old.abort();
        }
    }

    /// One pass over all connected backends.
    async fn run_health_sweep(self: &Arc<Self>) {
        for connection in self.registry.services().await {
            let state = connection.state().await;
            if state != ConnectionState::Connected {
                // Disconnected/failed backends are the retry table's
                // problem, not the health sweep's
                continue;
            }

            let report = health::evaluate(
                connection.name(),
                state,
                connection.stats().await,
                &self.thresholds,
            );

            if report.status != health::CheckStatus::Pass {
                self.events.emit(GatewayEvent::health_degraded(
                    report.backend.clone(),
                    report.message.clone(),
                ));
                warn!(backend = %report.backend, message = %report.message, "health check");
            }

            if report.needs_recovery() {
                let manager = Arc::clone(self);
                let name = connection.name().to_string();
                tokio::spawn(async move {
                    info!(backend = %name, "health auto-recovery: reconnecting");
                    match connection.reconnect().await {
                        Ok(()) => manager.registry.rebuild_catalog().await,
                        Err(e) => {
                            connection.mark_failed(&e).await;
                            manager.registry.rebuild_catalog().await;
                            manager.schedule_retry(&name).await;
                        }
                    }
                });
            }
        }
    }
}
