//! Administrative operation queue
//!
//! Serializes mutating operations (add/remove backend, tool sync,
//! config update) so they cannot collide with each other or pile onto
//! one backend. Items are ordered by priority with FIFO tie-breaking,
//! admitted under a global concurrency cap and a per-target cap,
//! wrapped in a timeout, and retried a bounded number of times before
//! being reported as permanently failed.

use crate::error::{GatewayError, Result};
use crate::events::{EventSink, GatewayEvent};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

/// What an administrative operation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    AddBackend,
    RemoveBackend,
    SyncTools,
    UpdateConfig,
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OpKind::AddBackend => "add_backend",
            OpKind::RemoveBackend => "remove_backend",
            OpKind::SyncTools => "sync_tools",
            OpKind::UpdateConfig => "update_config",
        };
        write!(f, "{s}")
    }
}

/// Terminal and non-terminal operation states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    Pending,
    Running,
    Completed,
    Failed(String),
    Cancelled,
}

/// Inspectable record of one operation.
#[derive(Debug, Clone, Serialize)]
pub struct AdminOperation {
    pub id: Uuid,
    pub kind: OpKind,
    pub target: String,
    pub priority: u8,
    pub status: OpStatus,
    pub created_at: DateTime<Utc>,
}

/// Queue tuning knobs.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Operations running at once, across all targets.
    pub max_global: usize,
    /// Operations running at once against one target.
    pub max_per_target: usize,
    /// Queued-but-not-started items the queue will hold.
    pub max_pending: usize,
    /// Deadline for a single execution attempt.
    pub timeout: Duration,
    /// Extra attempts after the first failure.
    pub max_retries: u32,
    /// Pause between attempts.
    pub retry_delay: Duration,
    /// How long terminal records stay queryable before being swept.
    pub cleanup_grace: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_global: 4,
            max_per_target: 1,
            max_pending: 256,
            timeout: Duration::from_secs(30),
            max_retries: 2,
            retry_delay: Duration::from_millis(500),
            cleanup_grace: Duration::from_secs(60),
        }
    }
}

/// Future produced by one execution attempt.
pub type OpFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
/// Attempt factory: re-invoked for every retry.
pub type OpExecutor = Box<dyn Fn() -> OpFuture + Send + Sync>;

/// Handle returned to the submitter.
#[derive(Debug)]
pub struct OperationHandle {
    pub id: Uuid,
    rx: oneshot::Receiver<Result<()>>,
}

impl OperationHandle {
    /// Wait for the operation to reach a terminal state.
    pub async fn wait(self) -> Result<()> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(GatewayError::Other("operation dropped".to_string())))
    }
}

struct PendingOp {
    record: AdminOperation,
    seq: u64,
    executor: OpExecutor,
    done: oneshot::Sender<Result<()>>,
}

struct QueueInner {
    /// Sorted: higher priority first, FIFO within a priority.
    pending: Vec<PendingOp>,
    running: HashMap<Uuid, AdminOperation>,
    per_target: HashMap<String, usize>,
    finished: Vec<(AdminOperation, Instant)>,
    seq: u64,
}

/// Priority task queue guarding backend-mutating operations.
pub struct OperationQueue {
    config: QueueConfig,
    events: Arc<dyn EventSink>,
    inner: Mutex<QueueInner>,
}

impl OperationQueue {
    pub fn new(config: QueueConfig, events: Arc<dyn EventSink>) -> Arc<Self> {
        Arc::new(Self {
            config,
            events,
            inner: Mutex::new(QueueInner {
                pending: Vec::new(),
                running: HashMap::new(),
                per_target: HashMap::new(),
                finished: Vec::new(),
                seq: 0,
            }),
        })
    }

    /// Submit an operation. The executor is re-invoked on each retry.
    pub async fn submit(
        self: &Arc<Self>,
        kind: OpKind,
        target: &str,
        priority: u8,
        executor: OpExecutor,
    ) -> Result<OperationHandle> {
        let (tx, rx) = oneshot::channel();
        let id = Uuid::new_v4();

        {
            let mut inner = self.inner.lock().await;
            if inner.pending.len() >= self.config.max_pending {
                return Err(GatewayError::QueueSaturated(format!(
                    "{} operations pending",
                    inner.pending.len()
                )));
            }

            inner.seq += 1;
            let seq = inner.seq;
            let op = PendingOp {
                record: AdminOperation {
                    id,
                    kind,
                    target: target.to_string(),
                    priority,
                    status: OpStatus::Pending,
                    created_at: Utc::now(),
                },
                seq,
                executor,
                done: tx,
            };

            // Insertion sort keeps pending ordered by (priority desc, seq asc)
            let position = inner
                .pending
                .iter()
                .position(|other| {
                    (other.record.priority, std::cmp::Reverse(other.seq))
                        < (priority, std::cmp::Reverse(seq))
                })
                .unwrap_or(inner.pending.len());
            inner.pending.insert(position, op);
        }

        debug!(%id, %kind, target, priority, "operation queued");
        self.dispatch().await;
        Ok(OperationHandle { id, rx })
    }

    /// Cancel every queued-but-not-started operation for a target.
    ///
    /// Used when a backend is removed while operations targeting it are
    /// still waiting. Running operations are not interrupted.
    pub async fn cancel_target(&self, target: &str) -> usize {
        let cancelled: Vec<PendingOp> = {
            let mut inner = self.inner.lock().await;
            let (matching, rest): (Vec<_>, Vec<_>) = inner
                .pending
                .drain(..)
                .partition(|op| op.record.target == target);
            inner.pending = rest;

            for op in &matching {
                let mut record = op.record.clone();
                record.status = OpStatus::Cancelled;
                inner.finished.push((record, Instant::now()));
            }
            matching
        };

        let count = cancelled.len();
        for op in cancelled {
            let _ = op
                .done
                .send(Err(GatewayError::Other("operation cancelled".to_string())));
        }
        if count > 0 {
            debug!(target, count, "queued operations cancelled");
        }
        count
    }

    /// Look up one operation record (pending, running, or recently
    /// finished).
    pub async fn operation(&self, id: Uuid) -> Option<AdminOperation> {
        let inner = self.inner.lock().await;
        inner
            .pending
            .iter()
            .map(|op| &op.record)
            .chain(inner.running.values())
            .chain(inner.finished.iter().map(|(record, _)| record))
            .find(|record| record.id == id)
            .cloned()
    }

    /// Number of queued-but-not-started operations.
    pub async fn pending_count(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    /// Number of running operations.
    pub async fn running_count(&self) -> usize {
        self.inner.lock().await.running.len()
    }

    /// Admit every operation the caps currently allow.
    async fn dispatch(self: &Arc<Self>) {
        let mut admitted = Vec::new();
        {
            let mut inner = self.inner.lock().await;

            // Sweep stale terminal records while we hold the lock
            let grace = self.config.cleanup_grace;
            inner.finished.retain(|(_, at)| at.elapsed() < grace);

            loop {
                if inner.running.len() >= self.config.max_global {
                    break;
                }
                // First admissible item in priority order; a blocked
                // target must not starve unrelated targets behind it
                let position = inner.pending.iter().position(|op| {
                    inner
                        .per_target
                        .get(&op.record.target)
                        .copied()
                        .unwrap_or(0)
                        < self.config.max_per_target
                });
                let Some(position) = position else { break };

                let mut op = inner.pending.remove(position);
                op.record.status = OpStatus::Running;
                *inner
                    .per_target
                    .entry(op.record.target.clone())
                    .or_insert(0) += 1;
                inner.running.insert(op.record.id, op.record.clone());
                admitted.push(op);
            }
        }

        for op in admitted {
            self.spawn_op(op);
        }
    }

    fn spawn_op(self: &Arc<Self>, op: PendingOp) {
        let queue = Arc::clone(self);
        let PendingOp {
            record,
            executor,
            done,
            ..
        } = op;

        tokio::spawn(async move {
            let max_attempts = queue.config.max_retries + 1;
            let mut attempt = 0;
            let result = loop {
                attempt += 1;
                let outcome = tokio::time::timeout(queue.config.timeout, (executor)()).await;
                let error = match outcome {
                    Ok(Ok(())) => break Ok(()),
                    Ok(Err(e)) => e,
                    Err(_) => GatewayError::OperationTimeout {
                        operation: format!("{} ({})", record.kind, record.target),
                        timeout_ms: queue.config.timeout.as_millis() as u64,
                    },
                };

                if attempt >= max_attempts {
                    break Err(GatewayError::OperationFailed {
                        operation: format!("{} ({})", record.kind, record.target),
                        attempts: attempt,
                        reason: error.to_string(),
                    });
                }
                warn!(
                    id = %record.id,
                    kind = %record.kind,
                    target = %record.target,
                    attempt,
                    error = %error,
                    "operation attempt failed, retrying"
                );
                tokio::time::sleep(queue.config.retry_delay).await;
            };

            queue.finish(record, result, done).await;
        });
    }

    /// Release the operation's slots exactly once and notify everyone.
    async fn finish(
        self: &Arc<Self>,
        record: AdminOperation,
        result: Result<()>,
        done: oneshot::Sender<Result<()>>,
    ) {
        let success = result.is_ok();
        {
            let mut inner = self.inner.lock().await;
            if inner.running.remove(&record.id).is_some() {
                if let Some(count) = inner.per_target.get_mut(&record.target) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        inner.per_target.remove(&record.target);
                    }
                }
            }

            let mut terminal = record.clone();
            terminal.status = if success {
                OpStatus::Completed
            } else {
                OpStatus::Failed(
                    result
                        .as_ref()
                        .err()
                        .map(ToString::to_string)
                        .unwrap_or_default(),
                )
            };
            inner.finished.push((terminal, Instant::now()));
        }

        self.events.emit(GatewayEvent::operation_finished(
            record.id.to_string(),
            record.kind.to_string(),
            record.target.clone(),
            success,
        ));
        let _ = done.send(result);

        // A freed slot may unblock queued work
        self.dispatch().await;
    }
}
