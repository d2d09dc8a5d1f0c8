//! Health check system for backend connections
//!
//! Evaluates each connected backend against liveness, error-rate, and
//! latency thresholds. Results feed the lifecycle orchestrator's
//! auto-recovery: an unhealthy-but-connected backend gets reconnected,
//! and every unhealthy finding is reported, never silently dropped.

use crate::connection::CallStats;
use crate::types::ConnectionState;
use serde::{Deserialize, Serialize};

/// Health check status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

/// Thresholds a connected backend is held to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthThresholds {
    /// Error rate above this fails the check (0.0 - 1.0).
    pub max_error_rate: f64,
    /// Error rate above this warns (0.0 - 1.0).
    pub warn_error_rate: f64,
    /// Average response time above this fails the check.
    pub max_avg_latency_ms: u64,
    /// Minimum call count before rates are meaningful.
    pub min_calls: u64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_error_rate: 0.5,
            warn_error_rate: 0.2,
            max_avg_latency_ms: 10_000,
            min_calls: 5,
        }
    }
}

/// Result of evaluating one backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub backend: String,
    pub status: CheckStatus,
    pub message: String,
    pub error_rate: f64,
    pub avg_latency_ms: u64,
}

impl HealthReport {
    /// Whether auto-recovery should reconnect this backend.
    pub fn needs_recovery(&self) -> bool {
        self.status == CheckStatus::Fail
    }
}

/// Evaluate one backend's health from its state and call statistics.
pub fn evaluate(
    backend: &str,
    state: ConnectionState,
    stats: CallStats,
    thresholds: &HealthThresholds,
) -> HealthReport {
    let error_rate = stats.error_rate();
    let avg_latency_ms = stats.avg_latency_ms();

    let report = |status, message: String| HealthReport {
        backend: backend.to_string(),
        status,
        message,
        error_rate,
        avg_latency_ms,
    };

    // Liveness: only connected backends can pass
    if state != ConnectionState::Connected {
        return report(CheckStatus::Fail, format!("connection is {state}"));
    }

    // Rates are noise until enough calls have accumulated
    if stats.calls < thresholds.min_calls {
        return report(CheckStatus::Pass, "healthy (insufficient samples)".to_string());
    }

    if error_rate > thresholds.max_error_rate {
        return report(
            CheckStatus::Fail,
            format!("error rate {:.0}% above threshold", error_rate * 100.0),
        );
    }

    if avg_latency_ms > thresholds.max_avg_latency_ms {
        return report(
            CheckStatus::Fail,
            format!("average response time {avg_latency_ms}ms above threshold"),
        );
    }

    if error_rate > thresholds.warn_error_rate {
        return report(
            CheckStatus::Warn,
            format!("elevated error rate {:.0}%", error_rate * 100.0),
        );
    }

    report(CheckStatus::Pass, "healthy".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(calls: u64, errors: u64, total_latency_ms: u64) -> CallStats {
        CallStats {
            calls,
            errors,
            total_latency_ms,
        }
    }

    #[test]
    fn test_disconnected_backend_fails() {
        let report = evaluate(
            "time",
            ConnectionState::Disconnected,
            stats(0, 0, 0),
            &HealthThresholds::default(),
        );
        assert_eq!(report.status, CheckStatus::Fail);
        assert!(report.needs_recovery());
    }

    #[test]
    fn test_healthy_backend_passes() {
        let report = evaluate(
            "time",
            ConnectionState::Connected,
            stats(100, 1, 5_000),
            &HealthThresholds::default(),
        );
        assert_eq!(report.status, CheckStatus::Pass);
        assert!(!report.needs_recovery());
    }

    #[test]
    fn test_few_samples_always_pass() {
        // 1 call, 1 error would be a 100% error rate, but one sample
        // is not a signal
        let report = evaluate(
            "time",
            ConnectionState::Connected,
            stats(1, 1, 100),
            &HealthThresholds::default(),
        );
        assert_eq!(report.status, CheckStatus::Pass);
    }

    #[test]
    fn test_high_error_rate_fails() {
        let report = evaluate(
            "time",
            ConnectionState::Connected,
            stats(10, 8, 1_000),
            &HealthThresholds::default(),
        );
        assert_eq!(report.status, CheckStatus::Fail);
        assert!(report.needs_recovery());
    }

    #[test]
    fn test_elevated_error_rate_warns() {
        let report = evaluate(
            "time",
            ConnectionState::Connected,
            stats(10, 3, 1_000),
            &HealthThresholds::default(),
        );
        assert_eq!(report.status, CheckStatus::Warn);
        assert!(!report.needs_recovery());
    }

    #[test]
    fn test_slow_backend_fails() {
        // 100 calls averaging 20s each
        let report = evaluate(
            "time",
            ConnectionState::Connected,
            stats(100, 0, 2_000_000),
            &HealthThresholds::default(),
        );
        assert_eq!(report.status, CheckStatus::Fail);
        assert!(report.message.contains("response time"));
    }
}
