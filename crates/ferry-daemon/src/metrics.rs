//! Per-call metrics collection and derived health checks.
//!
//! Counters cover the whole daemon lifetime; latency percentiles are
//! computed nearest-rank over a bounded window of the most recent samples so
//! memory stays flat and the numbers reflect current behavior. Reset only on
//! daemon restart.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use ferry_types::{
    CheckStatus, HealthCheck, HealthReport, MetricsSnapshot, ModuleMetrics, PoolStats,
};
use tracing::trace;

/// Recent-sample window used for percentile math
const WINDOW_SIZE: usize = 1024;

const ERROR_RATE_WARN: f64 = 0.05;
const ERROR_RATE_FAIL: f64 = 0.25;
const POOL_USAGE_WARN: f64 = 0.8;

#[derive(Debug, Default)]
struct ModuleCounters {
    requests: u64,
    failed: u64,
    total_micros: u128,
}

#[derive(Debug, Default)]
struct Inner {
    total: u64,
    successful: u64,
    failed: u64,
    total_micros: u128,
    window: VecDeque<u64>,
    per_module: HashMap<String, ModuleCounters>,
}

/// Process-wide metrics collector, shared behind `AppState`
#[derive(Debug)]
pub struct Metrics {
    started: Instant,
    inner: Mutex<Inner>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            inner: Mutex::new(Inner::default()),
        }
    }

    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Record one completed dispatch.
    // Micros of a bounded exec budget fit u64/u128 comfortably
    #[allow(clippy::cast_possible_truncation)]
    pub fn record(&self, module: &str, function: &str, duration: Duration, success: bool) {
        trace!(
            "recording {}.{}: {:?} success={}",
            module, function, duration, success
        );
        let micros = duration.as_micros() as u64;
        let mut inner = self.lock();

        inner.total += 1;
        if success {
            inner.successful += 1;
        } else {
            inner.failed += 1;
        }
        inner.total_micros += u128::from(micros);

        if inner.window.len() == WINDOW_SIZE {
            inner.window.pop_front();
        }
        inner.window.push_back(micros);

        let counters = inner.per_module.entry(module.to_string()).or_default();
        counters.requests += 1;
        if !success {
            counters.failed += 1;
        }
        counters.total_micros += u128::from(micros);
    }

    /// Aggregate view over all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let uptime = self.uptime().as_secs_f64();
        let inner = self.lock();

        let mut sorted: Vec<u64> = inner.window.iter().copied().collect();
        sorted.sort_unstable();

        let avg_latency_ms = if inner.total == 0 {
            0.0
        } else {
            micros_to_ms(inner.total_micros / u128::from(inner.total))
        };
        #[allow(clippy::cast_precision_loss)] // display-only counter math
        let error_rate = if inner.total == 0 {
            0.0
        } else {
            inner.failed as f64 / inner.total as f64
        };
        #[allow(clippy::cast_precision_loss)] // display-only counter math
        let requests_per_second = if uptime > 0.0 {
            inner.total as f64 / uptime
        } else {
            0.0
        };

        let per_module = inner
            .per_module
            .iter()
            .map(|(module, c)| {
                let avg = if c.requests == 0 {
                    0.0
                } else {
                    micros_to_ms(c.total_micros / u128::from(c.requests))
                };
                (
                    module.clone(),
                    ModuleMetrics {
                        requests: c.requests,
                        failed: c.failed,
                        avg_latency_ms: avg,
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            total_requests: inner.total,
            successful: inner.successful,
            failed: inner.failed,
            avg_latency_ms,
            p95_ms: percentile_ms(&sorted, 95.0),
            p99_ms: percentile_ms(&sorted, 99.0),
            requests_per_second,
            error_rate,
            uptime_secs: uptime,
            per_module,
        }
    }

    /// Derive pass/warn/fail per subsystem from the same counters.
    #[must_use]
    pub fn health(
        &self,
        pool: &PoolStats,
        max_handles: usize,
        idle_threshold: Duration,
    ) -> HealthReport {
        let snapshot = self.snapshot();
        let mut checks = HashMap::new();

        #[allow(clippy::cast_precision_loss)] // ratio of small counts
        let usage = if max_handles == 0 {
            1.0
        } else {
            pool.total as f64 / max_handles as f64
        };
        let pool_status = if usage >= 1.0 {
            CheckStatus::Fail
        } else if usage >= POOL_USAGE_WARN {
            CheckStatus::Warn
        } else {
            CheckStatus::Pass
        };
        checks.insert(
            "pool".to_string(),
            HealthCheck {
                status: pool_status,
                detail: format!("{}/{max_handles} handles in use", pool.total),
            },
        );

        let error_status = if snapshot.total_requests == 0 || snapshot.error_rate < ERROR_RATE_WARN
        {
            CheckStatus::Pass
        } else if snapshot.error_rate < ERROR_RATE_FAIL {
            CheckStatus::Warn
        } else {
            CheckStatus::Fail
        };
        checks.insert(
            "error_rate".to_string(),
            HealthCheck {
                status: error_status,
                detail: format!(
                    "{} of {} requests failed",
                    snapshot.failed, snapshot.total_requests
                ),
            },
        );

        // Handles idling past their threshold mean the reaper is behind
        let max_idle = pool
            .handles
            .iter()
            .map(|h| h.idle_secs)
            .fold(0.0_f64, f64::max);
        let threshold = idle_threshold.as_secs_f64();
        let age_status = if max_idle <= threshold {
            CheckStatus::Pass
        } else if max_idle <= threshold * 2.0 {
            CheckStatus::Warn
        } else {
            CheckStatus::Fail
        };
        checks.insert(
            "resource_age".to_string(),
            HealthCheck {
                status: age_status,
                detail: format!("oldest idle handle: {max_idle:.1}s (threshold {threshold:.0}s)"),
            },
        );

        let status = checks
            .values()
            .fold(CheckStatus::Pass, |acc, c| acc.worst(c.status));

        HealthReport {
            status,
            uptime_secs: snapshot.uptime_secs,
            checks,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[allow(clippy::cast_precision_loss)] // sub-second micros, display-only
fn micros_to_ms(micros: u128) -> f64 {
    micros as f64 / 1000.0
}

/// Nearest-rank percentile over an ascending-sorted sample window, in ms.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
#[allow(clippy::cast_sign_loss)] // pct is in (0, 100], rank is positive
fn percentile_ms(sorted: &[u64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    let index = rank.clamp(1, sorted.len()) - 1;
    micros_to_ms(u128::from(sorted[index]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_types::HandleInfo;
    use ferry_types::HandleKind;

    fn empty_pool() -> PoolStats {
        PoolStats {
            total: 0,
            per_kind: HashMap::new(),
            handles: Vec::new(),
        }
    }

    fn pool_with(total: usize, max_idle: f64) -> PoolStats {
        PoolStats {
            total,
            per_kind: HashMap::new(),
            handles: (0..total)
                .map(|i| HandleInfo {
                    id: format!("h{i}"),
                    kind: HandleKind::DatabaseConnection,
                    age_secs: max_idle + 1.0,
                    idle_secs: if i == 0 { max_idle } else { 0.0 },
                })
                .collect(),
        }
    }

    #[test]
    fn test_record_increments_counters() {
        let metrics = Metrics::new();
        metrics.record("database", "connect", Duration::from_millis(5), true);
        metrics.record("database", "connect", Duration::from_millis(7), false);
        metrics.record("crypto", "encrypt", Duration::from_millis(1), true);

        let snap = metrics.snapshot();
        assert_eq!(snap.total_requests, 3);
        assert_eq!(snap.successful, 2);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.per_module["database"].requests, 2);
        assert_eq!(snap.per_module["database"].failed, 1);
        assert_eq!(snap.per_module["crypto"].requests, 1);
    }

    #[test]
    fn test_monotonic_totals() {
        let metrics = Metrics::new();
        let before = metrics.snapshot().total_requests;
        for _ in 0..10 {
            metrics.record("test", "ping", Duration::from_micros(100), true);
        }
        assert_eq!(metrics.snapshot().total_requests, before + 10);
    }

    #[test]
    fn test_error_rate_bounds() {
        let metrics = Metrics::new();
        assert!((metrics.snapshot().error_rate - 0.0).abs() < f64::EPSILON);

        metrics.record("m", "f", Duration::from_micros(1), false);
        metrics.record("m", "f", Duration::from_micros(1), true);
        let rate = metrics.snapshot().error_rate;
        assert!((0.0..=1.0).contains(&rate));
        assert!((rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_p95_not_above_p99() {
        let metrics = Metrics::new();
        for i in 1..=100 {
            metrics.record("m", "f", Duration::from_micros(i * 100), true);
        }
        let snap = metrics.snapshot();
        assert!(snap.p95_ms <= snap.p99_ms);
        assert!(snap.p95_ms > 0.0);
    }

    #[test]
    fn test_percentile_nearest_rank() {
        // 1..=100 micros: p95 = 95th value, p99 = 99th value
        let sorted: Vec<u64> = (1..=100).collect();
        assert!((percentile_ms(&sorted, 95.0) - 0.095).abs() < 1e-9);
        assert!((percentile_ms(&sorted, 99.0) - 0.099).abs() < 1e-9);
        assert!((percentile_ms(&sorted, 100.0) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_percentile_empty_and_single() {
        assert!((percentile_ms(&[], 95.0) - 0.0).abs() < f64::EPSILON);
        assert!((percentile_ms(&[5000], 95.0) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_window_is_bounded() {
        let metrics = Metrics::new();
        for _ in 0..(WINDOW_SIZE + 500) {
            metrics.record("m", "f", Duration::from_micros(10), true);
        }
        let inner = metrics.lock();
        assert_eq!(inner.window.len(), WINDOW_SIZE);
        assert_eq!(inner.total, (WINDOW_SIZE + 500) as u64);
    }

    #[test]
    fn test_health_all_pass_when_quiet() {
        let metrics = Metrics::new();
        let report = metrics.health(&empty_pool(), 1000, Duration::from_secs(300));
        assert_eq!(report.status, CheckStatus::Pass);
        assert_eq!(report.checks["pool"].status, CheckStatus::Pass);
        assert_eq!(report.checks["error_rate"].status, CheckStatus::Pass);
        assert_eq!(report.checks["resource_age"].status, CheckStatus::Pass);
    }

    #[test]
    fn test_health_pool_saturation() {
        let metrics = Metrics::new();
        let report = metrics.health(&pool_with(9, 0.0), 10, Duration::from_secs(300));
        assert_eq!(report.checks["pool"].status, CheckStatus::Warn);

        let report = metrics.health(&pool_with(10, 0.0), 10, Duration::from_secs(300));
        assert_eq!(report.checks["pool"].status, CheckStatus::Fail);
        assert_eq!(report.status, CheckStatus::Fail);
    }

    #[test]
    fn test_health_error_rate_thresholds() {
        let metrics = Metrics::new();
        for i in 0..10 {
            metrics.record("m", "f", Duration::from_micros(1), i != 0);
        }
        // 10% failures: warn territory
        let report = metrics.health(&empty_pool(), 1000, Duration::from_secs(300));
        assert_eq!(report.checks["error_rate"].status, CheckStatus::Warn);

        for _ in 0..10 {
            metrics.record("m", "f", Duration::from_micros(1), false);
        }
        // Past 25%: fail
        let report = metrics.health(&empty_pool(), 1000, Duration::from_secs(300));
        assert_eq!(report.checks["error_rate"].status, CheckStatus::Fail);
    }

    #[test]
    fn test_health_resource_age() {
        let metrics = Metrics::new();
        let report = metrics.health(&pool_with(1, 400.0), 1000, Duration::from_secs(300));
        assert_eq!(report.checks["resource_age"].status, CheckStatus::Warn);

        let report = metrics.health(&pool_with(1, 700.0), 1000, Duration::from_secs(300));
        assert_eq!(report.checks["resource_age"].status, CheckStatus::Fail);
    }

    #[test]
    fn test_uptime_advances() {
        let metrics = Metrics::new();
        std::thread::sleep(Duration::from_millis(10));
        assert!(metrics.uptime() >= Duration::from_millis(10));
    }
}
