//! Shared types for ferry bridge components.
//!
//! This crate provides the data types used across ferry-proto, ferry-daemon,
//! and ferry-cli. All types are serializable for wire transport.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Kind tag for pooled stateful handles.
///
/// Every server-side resource the daemon keeps alive between exchanges is
/// stored in one handle pool under one of these kinds. The kind drives the
/// per-kind idle threshold in the reaper and the wrong-kind check when a
/// handler dereferences an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HandleKind {
    /// Open relational database connection
    DatabaseConnection,
    /// Prepared (possibly executed) SQL statement
    PreparedStatement,
    /// Symmetric cipher context (algorithm + prepared key)
    CipherContext,
    /// Authenticated SFTP session
    SftpSession,
    /// Parsed XML document with its node arena
    DomDocument,
    /// Lock manager configuration
    LockManager,
    /// Held lock (backed by a lockfile on disk)
    Lock,
}

impl HandleKind {
    /// Stable string form used in stats maps and log lines.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            HandleKind::DatabaseConnection => "database-connection",
            HandleKind::PreparedStatement => "prepared-statement",
            HandleKind::CipherContext => "cipher-context",
            HandleKind::SftpSession => "sftp-session",
            HandleKind::DomDocument => "dom-document",
            HandleKind::LockManager => "lock-manager",
            HandleKind::Lock => "lock",
        }
    }
}

impl std::fmt::Display for HandleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-handle view exposed by `system.connections`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandleInfo {
    pub id: String,
    pub kind: HandleKind,
    /// Seconds since the handle was created
    pub age_secs: f64,
    /// Seconds since the handle was last touched
    pub idle_secs: f64,
}

/// Snapshot of the handle pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub total: usize,
    /// Counts keyed by `HandleKind::as_str()`
    pub per_kind: HashMap<String, usize>,
    pub handles: Vec<HandleInfo>,
}

impl PoolStats {
    /// Ids of all live handles, in no particular order.
    #[must_use]
    pub fn ids(&self) -> Vec<&str> {
        self.handles.iter().map(|h| h.id.as_str()).collect()
    }
}

/// One handle evicted by the stale reaper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReapedHandle {
    pub id: String,
    pub kind: HandleKind,
    /// Idle interval that made the handle eligible
    pub idle_secs: f64,
}

/// Report produced by a reaper cycle or a `system.cleanup` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Handles removed by this pass
    pub cleaned_connections: usize,
    /// Handles still alive after this pass
    pub remaining_connections: usize,
    pub cleaned: Vec<ReapedHandle>,
}

/// Per-module counters inside a metrics snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleMetrics {
    pub requests: u64,
    pub failed: u64,
    pub avg_latency_ms: f64,
}

/// Aggregated metrics since daemon start.
///
/// Percentiles are nearest-rank over a bounded window of recent samples, not
/// the full history, so `p95`/`p99` reflect current behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful: u64,
    pub failed: u64,
    pub avg_latency_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub requests_per_second: f64,
    /// Failed / total, in [0, 1]; 0 when nothing was dispatched yet
    pub error_rate: f64,
    pub uptime_secs: f64,
    pub per_module: HashMap<String, ModuleMetrics>,
}

/// Outcome of a single health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

impl CheckStatus {
    /// The worse of two outcomes (`Fail` dominates, then `Warn`).
    #[must_use]
    pub fn worst(self, other: CheckStatus) -> CheckStatus {
        use CheckStatus::{Fail, Pass, Warn};
        match (self, other) {
            (Fail, _) | (_, Fail) => Fail,
            (Warn, _) | (_, Warn) => Warn,
            (Pass, Pass) => Pass,
        }
    }
}

/// One subsystem row inside a health report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: CheckStatus,
    pub detail: String,
}

/// Derived health view over the same counters the metrics snapshot uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Worst status across all checks
    pub status: CheckStatus,
    pub uptime_secs: f64,
    pub checks: HashMap<String, HealthCheck>,
}

/// Input-shape limits enforced by the validator before any handler runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ShapeLimits {
    /// Maximum byte length of any single string value
    pub max_string_len: usize,
    /// Maximum element count of any single array or object
    pub max_collection_len: usize,
    /// Maximum nesting depth of the params tree
    pub max_depth: usize,
    /// Maximum flattened value count across the whole params tree
    pub max_params: usize,
}

impl Default for ShapeLimits {
    fn default() -> Self {
        Self {
            max_string_len: 1_048_576,
            max_collection_len: 10_000,
            max_depth: 32,
            max_params: 10_000,
        }
    }
}
