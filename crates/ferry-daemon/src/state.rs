//! Shared daemon state.
//!
//! Everything mutable the daemon owns — pool, metrics, shutdown signal —
//! is constructed once here and passed around as `Arc<AppState>`. There are
//! no process-wide singletons; tests build as many independent daemons as
//! they like.

use std::sync::Mutex;
use std::time::Duration;

use ferry_types::CleanupReport;
use tokio::sync::watch;

use crate::config::Config;
use crate::error::DaemonError;
use crate::handlers::NativeState;
use crate::metrics::Metrics;
use crate::pool::HandlePool;
use crate::registry::CapabilityRegistry;

const HTTP_CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

pub struct AppState {
    pub config: Config,
    pub registry: CapabilityRegistry,
    pub pool: HandlePool<NativeState>,
    pub metrics: Metrics,
    /// Shared HTTP client for the `http` capability
    pub http: reqwest::Client,
    /// Summary of the most recent reaper pass (background or on-demand)
    pub last_cleanup: Mutex<Option<CleanupReport>>,
    shutdown_tx: watch::Sender<bool>,
}

impl AppState {
    /// Build the daemon state with the default capability whitelist.
    ///
    /// # Errors
    ///
    /// Returns `DaemonError::Init` if the HTTP client cannot be constructed
    /// (e.g. TLS backend failure).
    pub fn new(config: Config) -> Result<Self, DaemonError> {
        Self::with_registry(config, CapabilityRegistry::with_defaults())
    }

    /// Build the daemon state with a custom whitelist (tests use this to
    /// exercise fail-closed behavior).
    ///
    /// # Errors
    ///
    /// Returns `DaemonError::Init` if the HTTP client cannot be constructed.
    pub fn with_registry(
        config: Config,
        registry: CapabilityRegistry,
    ) -> Result<Self, DaemonError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_CLIENT_TIMEOUT)
            .build()
            .map_err(|e| DaemonError::Init(e.to_string()))?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            pool: HandlePool::new(config.max_handles),
            metrics: Metrics::new(),
            registry,
            http,
            last_cleanup: Mutex::new(None),
            shutdown_tx,
            config,
        })
    }

    /// Daemon version reported by `test.ping` and `system.info`.
    #[must_use]
    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    /// Subscribe to the shutdown signal.
    #[must_use]
    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Request a graceful stop of the accept loop and background tasks.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Record the result of a reaper pass for `system.stats`.
    pub fn note_cleanup(&self, report: &CleanupReport) {
        let mut guard = self
            .last_cleanup
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = Some(report.clone());
    }

    /// The most recent reaper pass, if any has run.
    #[must_use]
    pub fn last_cleanup(&self) -> Option<CleanupReport> {
        self.last_cleanup
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_construction() {
        let state = AppState::new(Config::default()).unwrap();
        assert!(state.pool.is_empty());
        assert_eq!(state.metrics.snapshot().total_requests, 0);
        assert!(state.last_cleanup().is_none());
    }

    #[test]
    fn test_version_is_nonempty() {
        assert!(!AppState::version().is_empty());
    }

    #[test]
    fn test_shutdown_signal_propagates() {
        let state = AppState::new(Config::default()).unwrap();
        let rx = state.shutdown_rx();
        assert!(!*rx.borrow());
        state.request_shutdown();
        assert!(*rx.borrow());
    }

    #[test]
    fn test_note_cleanup_roundtrip() {
        let state = AppState::new(Config::default()).unwrap();
        let report = CleanupReport {
            cleaned_connections: 2,
            remaining_connections: 1,
            cleaned: Vec::new(),
        };
        state.note_cleanup(&report);
        assert_eq!(state.last_cleanup().unwrap().cleaned_connections, 2);
    }
}
