//! Background stale reaper.
//!
//! Runs unconditionally from daemon startup on a fixed period; an empty pool
//! just means no-op cycles. A pass removes every handle whose contiguous
//! idle interval exceeds its kind's threshold. The same pass is callable
//! synchronously through `system.cleanup`.

use std::sync::Arc;

use ferry_types::CleanupReport;
use tracing::{debug, info};

use crate::state::AppState;

/// One reaper pass over the pool. Native teardown (payload drops) happens
/// here, after the pool lock is released.
pub fn run_once(state: &AppState) -> CleanupReport {
    let reaped = state.pool.reap_idle(|kind| state.config.idle_threshold(kind));

    let mut cleaned = Vec::with_capacity(reaped.len());
    for (info, payload) in reaped {
        debug!(
            "reaped {} handle {} (idle {:.1}s)",
            info.kind, info.id, info.idle_secs
        );
        cleaned.push(info);
        drop(payload);
    }

    let report = CleanupReport {
        cleaned_connections: cleaned.len(),
        remaining_connections: state.pool.len(),
        cleaned,
    };
    state.note_cleanup(&report);
    report
}

/// Periodic reaper task; exits on the shutdown signal.
pub async fn run(state: Arc<AppState>) {
    let mut shutdown_rx = state.shutdown_rx();
    let mut interval = tokio::time::interval(state.config.reap_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; skip it so a fresh daemon does
    // not log a pointless pass
    interval.tick().await;

    info!(
        "stale reaper started (period {:?}, idle threshold {:?})",
        state.config.reap_interval, state.config.idle_timeout
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let report = run_once(&state);
                if report.cleaned_connections > 0 {
                    info!(
                        "reaper pass removed {} stale handles, {} remaining",
                        report.cleaned_connections, report.remaining_connections
                    );
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }

    debug!("stale reaper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::handlers::NativeState;
    use crate::handlers::crypto::CipherState;
    use ferry_types::HandleKind;
    use std::time::Duration;

    fn test_state(idle: Duration) -> AppState {
        let config = Config {
            idle_timeout: idle,
            ..Config::default()
        };
        AppState::new(config).unwrap()
    }

    fn dummy_payload() -> NativeState {
        NativeState::Cipher(Arc::new(CipherState::for_tests()))
    }

    #[test]
    fn test_run_once_empty_pool_is_noop() {
        let state = test_state(Duration::from_secs(300));
        let report = run_once(&state);
        assert_eq!(report.cleaned_connections, 0);
        assert_eq!(report.remaining_connections, 0);
        assert!(report.cleaned.is_empty());
    }

    #[test]
    fn test_run_once_removes_only_idle_handles() {
        let state = test_state(Duration::from_millis(30));
        let stale = state
            .pool
            .create(HandleKind::CipherContext, dummy_payload())
            .unwrap();
        std::thread::sleep(Duration::from_millis(60));
        let fresh = state
            .pool
            .create(HandleKind::CipherContext, dummy_payload())
            .unwrap();

        let report = run_once(&state);
        assert_eq!(report.cleaned_connections, 1);
        assert_eq!(report.remaining_connections, 1);
        assert_eq!(report.cleaned[0].id, stale);
        assert!(state.pool.get(&fresh).is_ok());
    }

    #[test]
    fn test_touched_handle_survives_pass() {
        let state = test_state(Duration::from_millis(50));
        let id = state
            .pool
            .create(HandleKind::CipherContext, dummy_payload())
            .unwrap();
        std::thread::sleep(Duration::from_millis(30));
        state.pool.touch(&id);
        std::thread::sleep(Duration::from_millis(30));

        // Idle interval was reset by the touch: not reapable yet
        let report = run_once(&state);
        assert_eq!(report.cleaned_connections, 0);
        assert!(state.pool.get(&id).is_ok());
    }

    #[test]
    fn test_run_once_records_last_cleanup() {
        let state = test_state(Duration::from_secs(300));
        assert!(state.last_cleanup().is_none());
        run_once(&state);
        assert!(state.last_cleanup().is_some());
    }

    #[tokio::test]
    async fn test_background_task_reaps_on_period() {
        let config = Config {
            idle_timeout: Duration::from_millis(20),
            reap_interval: Duration::from_millis(40),
            ..Config::default()
        };
        let state = Arc::new(AppState::new(config).unwrap());
        state
            .pool
            .create(HandleKind::CipherContext, dummy_payload())
            .unwrap();

        let task = tokio::spawn(run(state.clone()));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(state.pool.is_empty(), "stale handle should be reaped");

        state.request_shutdown();
        task.await.unwrap();
    }
}
