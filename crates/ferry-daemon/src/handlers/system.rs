//! Built-in introspection and operational capabilities.
//!
//! `test.ping` is the liveness probe every client adapter uses before
//! falling back to spawning its own helper; it stays authorized no matter
//! what the whitelist says. The `system` module exposes the health, metrics,
//! pool, and cleanup views plus a graceful shutdown.

use std::sync::Arc;

use ferry_proto::ParamMap;
use serde_json::{Value, json};
use tracing::info;

use super::unknown_function;
use crate::error::BridgeError;
use crate::reaper;
use crate::state::AppState;

/// Entry point for the `test` and `system` modules.
///
/// # Errors
///
/// Only unknown functions fail here; every view below is infallible.
// Uniform handler interface; the other capability modules genuinely await
#[allow(clippy::unused_async)]
pub async fn handle(
    state: &Arc<AppState>,
    module: &str,
    function: &str,
    params: &ParamMap,
) -> Result<Value, BridgeError> {
    match (module, function) {
        ("test", "ping") => Ok(ping(state, params)),
        ("system", "health") => Ok(health(state)),
        ("system", "performance") => Ok(performance(state)),
        ("system", "metrics") => Ok(metrics(state)),
        ("system", "connections") => Ok(connections(state)),
        ("system", "stats") => Ok(stats(state)),
        ("system", "cleanup") => Ok(cleanup(state)),
        ("system", "info") => Ok(info_view(state)),
        ("system", "shutdown") => Ok(shutdown(state)),
        (module, function) => Err(unknown_function(module, function)),
    }
}

fn ping(state: &Arc<AppState>, params: &ParamMap) -> Value {
    let snapshot = state.metrics.snapshot();
    json!({
        "message": "pong",
        "daemon_version": AppState::version(),
        "uptime": state.metrics.uptime().as_secs_f64(),
        "platform": std::env::consts::OS,
        "requests_processed": snapshot.total_requests,
        "input": params,
    })
}

fn health(state: &Arc<AppState>) -> Value {
    let report = state.metrics.health(
        &state.pool.stats(),
        state.config.max_handles,
        state.config.idle_timeout,
    );
    serde_json::to_value(report).unwrap_or(Value::Null)
}

fn performance(state: &Arc<AppState>) -> Value {
    let snapshot = state.metrics.snapshot();
    json!({
        "total_requests": snapshot.total_requests,
        "successful": snapshot.successful,
        "failed": snapshot.failed,
        "avg_latency_ms": snapshot.avg_latency_ms,
        "p95_ms": snapshot.p95_ms,
        "p99_ms": snapshot.p99_ms,
        "requests_per_second": snapshot.requests_per_second,
        "error_rate": snapshot.error_rate,
        "uptime_secs": snapshot.uptime_secs,
    })
}

fn metrics(state: &Arc<AppState>) -> Value {
    serde_json::to_value(state.metrics.snapshot()).unwrap_or(Value::Null)
}

fn connections(state: &Arc<AppState>) -> Value {
    serde_json::to_value(state.pool.stats()).unwrap_or(Value::Null)
}

fn stats(state: &Arc<AppState>) -> Value {
    let snapshot = state.metrics.snapshot();
    let last_cleanup = state.last_cleanup().map(|report| {
        json!({
            "cleaned_connections": report.cleaned_connections,
            "remaining_connections": report.remaining_connections,
        })
    });
    json!({
        "requests_processed": snapshot.total_requests,
        "requests_failed": snapshot.failed,
        "uptime_secs": snapshot.uptime_secs,
        "handles_active": state.pool.len(),
        "last_cleanup": last_cleanup,
    })
}

fn cleanup(state: &Arc<AppState>) -> Value {
    let report = reaper::run_once(state);
    serde_json::to_value(report).unwrap_or(Value::Null)
}

fn info_view(state: &Arc<AppState>) -> Value {
    json!({
        "daemon_version": AppState::version(),
        "socket_path": state.config.socket_path.to_string_lossy(),
        "uptime": state.metrics.uptime().as_secs_f64(),
        "capabilities": state.registry.capability_count(),
        "modules": state.registry.modules().collect::<Vec<_>>(),
        "configuration": {
            "max_request_size": state.config.max_request_size,
            "read_timeout_secs": state.config.read_timeout.as_secs(),
            "exec_timeout_secs": state.config.exec_timeout.as_secs(),
            "reap_interval_secs": state.config.reap_interval.as_secs(),
            "idle_timeout_secs": state.config.idle_timeout.as_secs(),
            "max_handles": state.config.max_handles,
        },
    })
}

fn shutdown(state: &Arc<AppState>) -> Value {
    info!("shutdown requested via system.shutdown");
    state.request_shutdown();
    json!({ "message": "Shutdown initiated" })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::handlers::NativeState;
    use crate::handlers::crypto::CipherState;
    use ferry_types::HandleKind;
    use serde_json::json;

    fn test_state() -> Arc<AppState> {
        Arc::new(AppState::new(Config::default()).unwrap())
    }

    #[tokio::test]
    async fn test_ping_shape() {
        let state = test_state();
        let mut params = ParamMap::new();
        params.insert("echo".to_string(), json!("me"));

        let result = handle(&state, "test", "ping", &params).await.unwrap();
        assert_eq!(result["message"], "pong");
        assert!(result["daemon_version"].is_string());
        assert!(result["uptime"].as_f64().unwrap() >= 0.0);
        assert_eq!(result["input"]["echo"], "me");
    }

    #[tokio::test]
    async fn test_health_shape() {
        let state = test_state();
        let result = handle(&state, "system", "health", &ParamMap::new())
            .await
            .unwrap();
        assert_eq!(result["status"], "pass");
        assert!(result["checks"]["pool"].is_object());
        assert!(result["checks"]["error_rate"].is_object());
        assert!(result["checks"]["resource_age"].is_object());
    }

    #[tokio::test]
    async fn test_performance_omits_per_module() {
        let state = test_state();
        let result = handle(&state, "system", "performance", &ParamMap::new())
            .await
            .unwrap();
        assert!(result["total_requests"].is_number());
        assert!(result.get("per_module").is_none());
    }

    #[tokio::test]
    async fn test_metrics_includes_per_module() {
        let state = test_state();
        state
            .metrics
            .record("database", "connect", std::time::Duration::from_millis(1), true);
        let result = handle(&state, "system", "metrics", &ParamMap::new())
            .await
            .unwrap();
        assert!(result["per_module"]["database"].is_object());
    }

    #[tokio::test]
    async fn test_connections_reflect_pool() {
        let state = test_state();
        state
            .pool
            .create(
                HandleKind::CipherContext,
                NativeState::Cipher(Arc::new(CipherState::for_tests())),
            )
            .unwrap();

        let result = handle(&state, "system", "connections", &ParamMap::new())
            .await
            .unwrap();
        assert_eq!(result["total"], 1);
        assert_eq!(result["per_kind"]["cipher-context"], 1);
    }

    #[tokio::test]
    async fn test_cleanup_reports_counts() {
        let state = test_state();
        let result = handle(&state, "system", "cleanup", &ParamMap::new())
            .await
            .unwrap();
        assert_eq!(result["cleaned_connections"], 0);
        assert_eq!(result["remaining_connections"], 0);
    }

    #[tokio::test]
    async fn test_stats_after_cleanup() {
        let state = test_state();
        handle(&state, "system", "cleanup", &ParamMap::new())
            .await
            .unwrap();
        let result = handle(&state, "system", "stats", &ParamMap::new())
            .await
            .unwrap();
        assert!(result["last_cleanup"].is_object());
        assert_eq!(result["handles_active"], 0);
    }

    #[tokio::test]
    async fn test_info_lists_configuration() {
        let state = test_state();
        let result = handle(&state, "system", "info", &ParamMap::new())
            .await
            .unwrap();
        assert_eq!(result["daemon_version"], AppState::version());
        assert!(result["configuration"]["max_handles"].is_number());
        assert!(
            result["modules"]
                .as_array()
                .unwrap()
                .iter()
                .any(|m| m == "database")
        );
    }

    #[tokio::test]
    async fn test_shutdown_signals() {
        let state = test_state();
        let rx = state.shutdown_rx();
        let result = handle(&state, "system", "shutdown", &ParamMap::new())
            .await
            .unwrap();
        assert_eq!(result["message"], "Shutdown initiated");
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn test_unknown_system_function() {
        let state = test_state();
        let err = handle(&state, "system", "reboot", &ParamMap::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not allowed"));
    }
}
