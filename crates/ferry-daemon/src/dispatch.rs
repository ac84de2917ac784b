//! Request dispatch: authorize, validate, execute, record.
//!
//! One dispatch walks Received → Authorized → Validated → Executing →
//! Completed. Any failure drops straight to Completed with a
//! category-specific error message; there are no retries here. Handler
//! failures become structured error Responses — they never take the daemon
//! down with them.

use std::sync::Arc;
use std::time::Instant;

use ferry_proto::{Request, Response};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::state::AppState;
use crate::{handlers, validate};

/// Run one request through the full dispatch cycle and produce its response.
pub async fn dispatch(state: &Arc<AppState>, request: Request) -> Response {
    let started = Instant::now();
    let capability = request.capability();
    debug!("dispatching {}", capability);

    let result = dispatch_inner(state, &request).await;
    let duration = started.elapsed();
    let success = result.is_ok();

    state
        .metrics
        .record(&request.module, &request.function, duration, success);

    match result {
        Ok(value) => Response::ok(value),
        Err(e) => {
            warn!("{} failed: {}", capability, e);
            Response::failure(e.to_string())
        }
    }
}

async fn dispatch_inner(state: &Arc<AppState>, request: &Request) -> Result<Value, BridgeError> {
    // Received → Authorized
    state
        .registry
        .authorize(&request.module, &request.function)?;

    // Authorized → Validated
    validate::validate(&request.params, &state.config.limits)?;

    // Validated → Executing, under the bounded execution budget
    let budget = state.config.exec_timeout;
    match tokio::time::timeout(budget, route(state, request)).await {
        Ok(result) => result,
        Err(_) => Err(BridgeError::ExecTimeout(budget.as_secs())),
    }
}

async fn route(state: &Arc<AppState>, request: &Request) -> Result<Value, BridgeError> {
    let function = request.function.as_str();
    let params = &request.params;
    match request.module.as_str() {
        "test" | "system" => {
            handlers::system::handle(state, &request.module, function, params).await
        }
        "database" => handlers::database::handle(state, function, params).await,
        "http" => handlers::http::handle(state, function, params).await,
        "crypto" => handlers::crypto::handle(state, function, params).await,
        "sftp" => handlers::sftp::handle(state, function, params).await,
        "xmldom" => handlers::xmldom::handle(state, function, params).await,
        "lockfile" => handlers::lockfile::handle(state, function, params).await,
        // The whitelist is the source of truth; a pair that authorizes but
        // has no route is a registry misconfiguration, still fail-closed
        module => Err(BridgeError::Unauthorized {
            module: module.to_string(),
            function: function.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::registry::CapabilityRegistry;
    use ferry_proto::ParamMap;
    use ferry_types::ShapeLimits;
    use serde_json::json;

    fn test_state() -> Arc<AppState> {
        Arc::new(AppState::new(Config::default()).unwrap())
    }

    fn request(module: &str, function: &str, params: Value) -> Request {
        let params = match params {
            Value::Object(map) => map,
            Value::Null => ParamMap::new(),
            _ => panic!("params must be an object"),
        };
        Request::new(module, function, params)
    }

    #[tokio::test]
    async fn test_ping_dispatch() {
        let state = test_state();
        let response = dispatch(&state, request("test", "ping", Value::Null)).await;
        assert!(response.success);
        let result = response.result.unwrap();
        assert_eq!(result["message"], "pong");
        assert!(result["daemon_version"].is_string());
        assert!(result["uptime"].is_number());
    }

    #[tokio::test]
    async fn test_unknown_capability_denied() {
        let state = test_state();
        let response = dispatch(
            &state,
            request("database", "malicious_function", Value::Null),
        )
        .await;
        assert!(!response.success);
        let error = response.error.unwrap().to_lowercase();
        assert!(error.contains("not allowed") || error.contains("unauthorized"));
    }

    #[tokio::test]
    async fn test_unknown_module_denied() {
        let state = test_state();
        let response = dispatch(&state, request("exec", "run", Value::Null)).await;
        assert!(!response.success);
        assert!(response.error.unwrap().contains("not allowed"));
    }

    #[tokio::test]
    async fn test_ping_bypasses_stripped_whitelist() {
        let state = Arc::new(
            AppState::with_registry(Config::default(), CapabilityRegistry::new()).unwrap(),
        );
        let response = dispatch(&state, request("test", "ping", Value::Null)).await;
        assert!(response.success);

        // But everything else on the stripped registry is denied
        let response = dispatch(&state, request("system", "health", Value::Null)).await;
        assert!(!response.success);
    }

    #[tokio::test]
    async fn test_validation_runs_before_handler() {
        let config = Config {
            limits: ShapeLimits {
                max_string_len: 8,
                ..ShapeLimits::default()
            },
            ..Config::default()
        };
        let state = Arc::new(AppState::new(config).unwrap());
        let response = dispatch(
            &state,
            request("crypto", "new", json!({"key": "a key well beyond eight bytes"})),
        )
        .await;
        assert!(!response.success);
        assert!(response.error.unwrap().contains("validation rejected"));
        // Nothing was created: validation is side-effect free
        assert!(state.pool.is_empty());
    }

    #[tokio::test]
    async fn test_authorization_runs_before_validation() {
        let config = Config {
            limits: ShapeLimits {
                max_string_len: 1,
                ..ShapeLimits::default()
            },
            ..Config::default()
        };
        let state = Arc::new(AppState::new(config).unwrap());
        let response = dispatch(
            &state,
            request("nosuch", "thing", json!({"big": "oversized string"})),
        )
        .await;
        // Denied, not rejected: authorization short-circuits first
        assert!(response.error.unwrap().contains("not allowed"));
    }

    #[tokio::test]
    async fn test_dispatch_records_metrics() {
        let state = test_state();
        let before = state.metrics.snapshot().total_requests;

        dispatch(&state, request("test", "ping", Value::Null)).await;
        dispatch(&state, request("nosuch", "thing", Value::Null)).await;

        let snap = state.metrics.snapshot();
        assert_eq!(snap.total_requests, before + 2);
        assert_eq!(snap.failed, 1);
        assert!(snap.per_module.contains_key("test"));
        assert!(snap.per_module.contains_key("nosuch"));
    }

    #[tokio::test]
    async fn test_handle_error_distinguishable_from_authorization() {
        let state = test_state();
        let response = dispatch(
            &state,
            request("crypto", "encrypt", json!({"cipher_id": "gone", "plaintext": "x"})),
        )
        .await;
        assert!(!response.success);
        let error = response.error.unwrap();
        assert!(error.contains("handle not found"));
        assert!(!error.to_lowercase().contains("not allowed"));
    }

    #[tokio::test]
    async fn test_execution_budget_enforced() {
        let config = Config {
            exec_timeout: std::time::Duration::from_millis(50),
            ..Config::default()
        };
        let state = Arc::new(AppState::new(config).unwrap());
        // A connect to a non-routable address blocks well past the budget
        let response = dispatch(
            &state,
            request(
                "http",
                "lwp_request",
                json!({"method": "GET", "url": "http://10.255.255.1:81/", "timeout": 30}),
            ),
        )
        .await;
        assert!(!response.success);
        // Either the budget fired or reqwest itself errored first; the
        // daemon converted both to a structured failure
        assert!(response.error.is_some());
    }
}
