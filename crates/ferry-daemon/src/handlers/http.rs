//! HTTP capability.
//!
//! Stateless: no pooled handle, one outbound request per call through the
//! daemon's shared client. The result mirrors what the legacy user-agent
//! shims expect: status, reason phrase, response headers, body, and an
//! `is_success` style flag. Downstream failures (DNS, refused connections,
//! timeouts) surface with reqwest's own message.

use std::sync::Arc;
use std::time::Duration;

use ferry_proto::ParamMap;
use serde_json::{Map, Value, json};

use super::{opt_f64, opt_map, opt_str, require_str, unknown_function};
use crate::error::BridgeError;
use crate::state::AppState;

/// Entry point for the `http` module.
///
/// # Errors
///
/// Invalid-parameter errors for malformed method/header input, execution
/// errors for transport failures.
pub async fn handle(
    state: &Arc<AppState>,
    function: &str,
    params: &ParamMap,
) -> Result<Value, BridgeError> {
    match function {
        "lwp_request" => lwp_request(state, params).await,
        other => Err(unknown_function("http", other)),
    }
}

async fn lwp_request(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let method_name = require_str(params, "method")?;
    let url = require_str(params, "url")?;
    let method = reqwest::Method::from_bytes(method_name.to_uppercase().as_bytes())
        .map_err(|_| BridgeError::InvalidParams(format!("invalid HTTP method: {method_name}")))?;

    let mut request = state.http.request(method, url);

    if let Some(headers) = opt_map(params, "headers")? {
        for (name, value) in headers {
            let Value::String(value) = value else {
                return Err(BridgeError::InvalidParams(format!(
                    "header {name} must be a string"
                )));
            };
            request = request.header(name, value);
        }
    }
    if let Some(content) = opt_str(params, "content")? {
        request = request.body(content.to_string());
    }
    if let Some(timeout) = opt_f64(params, "timeout")? {
        request = request.timeout(Duration::from_secs_f64(timeout.max(0.0)));
    }

    let response = request.send().await?;

    let status = response.status();
    let mut headers = Map::new();
    for (name, value) in response.headers() {
        headers.insert(
            name.to_string(),
            Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
        );
    }
    let content = response.text().await?;

    Ok(json!({
        "status": status.as_u16(),
        "reason": status.canonical_reason().unwrap_or(""),
        "headers": headers,
        "content": content,
        "success": status.is_success(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serde_json::json;

    fn test_state() -> Arc<AppState> {
        Arc::new(AppState::new(Config::default()).unwrap())
    }

    fn params(value: Value) -> ParamMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("params must be an object"),
        }
    }

    #[tokio::test]
    async fn test_invalid_method_rejected() {
        let state = test_state();
        let err = handle(
            &state,
            "lwp_request",
            &params(json!({"method": "GE T", "url": "http://localhost/"})),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("invalid HTTP method"));
    }

    #[tokio::test]
    async fn test_missing_url_rejected() {
        let state = test_state();
        let err = handle(&state, "lwp_request", &params(json!({"method": "GET"})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("url"));
    }

    #[tokio::test]
    async fn test_non_string_header_rejected() {
        let state = test_state();
        let err = handle(
            &state,
            "lwp_request",
            &params(json!({
                "method": "GET",
                "url": "http://localhost/",
                "headers": {"X-Count": 3},
            })),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("X-Count"));
    }

    #[tokio::test]
    async fn test_connection_refused_surfaces_downstream_error() {
        let state = test_state();
        // Port 1 on loopback refuses immediately
        let err = handle(
            &state,
            "lwp_request",
            &params(json!({"method": "GET", "url": "http://127.0.0.1:1/", "timeout": 5})),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BridgeError::Execution(_)));
        assert!(!err.to_string().is_empty());
    }

    #[tokio::test]
    async fn test_roundtrip_against_local_server() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // A one-shot HTTP/1.1 server on an ephemeral port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: 5\r\nconnection: close\r\n\r\nhello",
                )
                .await
                .unwrap();
        });

        let state = test_state();
        let result = handle(
            &state,
            "lwp_request",
            &params(json!({"method": "GET", "url": format!("http://{addr}/")})),
        )
        .await
        .unwrap();

        assert_eq!(result["status"], 200);
        assert_eq!(result["reason"], "OK");
        assert_eq!(result["content"], "hello");
        assert_eq!(result["success"], true);
        assert_eq!(result["headers"]["content-type"], "text/plain");
    }
}
