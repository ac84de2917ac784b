//! Socket server for the ferry daemon.
//!
//! One exchange per connection: read a request until the client half-closes,
//! dispatch it, write the response, close. Connections are served
//! concurrently and independently — there is no session affinity, handles
//! are addressed by id across connections. A payload that never finishes
//! arriving is abandoned at the read timeout; a payload that fails to decode
//! becomes an error response without ever reaching the dispatcher.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use ferry_proto::{Response, wire};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

use crate::dispatch::dispatch;
use crate::error::{DaemonError, Result};
use crate::reaper;
use crate::state::AppState;

/// Run the daemon until shutdown is requested.
///
/// # Errors
///
/// Returns an error if another daemon owns the socket or binding fails.
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let path = state.config.socket_path.clone();
    cleanup_stale_socket(&path).await?;

    let listener = UnixListener::bind(&path)?;
    // Owner-only: the socket is the daemon's whole security perimeter
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    info!("daemon listening on {:?}", path);

    // The reaper runs from startup; an empty pool just means no-op cycles
    tokio::spawn(reaper::run(state.clone()));

    let mut shutdown_rx = state.shutdown_rx();
    info!("ready to accept connections");
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    debug!("accepted connection");
                    let state = state.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, state).await;
                    });
                }
                Err(e) => {
                    error!("accept error: {}", e);
                }
            },
            _ = shutdown_rx.changed() => {
                info!("shutdown requested, stopping server");
                break;
            }
        }
    }

    if path.exists()
        && let Err(e) = std::fs::remove_file(&path)
    {
        warn!("failed to remove socket file {:?}: {}", path, e);
    }

    Ok(())
}

/// A socket file with a live daemon behind it is a hard error; a dead one is
/// swept away so restarts work.
async fn cleanup_stale_socket(path: &Path) -> Result<()> {
    if path.exists() {
        if UnixStream::connect(path).await.is_ok() {
            return Err(DaemonError::AlreadyRunning(path.to_path_buf()));
        }
        info!("removing stale socket at {}", path.display());
        std::fs::remove_file(path)?;
    }
    Ok(())
}

async fn handle_connection(mut stream: UnixStream, state: Arc<AppState>) {
    let read = wire::read_request(&mut stream, state.config.max_request_size);
    let response = match tokio::time::timeout(state.config.read_timeout, read).await {
        Ok(Ok(request)) => dispatch(&state, request).await,
        Ok(Err(e)) => {
            // Transport error: short-circuits without reaching the dispatcher
            debug!("malformed request payload: {}", e);
            Response::failure(format!("malformed request: {e}"))
        }
        Err(_) => {
            let secs = state.config.read_timeout.as_secs();
            debug!("connection abandoned: request not completed within {}s", secs);
            Response::failure(format!("request not completed within {secs}s"))
        }
    };

    if let Err(e) = wire::write_json(&mut stream, &response).await {
        debug!("failed to write response: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use ferry_proto::{BridgeClient, ParamMap};
    use std::time::Duration;

    async fn start_test_daemon() -> (Arc<AppState>, BridgeClient, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            socket_path: dir.path().join("ferry.sock"),
            ..Config::default()
        };
        let state = Arc::new(AppState::new(config).unwrap());
        tokio::spawn(run(state.clone()));

        let client = BridgeClient::new(state.config.socket_path.clone())
            .with_timeout(Duration::from_secs(5));
        for _ in 0..100 {
            if client.ping().await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        (state, client, dir)
    }

    #[tokio::test]
    async fn test_ping_over_socket() {
        let (_state, client, _dir) = start_test_daemon().await;
        let pong = client.ping().await.unwrap();
        assert_eq!(pong["message"], "pong");
    }

    #[tokio::test]
    async fn test_malformed_payload_short_circuits() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (state, _client, _dir) = start_test_daemon().await;
        let before = state.metrics.snapshot().total_requests;

        let mut stream = UnixStream::connect(&state.config.socket_path)
            .await
            .unwrap();
        stream.write_all(b"{this is not json").await.unwrap();
        stream.shutdown().await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();

        let response: Response = serde_json::from_slice(&buf).unwrap();
        assert!(!response.success);
        assert!(response.error.unwrap().contains("malformed request"));
        // Never dispatched, never recorded
        assert_eq!(state.metrics.snapshot().total_requests, before);
    }

    #[tokio::test]
    async fn test_two_daemons_same_socket_rejected() {
        let (state, _client, _dir) = start_test_daemon().await;
        let second = Arc::new(
            AppState::new(Config {
                socket_path: state.config.socket_path.clone(),
                ..Config::default()
            })
            .unwrap(),
        );
        let err = run(second).await.unwrap_err();
        assert!(matches!(err, DaemonError::AlreadyRunning(_)));
    }

    #[tokio::test]
    async fn test_concurrent_exchanges() {
        let (_state, client, _dir) = start_test_daemon().await;
        let mut joins = Vec::new();
        for _ in 0..10 {
            let client = client.clone();
            joins.push(tokio::spawn(async move {
                client.call_ok("test", "ping", ParamMap::new()).await
            }));
        }
        for join in joins {
            assert!(join.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn test_shutdown_removes_socket() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            socket_path: dir.path().join("ferry.sock"),
            ..Config::default()
        };
        let state = Arc::new(AppState::new(config).unwrap());
        let server = tokio::spawn(run(state.clone()));

        let client = BridgeClient::new(state.config.socket_path.clone());
        for _ in 0..100 {
            if client.ping().await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        state.request_shutdown();
        server.await.unwrap().unwrap();
        assert!(!state.config.socket_path.exists());
    }
}
