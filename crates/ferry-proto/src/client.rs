//! One-shot client for the bridge daemon.
//!
//! Each call opens a fresh connection, writes one request, half-closes the
//! write side, and reads the response to EOF — exactly the exchange the
//! daemon's transport listener expects. There is no session state to manage;
//! handle ids returned by one call remain valid on later calls until the
//! handle is released or reaped.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tracing::trace;

use crate::protocol::{ParamMap, Request, Response};
use crate::wire::{self, DEFAULT_MAX_REQUEST_SIZE, WireError};

/// Name of the environment variable overriding the socket location
pub const SOCKET_ENV: &str = "FERRY_SOCKET";

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

fn runtime_dir() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR").map_or_else(|_| std::env::temp_dir(), PathBuf::from)
}

/// Get the socket path for the bridge daemon.
///
/// `$FERRY_SOCKET` wins when set; otherwise `$XDG_RUNTIME_DIR/ferry.sock`,
/// falling back to the system temp directory.
#[must_use]
pub fn socket_path() -> PathBuf {
    std::env::var(SOCKET_ENV).map_or_else(|_| runtime_dir().join("ferry.sock"), PathBuf::from)
}

/// Errors that can occur on the client side of an exchange
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Connection refused / socket missing: the daemon itself is down.
    /// Liveness failure, not a failure of the request.
    #[error("cannot reach daemon: {0}")]
    Connect(std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The daemon answered with `success=false`
    #[error("{0}")]
    Bridge(String),
}

/// Client for one-request-per-connection exchanges with the daemon
#[derive(Debug, Clone)]
pub struct BridgeClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl BridgeClient {
    /// Client against the default (environment-resolved) socket path.
    #[must_use]
    pub fn from_env() -> Self {
        Self::new(socket_path())
    }

    #[must_use]
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Perform one exchange and return the raw response.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Connect` when the daemon is unreachable,
    /// `ClientError::Timeout` when the exchange exceeds the call timeout, and
    /// wire errors for malformed traffic. A `success=false` response is NOT
    /// an error here; use [`BridgeClient::call_ok`] for that.
    pub async fn call(
        &self,
        module: &str,
        function: &str,
        params: ParamMap,
    ) -> Result<Response, ClientError> {
        let request = Request::new(module, function, params);
        trace!("calling {}", request.capability());

        let exchange = async {
            let mut stream = UnixStream::connect(&self.socket_path)
                .await
                .map_err(ClientError::Connect)?;

            wire::write_json(&mut stream, &request).await?;
            // Half-close: tells the daemon the request is complete
            stream.shutdown().await?;

            let response = wire::read_response(&mut stream, DEFAULT_MAX_REQUEST_SIZE).await?;
            Ok::<Response, ClientError>(response)
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))?
    }

    /// Perform one exchange, treating `success=false` as an error.
    ///
    /// # Errors
    ///
    /// Everything [`BridgeClient::call`] returns, plus `ClientError::Bridge`
    /// carrying the daemon's error string.
    pub async fn call_ok(
        &self,
        module: &str,
        function: &str,
        params: ParamMap,
    ) -> Result<Value, ClientError> {
        let response = self.call(module, function, params).await?;
        if response.success {
            Ok(response.result.unwrap_or(Value::Null))
        } else {
            Err(ClientError::Bridge(
                response
                    .error
                    .unwrap_or_else(|| "daemon returned failure without an error".to_string()),
            ))
        }
    }

    /// Liveness probe via the always-authorized `test.ping` capability.
    ///
    /// # Errors
    ///
    /// Same as [`BridgeClient::call_ok`].
    pub async fn ping(&self) -> Result<Value, ClientError> {
        self.call_ok("test", "ping", ParamMap::new()).await
    }
}
