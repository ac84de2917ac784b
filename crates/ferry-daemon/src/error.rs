//! Error types for the ferry daemon.
//!
//! Two layers: [`DaemonError`] covers daemon lifecycle failures (bind,
//! socket cleanup), while [`BridgeError`] is the per-request taxonomy that
//! renders into wire error strings. Clients match on substrings — "not
//! allowed" for authorization, "handle not found" for dead handles — so the
//! `Display` forms here are part of the contract.

use std::path::PathBuf;

use ferry_types::HandleKind;

/// Errors that can occur while starting or running the daemon itself
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Another daemon instance already owns the socket
    #[error("another daemon is already running at {0}")]
    AlreadyRunning(PathBuf),

    /// Startup-time initialization failure (e.g. HTTP client construction)
    #[error("initialization failed: {0}")]
    Init(String),
}

pub type Result<T> = std::result::Result<T, DaemonError>;

/// Per-request failure taxonomy.
///
/// Every variant converts into a structured error Response; none of them
/// terminates the daemon.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Capability absent from the whitelist (fail-closed)
    #[error("{module}.{function} is not allowed: capability is not whitelisted")]
    Unauthorized { module: String, function: String },

    /// Input shape exceeded configured limits
    #[error("validation rejected request: {0}")]
    Validation(String),

    /// Referenced handle id does not exist (released or reaped)
    #[error("handle not found: {0}")]
    HandleNotFound(String),

    /// Referenced handle exists but has the wrong kind
    #[error("handle {id} is a {actual}, expected {expected}")]
    WrongKind {
        id: String,
        expected: HandleKind,
        actual: HandleKind,
    },

    /// Parameters are present but unusable (missing key, wrong type)
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// The downstream native operation failed; its own message is surfaced
    #[error("{0}")]
    Execution(String),

    /// Handler exceeded the bounded execution budget
    #[error("execution exceeded the {0} second budget")]
    ExecTimeout(u64),

    /// Pool is at capacity; reported via health, daemon keeps serving
    #[error("handle pool exhausted: {current} handles at capacity {max}")]
    PoolExhausted { current: usize, max: usize },

    /// Anything that should not happen in normal operation
    #[error("internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Convenience constructor for missing-parameter errors.
    pub fn missing_param(key: &str) -> Self {
        BridgeError::InvalidParams(format!("missing required parameter: {key}"))
    }
}

impl From<rusqlite::Error> for BridgeError {
    fn from(e: rusqlite::Error) -> Self {
        BridgeError::Execution(e.to_string())
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(e: reqwest::Error) -> Self {
        BridgeError::Execution(e.to_string())
    }
}

impl From<openssl::error::ErrorStack> for BridgeError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        BridgeError::Execution(e.to_string())
    }
}

impl From<ssh2::Error> for BridgeError {
    fn from(e: ssh2::Error) -> Self {
        BridgeError::Execution(e.to_string())
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        BridgeError::Execution(e.to_string())
    }
}
