//! Wire protocol for the ferry bridge daemon.
//!
//! This crate provides the request/response types, the EOF-framed wire codec,
//! and the one-shot client used by the control CLI and by legacy-client
//! adapters written in Rust.
//!
//! # Wire contract
//!
//! - Transport: a Unix domain stream socket; one request per connection, one
//!   response per connection.
//! - A request is a JSON mapping `{module, function, params, timestamp}`;
//!   `params` defaults to an empty mapping.
//! - A response is a JSON mapping `{success, result}` or `{success, error}`.
//! - The client signals "done sending" by half-closing its write side; the
//!   daemon closes the connection after writing the response.
//!
//! # Example
//!
//! ```no_run
//! use ferry_proto::{BridgeClient, ParamMap};
//!
//! # async fn example() -> Result<(), ferry_proto::ClientError> {
//! let client = BridgeClient::from_env();
//! let pong = client.ping().await?;
//! println!("daemon version: {}", pong["daemon_version"]);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod protocol;
pub mod wire;

// Re-export main client types
pub use client::{BridgeClient, ClientError, SOCKET_ENV, socket_path};

// Re-export protocol types
pub use protocol::{ParamMap, Request, Response, unix_now};

// Re-export wire helpers
pub use wire::{DEFAULT_MAX_REQUEST_SIZE, WireError, read_request, read_response, write_json};

// Re-export shared data types for consumers
pub use ferry_types::{
    CheckStatus, CleanupReport, HandleInfo, HandleKind, HealthCheck, HealthReport,
    MetricsSnapshot, ModuleMetrics, PoolStats, ReapedHandle, ShapeLimits,
};
