//! Ferry daemon library: socket server, dispatcher, and pooled capability
//! handles for legacy scripting clients.
//!
//! The binary in `main.rs` wires this together with logging and CLI args;
//! integration tests drive the same [`server::run`] against temp sockets.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod pool;
pub mod reaper;
pub mod registry;
pub mod server;
pub mod state;
pub mod validate;

pub use config::Config;
pub use error::{BridgeError, DaemonError, Result};
pub use metrics::Metrics;
pub use pool::{HandleEntry, HandlePool};
pub use registry::CapabilityRegistry;
pub use server::run;
pub use state::AppState;
