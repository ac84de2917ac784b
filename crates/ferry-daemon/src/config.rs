//! Daemon configuration.
//!
//! Loaded once at startup from `FERRY_*` environment variables with
//! defaults, then owned immutably by [`crate::state::AppState`]. Per-kind
//! idle overrides are a programmatic field (tests shorten them); everything
//! else is env-tunable the way the legacy deployment expects.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use ferry_types::{HandleKind, ShapeLimits};

/// Default cap on a single request payload (10 MiB)
const DEFAULT_MAX_REQUEST_SIZE: usize = 10 * 1024 * 1024;
const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;
const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 300;
const DEFAULT_REAP_INTERVAL_SECS: u64 = 60;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_MAX_HANDLES: usize = 1000;

#[derive(Debug, Clone)]
pub struct Config {
    pub socket_path: PathBuf,
    /// Cap on a single request payload in bytes
    pub max_request_size: usize,
    /// Budget for a client to finish sending its request
    pub read_timeout: Duration,
    /// Budget for a single handler execution
    pub exec_timeout: Duration,
    /// Period of the background stale reaper
    pub reap_interval: Duration,
    /// Idle threshold after which a handle becomes reapable
    pub idle_timeout: Duration,
    /// Per-kind overrides of `idle_timeout`
    pub idle_overrides: HashMap<HandleKind, Duration>,
    /// Pool saturation cap; creation beyond this fails (reported via health)
    pub max_handles: usize,
    pub limits: ShapeLimits,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: ferry_proto::socket_path(),
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
            exec_timeout: Duration::from_secs(DEFAULT_EXEC_TIMEOUT_SECS),
            reap_interval: Duration::from_secs(DEFAULT_REAP_INTERVAL_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            idle_overrides: HashMap::new(),
            max_handles: DEFAULT_MAX_HANDLES,
            limits: ShapeLimits::default(),
        }
    }
}

impl Config {
    /// Build a config from the environment, falling back to defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let limits = ShapeLimits {
            max_string_len: env_usize("FERRY_MAX_STRING_LEN", defaults.limits.max_string_len),
            max_collection_len: env_usize(
                "FERRY_MAX_COLLECTION_LEN",
                defaults.limits.max_collection_len,
            ),
            max_depth: env_usize("FERRY_MAX_DEPTH", defaults.limits.max_depth),
            max_params: env_usize("FERRY_MAX_PARAMS", defaults.limits.max_params),
        };
        Self {
            socket_path: defaults.socket_path,
            max_request_size: env_usize("FERRY_MAX_REQUEST_SIZE", defaults.max_request_size),
            read_timeout: env_secs("FERRY_READ_TIMEOUT_SECS", DEFAULT_READ_TIMEOUT_SECS),
            exec_timeout: env_secs("FERRY_EXEC_TIMEOUT_SECS", DEFAULT_EXEC_TIMEOUT_SECS),
            reap_interval: env_secs("FERRY_REAP_INTERVAL_SECS", DEFAULT_REAP_INTERVAL_SECS),
            idle_timeout: env_secs("FERRY_IDLE_TIMEOUT_SECS", DEFAULT_IDLE_TIMEOUT_SECS),
            idle_overrides: HashMap::new(),
            max_handles: env_usize("FERRY_MAX_HANDLES", defaults.max_handles),
            limits,
        }
    }

    /// Idle threshold for a handle kind, honoring per-kind overrides.
    #[must_use]
    pub fn idle_threshold(&self, kind: HandleKind) -> Duration {
        self.idle_overrides
            .get(&kind)
            .copied()
            .unwrap_or(self.idle_timeout)
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(name: &str, default: u64) -> Duration {
    Duration::from_secs(
        std::env::var(name)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default),
    )
}
