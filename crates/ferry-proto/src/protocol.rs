//! Request/response message types for the bridge wire contract.
//!
//! One request and one response travel over each connection. A request names
//! a `(module, function)` capability pair and carries an ordered parameter
//! map; a response is either a populated `result` mapping or an `error`
//! string, never both.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Ordered string-keyed parameter map.
///
/// `serde_json` is built with `preserve_order`, so iteration follows the
/// order the client supplied.
pub type ParamMap = serde_json::Map<String, Value>;

/// One decoded client request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Capability namespace (e.g. `database`, `crypto`, `system`)
    pub module: String,
    /// Operation name inside the module
    pub function: String,
    /// Operation parameters; absent on the wire means empty
    #[serde(default)]
    pub params: ParamMap,
    /// Client-side send time, seconds since the Unix epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

impl Request {
    /// Build a request stamped with the current wall-clock time.
    #[must_use]
    pub fn new(module: impl Into<String>, function: impl Into<String>, params: ParamMap) -> Self {
        Self {
            module: module.into(),
            function: function.into(),
            params,
            timestamp: Some(unix_now()),
        }
    }

    /// The `module.function` form used in log lines and error messages.
    #[must_use]
    pub fn capability(&self) -> String {
        format!("{}.{}", self.module, self.function)
    }
}

/// One response, paired 1:1 with a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    #[must_use]
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    #[must_use]
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Seconds since the Unix epoch as a float, 0 if the clock is before 1970.
#[must_use]
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
