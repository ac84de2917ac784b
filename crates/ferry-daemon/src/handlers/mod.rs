//! Per-capability request handlers.
//!
//! Each module owns one capability namespace and exposes a uniform entry
//! point: `handle(state, function, params) -> Result<Value, BridgeError>`.
//! The dispatcher routes by module name; handlers read and write the handle
//! pool and touch handles on successful use. The dispatcher stays agnostic
//! to every shape below — it only enforces whitelisting and generic limits.

pub mod crypto;
pub mod database;
pub mod http;
pub mod lockfile;
pub mod sftp;
pub mod system;
pub mod xmldom;

use std::sync::Arc;

use ferry_proto::ParamMap;
use ferry_types::HandleKind;
use serde_json::Value;

use crate::error::BridgeError;

/// Capability-specific payload stored in the handle pool.
///
/// Every variant is `Arc`-backed: handlers clone the inner `Arc` out of the
/// pool before doing real work, so a concurrent removal only defers native
/// teardown to whoever finishes last.
#[derive(Clone)]
pub enum NativeState {
    Database(Arc<database::DatabaseState>),
    Statement(Arc<database::StatementState>),
    Cipher(Arc<crypto::CipherState>),
    Sftp(Arc<sftp::SftpState>),
    Document(Arc<xmldom::DocumentState>),
    LockManager(Arc<lockfile::LockManagerState>),
    Lock(Arc<lockfile::LockState>),
}

impl NativeState {
    /// The pool kind this payload belongs under.
    #[must_use]
    pub fn kind(&self) -> HandleKind {
        match self {
            NativeState::Database(_) => HandleKind::DatabaseConnection,
            NativeState::Statement(_) => HandleKind::PreparedStatement,
            NativeState::Cipher(_) => HandleKind::CipherContext,
            NativeState::Sftp(_) => HandleKind::SftpSession,
            NativeState::Document(_) => HandleKind::DomDocument,
            NativeState::LockManager(_) => HandleKind::LockManager,
            NativeState::Lock(_) => HandleKind::Lock,
        }
    }
}

/// A required string parameter.
pub fn require_str<'a>(params: &'a ParamMap, key: &str) -> Result<&'a str, BridgeError> {
    match params.get(key) {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(BridgeError::InvalidParams(format!(
            "parameter {key} must be a string, got {}",
            type_name(other)
        ))),
        None => Err(BridgeError::missing_param(key)),
    }
}

/// An optional string parameter; present-but-wrong-type is an error.
pub fn opt_str<'a>(params: &'a ParamMap, key: &str) -> Result<Option<&'a str>, BridgeError> {
    match params.get(key) {
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Null) | None => Ok(None),
        Some(other) => Err(BridgeError::InvalidParams(format!(
            "parameter {key} must be a string, got {}",
            type_name(other)
        ))),
    }
}

/// An optional unsigned integer parameter.
pub fn opt_u64(params: &ParamMap, key: &str) -> Result<Option<u64>, BridgeError> {
    match params.get(key) {
        Some(Value::Number(n)) => n.as_u64().map(Some).ok_or_else(|| {
            BridgeError::InvalidParams(format!("parameter {key} must be a non-negative integer"))
        }),
        Some(Value::Null) | None => Ok(None),
        Some(other) => Err(BridgeError::InvalidParams(format!(
            "parameter {key} must be a number, got {}",
            type_name(other)
        ))),
    }
}

/// An optional float parameter (integers accepted).
pub fn opt_f64(params: &ParamMap, key: &str) -> Result<Option<f64>, BridgeError> {
    match params.get(key) {
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::Null) | None => Ok(None),
        Some(other) => Err(BridgeError::InvalidParams(format!(
            "parameter {key} must be a number, got {}",
            type_name(other)
        ))),
    }
}

/// An optional boolean parameter.
pub fn opt_bool(params: &ParamMap, key: &str) -> Result<Option<bool>, BridgeError> {
    match params.get(key) {
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::Null) | None => Ok(None),
        Some(other) => Err(BridgeError::InvalidParams(format!(
            "parameter {key} must be a boolean, got {}",
            type_name(other)
        ))),
    }
}

/// An optional array parameter.
pub fn opt_array<'a>(params: &'a ParamMap, key: &str) -> Result<Option<&'a [Value]>, BridgeError> {
    match params.get(key) {
        Some(Value::Array(items)) => Ok(Some(items)),
        Some(Value::Null) | None => Ok(None),
        Some(other) => Err(BridgeError::InvalidParams(format!(
            "parameter {key} must be an array, got {}",
            type_name(other)
        ))),
    }
}

/// An optional object parameter.
pub fn opt_map<'a>(params: &'a ParamMap, key: &str) -> Result<Option<&'a ParamMap>, BridgeError> {
    match params.get(key) {
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(Value::Null) | None => Ok(None),
        Some(other) => Err(BridgeError::InvalidParams(format!(
            "parameter {key} must be an object, got {}",
            type_name(other)
        ))),
    }
}

/// The standard "no such function in this module" error.
pub fn unknown_function(module: &str, function: &str) -> BridgeError {
    BridgeError::Unauthorized {
        module: module.to_string(),
        function: function.to_string(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> ParamMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("params must be an object"),
        }
    }

    #[test]
    fn test_require_str() {
        let p = params(json!({"name": "value"}));
        assert_eq!(require_str(&p, "name").unwrap(), "value");

        let err = require_str(&p, "missing").unwrap_err();
        assert!(err.to_string().contains("missing required parameter"));

        let p = params(json!({"name": 42}));
        let err = require_str(&p, "name").unwrap_err();
        assert!(err.to_string().contains("must be a string"));
        assert!(err.to_string().contains("number"));
    }

    #[test]
    fn test_opt_str_null_is_absent() {
        let p = params(json!({"a": null}));
        assert_eq!(opt_str(&p, "a").unwrap(), None);
        assert_eq!(opt_str(&p, "b").unwrap(), None);
    }

    #[test]
    fn test_opt_u64() {
        let p = params(json!({"port": 22, "neg": -1, "s": "x"}));
        assert_eq!(opt_u64(&p, "port").unwrap(), Some(22));
        assert!(opt_u64(&p, "neg").is_err());
        assert!(opt_u64(&p, "s").is_err());
        assert_eq!(opt_u64(&p, "absent").unwrap(), None);
    }

    #[test]
    fn test_opt_bool_and_f64() {
        let p = params(json!({"flag": true, "t": 1.5}));
        assert_eq!(opt_bool(&p, "flag").unwrap(), Some(true));
        assert!((opt_f64(&p, "t").unwrap().unwrap() - 1.5).abs() < f64::EPSILON);
        assert!(opt_bool(&p, "t").is_err());
    }

    #[test]
    fn test_opt_array_and_map() {
        let p = params(json!({"items": [1, 2], "opts": {"a": 1}}));
        assert_eq!(opt_array(&p, "items").unwrap().unwrap().len(), 2);
        assert_eq!(opt_map(&p, "opts").unwrap().unwrap().len(), 1);
        assert!(opt_array(&p, "opts").is_err());
        assert!(opt_map(&p, "items").is_err());
    }

    #[test]
    fn test_unknown_function_is_fail_closed() {
        let err = unknown_function("crypto", "sign");
        assert!(err.to_string().contains("not allowed"));
    }
}
