//! Input-shape validation.
//!
//! The legacy clients pass arbitrary nested hash/array structures, so the
//! validator recurses generically over `serde_json::Value` without knowing
//! any capability's shape: string length, collection length, nesting depth,
//! and flattened value count are each capped. Runs before the handler,
//! side-effect free.

use ferry_types::ShapeLimits;
use serde_json::Value;

use crate::error::BridgeError;
use ferry_proto::ParamMap;

/// Check a parameter map against the configured limits.
///
/// # Errors
///
/// Returns `BridgeError::Validation` naming the first violated limit.
pub fn validate(params: &ParamMap, limits: &ShapeLimits) -> Result<(), BridgeError> {
    if params.len() > limits.max_collection_len {
        return Err(BridgeError::Validation(format!(
            "params has {} entries (max: {})",
            params.len(),
            limits.max_collection_len
        )));
    }
    let mut count = 0usize;
    for (key, value) in params {
        check_string(key, limits)?;
        check_value(value, limits, 2, &mut count)?;
    }
    Ok(())
}

fn check_value(
    value: &Value,
    limits: &ShapeLimits,
    depth: usize,
    count: &mut usize,
) -> Result<(), BridgeError> {
    if depth > limits.max_depth {
        return Err(BridgeError::Validation(format!(
            "nesting depth exceeds {}",
            limits.max_depth
        )));
    }
    *count += 1;
    if *count > limits.max_params {
        return Err(BridgeError::Validation(format!(
            "flattened parameter count exceeds {}",
            limits.max_params
        )));
    }

    match value {
        Value::String(s) => check_string(s, limits),
        Value::Array(items) => {
            if items.len() > limits.max_collection_len {
                return Err(BridgeError::Validation(format!(
                    "array has {} elements (max: {})",
                    items.len(),
                    limits.max_collection_len
                )));
            }
            for item in items {
                check_value(item, limits, depth + 1, count)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            if map.len() > limits.max_collection_len {
                return Err(BridgeError::Validation(format!(
                    "object has {} entries (max: {})",
                    map.len(),
                    limits.max_collection_len
                )));
            }
            for (key, item) in map {
                check_string(key, limits)?;
                check_value(item, limits, depth + 1, count)?;
            }
            Ok(())
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => Ok(()),
    }
}

fn check_string(s: &str, limits: &ShapeLimits) -> Result<(), BridgeError> {
    if s.len() > limits.max_string_len {
        return Err(BridgeError::Validation(format!(
            "string of {} bytes exceeds max length {}",
            s.len(),
            limits.max_string_len
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> ParamMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("test params must be an object"),
        }
    }

    fn tight_limits() -> ShapeLimits {
        ShapeLimits {
            max_string_len: 16,
            max_collection_len: 4,
            max_depth: 3,
            max_params: 10,
        }
    }

    #[test]
    fn test_empty_params_pass() {
        assert!(validate(&ParamMap::new(), &tight_limits()).is_ok());
    }

    #[test]
    fn test_simple_params_pass() {
        let p = params(json!({"host": "db1", "port": 1521, "ssl": true, "extra": null}));
        assert!(validate(&p, &tight_limits()).is_ok());
    }

    #[test]
    fn test_oversized_string_rejected() {
        let p = params(json!({"sql": "select * from a_rather_long_table_name"}));
        let err = validate(&p, &tight_limits()).unwrap_err();
        assert!(err.to_string().contains("max length"));
    }

    #[test]
    fn test_oversized_key_rejected() {
        let p = params(json!({"a_key_name_that_is_far_too_long": 1}));
        assert!(validate(&p, &tight_limits()).is_err());
    }

    #[test]
    fn test_oversized_array_rejected() {
        let p = params(json!({"values": [1, 2, 3, 4, 5]}));
        let err = validate(&p, &tight_limits()).unwrap_err();
        assert!(err.to_string().contains("elements"));
    }

    #[test]
    fn test_excess_depth_rejected() {
        // params map is depth 1, so {"a": {"b": {"c": 1}}} bottoms out at 4
        let p = params(json!({"a": {"b": {"c": 1}}}));
        let err = validate(&p, &tight_limits()).unwrap_err();
        assert!(err.to_string().contains("depth"));
    }

    #[test]
    fn test_depth_at_limit_passes() {
        let p = params(json!({"a": {"b": 1}}));
        assert!(validate(&p, &tight_limits()).is_ok());
    }

    #[test]
    fn test_flattened_count_rejected() {
        // 4 top-level entries, each an array of 3 = 16 values total
        let p = params(json!({
            "a": [1, 2, 3],
            "b": [1, 2, 3],
            "c": [1, 2, 3],
            "d": [1, 2, 3],
        }));
        let err = validate(&p, &tight_limits()).unwrap_err();
        assert!(err.to_string().contains("parameter count"));
    }

    #[test]
    fn test_validation_has_no_side_effects() {
        let p = params(json!({"a": [1, 2, 3, 4, 5]}));
        let before = serde_json::to_string(&p).unwrap();
        let _ = validate(&p, &tight_limits());
        assert_eq!(serde_json::to_string(&p).unwrap(), before);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        // Values built within the limits below never trip the validator
        fn small_value(depth: u32) -> BoxedStrategy<Value> {
            let leaf: BoxedStrategy<Value> = prop_oneof![
                Just(Value::Null),
                any::<bool>().prop_map(Value::Bool),
                any::<i32>().prop_map(|n| json!(n)),
                "[a-z]{0,8}".prop_map(Value::String),
            ]
            .boxed();
            if depth == 0 {
                leaf
            } else {
                prop_oneof![
                    leaf.clone(),
                    proptest::collection::vec(small_value(depth - 1), 0..3)
                        .prop_map(Value::Array),
                    proptest::collection::btree_map("[a-z]{1,6}", small_value(depth - 1), 0..3)
                        .prop_map(|m| Value::Object(m.into_iter().collect())),
                ]
                .boxed()
            }
        }

        proptest! {
            #[test]
            fn in_bounds_values_always_pass(value in small_value(3)) {
                let mut map = ParamMap::new();
                map.insert("v".to_string(), value);
                let limits = ShapeLimits {
                    max_string_len: 64,
                    max_collection_len: 16,
                    max_depth: 8,
                    max_params: 10_000,
                };
                prop_assert!(validate(&map, &limits).is_ok());
            }

            #[test]
            fn strings_over_limit_always_fail(len in 65usize..256) {
                let mut map = ParamMap::new();
                map.insert("v".to_string(), Value::String("x".repeat(len)));
                let limits = ShapeLimits {
                    max_string_len: 64,
                    max_collection_len: 16,
                    max_depth: 8,
                    max_params: 10_000,
                };
                prop_assert!(validate(&map, &limits).is_err());
            }
        }
    }
}
