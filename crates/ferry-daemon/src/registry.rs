//! Capability registry: the closed-world whitelist.
//!
//! Maps `(module, function)` pairs to an allow decision. Anything absent is
//! denied — there is no pattern matching and no blacklist. The registry is
//! built once at startup and immutable afterwards, so authorization needs no
//! locking.
//!
//! `test.ping` is special: always authorized regardless of configuration, so
//! liveness probes keep working even with a stripped-down whitelist.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::BridgeError;

/// Default capability surface shipped with the daemon
const DEFAULT_CAPABILITIES: &[(&str, &[&str])] = &[
    ("test", &["ping"]),
    (
        "system",
        &[
            "health",
            "performance",
            "connections",
            "metrics",
            "stats",
            "cleanup",
            "info",
            "shutdown",
        ],
    ),
    (
        "database",
        &[
            "connect",
            "disconnect",
            "prepare",
            "execute_statement",
            "fetch_row",
            "fetch_all",
            "execute_immediate",
            "begin_transaction",
            "commit",
            "rollback",
            "finish_statement",
        ],
    ),
    ("http", &["lwp_request"]),
    ("crypto", &["new", "encrypt", "decrypt", "cleanup_cipher"]),
    (
        "sftp",
        &[
            "new",
            "put",
            "get",
            "ls",
            "mkdir",
            "remove",
            "rename",
            "setcwd",
            "cwd",
            "disconnect",
        ],
    ),
    (
        "xmldom",
        &[
            "parse_string",
            "parse_file",
            "get_document_root",
            "get_elements_by_tag_name",
            "get_child_nodes",
            "get_attribute",
            "set_attribute",
            "has_attribute",
            "remove_attribute",
            "get_text_contents",
            "get_tag_name",
            "create_element",
            "create_text_node",
            "append_child",
            "remove_child",
            "to_string",
            "dispose_document",
        ],
    ),
    (
        "lockfile",
        &["make", "trylock", "release", "cleanup_manager"],
    ),
];

/// Immutable whitelist of `(module, function)` capabilities
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    modules: BTreeMap<String, BTreeSet<String>>,
}

impl CapabilityRegistry {
    /// Empty registry: everything except `test.ping` is denied.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the daemon's full default capability surface.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for (module, functions) in DEFAULT_CAPABILITIES {
            for function in *functions {
                registry.allow(module, function);
            }
        }
        registry
    }

    /// Whitelist one capability. Builder-time only; the registry is frozen
    /// once it moves into the daemon state.
    pub fn allow(&mut self, module: &str, function: &str) {
        self.modules
            .entry(module.to_string())
            .or_default()
            .insert(function.to_string());
    }

    /// Fail-closed authorization check.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Unauthorized` for any pair not present in the
    /// whitelist. `test.ping` never fails.
    pub fn authorize(&self, module: &str, function: &str) -> Result<(), BridgeError> {
        if module == "test" && function == "ping" {
            return Ok(());
        }
        let allowed = self
            .modules
            .get(module)
            .is_some_and(|functions| functions.contains(function));
        if allowed {
            Ok(())
        } else {
            Err(BridgeError::Unauthorized {
                module: module.to_string(),
                function: function.to_string(),
            })
        }
    }

    /// Whitelisted module names, for introspection output.
    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    /// Total number of whitelisted `(module, function)` pairs.
    #[must_use]
    pub fn capability_count(&self) -> usize {
        self.modules.values().map(BTreeSet::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_every_capability_module() {
        let registry = CapabilityRegistry::with_defaults();
        let modules: Vec<&str> = registry.modules().collect();
        for expected in ["test", "system", "database", "http", "crypto", "sftp", "xmldom", "lockfile"]
        {
            assert!(modules.contains(&expected), "missing module {expected}");
        }
    }

    #[test]
    fn test_whitelisted_pair_is_authorized() {
        let registry = CapabilityRegistry::with_defaults();
        assert!(registry.authorize("database", "connect").is_ok());
        assert!(registry.authorize("crypto", "encrypt").is_ok());
        assert!(registry.authorize("system", "cleanup").is_ok());
    }

    #[test]
    fn test_unknown_function_is_denied() {
        let registry = CapabilityRegistry::with_defaults();
        let err = registry
            .authorize("database", "malicious_function")
            .unwrap_err();
        assert!(err.to_string().to_lowercase().contains("not allowed"));
    }

    #[test]
    fn test_unknown_module_is_denied() {
        let registry = CapabilityRegistry::with_defaults();
        assert!(registry.authorize("exec", "run").is_err());
        assert!(registry.authorize("", "").is_err());
    }

    #[test]
    fn test_fail_closed_on_empty_registry() {
        let registry = CapabilityRegistry::new();
        assert!(registry.authorize("database", "connect").is_err());
        assert!(registry.authorize("system", "health").is_err());
    }

    #[test]
    fn test_ping_always_authorized() {
        // Even an empty registry lets the liveness probe through
        let registry = CapabilityRegistry::new();
        assert!(registry.authorize("test", "ping").is_ok());
    }

    #[test]
    fn test_allow_extends_whitelist() {
        let mut registry = CapabilityRegistry::new();
        registry.allow("custom", "operation");
        assert!(registry.authorize("custom", "operation").is_ok());
        assert!(registry.authorize("custom", "other").is_err());
    }

    #[test]
    fn test_capability_count() {
        let mut registry = CapabilityRegistry::new();
        assert_eq!(registry.capability_count(), 0);
        registry.allow("a", "x");
        registry.allow("a", "y");
        registry.allow("b", "x");
        assert_eq!(registry.capability_count(), 3);
    }

    #[test]
    fn test_function_names_do_not_leak_across_modules() {
        let registry = CapabilityRegistry::with_defaults();
        // `new` exists for crypto and sftp, but not for database
        assert!(registry.authorize("crypto", "new").is_ok());
        assert!(registry.authorize("sftp", "new").is_ok());
        assert!(registry.authorize("database", "new").is_err());
    }
}
