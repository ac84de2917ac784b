//! Generic pool of stateful handles.
//!
//! Every server-side resource — database connections, prepared statements,
//! cipher contexts, SFTP sessions, DOM documents, lock managers, locks —
//! lives in one `HandlePool` keyed by an opaque uuid, tagged with a
//! [`HandleKind`], and stamped with creation and last-use instants.
//!
//! Ids are unique for the lifetime of the daemon and never reused: once a
//! handle is removed, later lookups fail with "handle not found" instead of
//! resurrecting state. Payloads are expected to be `Arc`-backed clones, so a
//! removal that races an in-flight operation only drops the pool's reference;
//! the native resource is torn down when the last user lets go.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use ferry_types::{HandleInfo, HandleKind, PoolStats, ReapedHandle};
use uuid::Uuid;

use crate::error::BridgeError;

/// Metadata wrapper around a pooled payload
#[derive(Debug)]
pub struct HandleEntry<P> {
    pub kind: HandleKind,
    pub payload: P,
    pub created_at: Instant,
    pub last_used: Instant,
}

/// Concurrency-safe keyed store of opaque stateful resources
#[derive(Debug)]
pub struct HandlePool<P> {
    entries: RwLock<HashMap<String, HandleEntry<P>>>,
    max_handles: usize,
}

impl<P: Clone> HandlePool<P> {
    #[must_use]
    pub fn new(max_handles: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_handles,
        }
    }

    /// Allocate a fresh unique id and store the payload under it.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::PoolExhausted` at the saturation cap; the
    /// daemon keeps serving and the condition shows up in health checks.
    pub fn create(&self, kind: HandleKind, payload: P) -> Result<String, BridgeError> {
        let mut entries = write_lock(&self.entries);
        if entries.len() >= self.max_handles {
            return Err(BridgeError::PoolExhausted {
                current: entries.len(),
                max: self.max_handles,
            });
        }
        let id = Uuid::new_v4().to_string();
        let now = Instant::now();
        entries.insert(
            id.clone(),
            HandleEntry {
                kind,
                payload,
                created_at: now,
                last_used: now,
            },
        );
        Ok(id)
    }

    /// Look up a handle without touching it.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::HandleNotFound` for unknown ids.
    pub fn get(&self, id: &str) -> Result<(HandleKind, P), BridgeError> {
        let entries = read_lock(&self.entries);
        entries
            .get(id)
            .map(|e| (e.kind, e.payload.clone()))
            .ok_or_else(|| BridgeError::HandleNotFound(id.to_string()))
    }

    /// Look up a handle and verify its kind, without touching it.
    ///
    /// # Errors
    ///
    /// `BridgeError::HandleNotFound` for unknown ids,
    /// `BridgeError::WrongKind` when the id exists under another kind.
    pub fn get_kind(&self, id: &str, expected: HandleKind) -> Result<P, BridgeError> {
        let (kind, payload) = self.get(id)?;
        if kind == expected {
            Ok(payload)
        } else {
            Err(BridgeError::WrongKind {
                id: id.to_string(),
                expected,
                actual: kind,
            })
        }
    }

    /// Reset the idle clock of a handle. Returns false for unknown ids.
    pub fn touch(&self, id: &str) -> bool {
        let mut entries = write_lock(&self.entries);
        match entries.get_mut(id) {
            Some(entry) => {
                entry.last_used = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Remove a handle, returning its payload so the caller controls where
    /// native teardown (the final drop) happens.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::HandleNotFound` for unknown ids.
    pub fn remove(&self, id: &str) -> Result<(HandleKind, P), BridgeError> {
        let mut entries = write_lock(&self.entries);
        entries
            .remove(id)
            .map(|e| (e.kind, e.payload))
            .ok_or_else(|| BridgeError::HandleNotFound(id.to_string()))
    }

    /// Remove every handle matching the predicate (e.g. statements owned by
    /// a closing connection). Returns the removed payloads.
    pub fn remove_where(&self, pred: impl Fn(&HandleEntry<P>) -> bool) -> Vec<(String, P)> {
        let mut entries = write_lock(&self.entries);
        let ids: Vec<String> = entries
            .iter()
            .filter(|(_, e)| pred(e))
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| entries.remove(&id).map(|e| (id, e.payload)))
            .collect()
    }

    /// Remove every handle whose contiguous idle interval exceeds its kind's
    /// threshold. The check and the removal happen under one write lock, so
    /// a concurrent touch either lands before the check (handle survives) or
    /// fails after removal.
    pub fn reap_idle(
        &self,
        threshold_for: impl Fn(HandleKind) -> Duration,
    ) -> Vec<(ReapedHandle, P)> {
        let now = Instant::now();
        let mut entries = write_lock(&self.entries);
        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_used) > threshold_for(e.kind))
            .map(|(id, _)| id.clone())
            .collect();
        stale
            .into_iter()
            .filter_map(|id| {
                entries.remove(&id).map(|e| {
                    (
                        ReapedHandle {
                            id,
                            kind: e.kind,
                            idle_secs: now.duration_since(e.last_used).as_secs_f64(),
                        },
                        e.payload,
                    )
                })
            })
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        read_lock(&self.entries).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        read_lock(&self.entries).is_empty()
    }

    /// Snapshot of the pool: totals, per-kind counts, per-handle ages.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let now = Instant::now();
        let entries = read_lock(&self.entries);
        let mut per_kind: HashMap<String, usize> = HashMap::new();
        let mut handles = Vec::with_capacity(entries.len());
        for (id, entry) in entries.iter() {
            *per_kind.entry(entry.kind.as_str().to_string()).or_default() += 1;
            handles.push(HandleInfo {
                id: id.clone(),
                kind: entry.kind,
                age_secs: now.duration_since(entry.created_at).as_secs_f64(),
                idle_secs: now.duration_since(entry.last_used).as_secs_f64(),
            });
        }
        PoolStats {
            total: entries.len(),
            per_kind,
            handles,
        }
    }

    /// Longest idle interval across the pool, if any handles exist.
    #[must_use]
    pub fn max_idle(&self) -> Option<Duration> {
        let now = Instant::now();
        let entries = read_lock(&self.entries);
        entries
            .values()
            .map(|e| now.duration_since(e.last_used))
            .max()
    }
}

// A poisoned lock means a panic mid-mutation; the map itself stays
// structurally sound, so recover the guard rather than cascade the panic.
fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
