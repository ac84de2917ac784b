//! File-locking capability.
//!
//! A lock manager is a pooled handle carrying hold/delay configuration; each
//! acquired lock is its own pooled handle backed by a lockfile on disk,
//! created atomically with `O_CREAT|O_EXCL` semantics and holding the daemon
//! pid. Stale locks — files older than the manager's hold time — are broken
//! before a retry. Dropping a lock payload (release, manager cleanup, or the
//! reaper) removes its file, so locks never outlive their handles.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use ferry_proto::ParamMap;
use ferry_types::HandleKind;
use serde_json::{Value, json};
use tracing::debug;

use super::{NativeState, opt_str, opt_u64, require_str, unknown_function};
use crate::error::BridgeError;
use crate::state::AppState;

const DEFAULT_HOLD_SECS: u64 = 90;
const DEFAULT_DELAY_SECS: u64 = 1;

/// Pooled lock manager: configuration plus the locks it has issued
pub struct LockManagerState {
    pub hold: Duration,
    pub delay: Duration,
    pub max_wait: Option<Duration>,
    issued: Mutex<Vec<String>>,
}

impl LockManagerState {
    fn issued(&self) -> MutexGuard<'_, Vec<String>> {
        self.issued
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Pooled held lock; the file disappears when the payload drops
pub struct LockState {
    pub filename: String,
    pub lockfile_path: PathBuf,
}

impl Drop for LockState {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.lockfile_path) {
            debug!(
                "lockfile {} already gone on release: {}",
                self.lockfile_path.display(),
                e
            );
        }
    }
}

/// Entry point for the `lockfile` module.
///
/// # Errors
///
/// Handle errors for dead manager/lock ids, execution errors for contended
/// or unwritable lockfiles, invalid-parameter errors otherwise.
// Uniform handler interface; the other capability modules genuinely await
#[allow(clippy::unused_async)]
pub async fn handle(
    state: &Arc<AppState>,
    function: &str,
    params: &ParamMap,
) -> Result<Value, BridgeError> {
    match function {
        "make" => make(state, params),
        "trylock" => trylock(state, params),
        "release" => release(state, params),
        "cleanup_manager" => cleanup_manager(state, params),
        other => Err(unknown_function("lockfile", other)),
    }
}

fn make(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    // max_age is the deprecated alias for hold
    let hold = opt_u64(params, "hold")?
        .or(opt_u64(params, "max_age")?)
        .unwrap_or(DEFAULT_HOLD_SECS);
    let delay = opt_u64(params, "delay")?.unwrap_or(DEFAULT_DELAY_SECS);
    let max_wait = opt_u64(params, "max_wait")?.map(Duration::from_secs);

    let payload = NativeState::LockManager(Arc::new(LockManagerState {
        hold: Duration::from_secs(hold),
        delay: Duration::from_secs(delay),
        max_wait,
        issued: Mutex::new(Vec::new()),
    }));
    let manager_id = state.pool.create(HandleKind::LockManager, payload)?;

    Ok(json!({ "manager_id": manager_id, "hold": hold }))
}

fn trylock(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let manager_id = require_str(params, "manager_id")?;
    let filename = require_str(params, "filename")?;
    let manager = manager_state(state, manager_id)?;

    let lockfile_path = match opt_str(params, "lockfile_pattern")? {
        Some(pattern) => PathBuf::from(pattern.replace("%F", filename)),
        None => PathBuf::from(format!("{filename}.lock")),
    };

    if let Some(parent) = lockfile_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| {
                BridgeError::Execution(format!("cannot create lock directory: {e}"))
            })?;
        }
    }

    break_if_stale(&lockfile_path, manager.hold);

    if let Err(first) = create_lockfile(&lockfile_path) {
        if first.kind() != std::io::ErrorKind::AlreadyExists {
            return Err(BridgeError::Execution(format!(
                "could not acquire lock on {filename}: {first}"
            )));
        }
        // Lost the race or the lock went stale between check and create
        break_if_stale(&lockfile_path, manager.hold);
        if let Err(e) = create_lockfile(&lockfile_path) {
            let _ = e;
            return Err(BridgeError::Execution(format!(
                "could not acquire lock on {filename}: lock file exists"
            )));
        }
    }

    let payload = NativeState::Lock(Arc::new(LockState {
        filename: filename.to_string(),
        lockfile_path: lockfile_path.clone(),
    }));
    let lock_id = match state.pool.create(HandleKind::Lock, payload) {
        Ok(id) => id,
        Err(e) => {
            // Saturated pool: do not leave an orphan lockfile behind
            let _ = std::fs::remove_file(&lockfile_path);
            return Err(e);
        }
    };
    manager.issued().push(lock_id.clone());
    state.pool.touch(manager_id);

    Ok(json!({
        "lock_id": lock_id,
        "filename": filename,
        "lockfile": lockfile_path.to_string_lossy(),
    }))
}

fn release(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let lock_id = require_str(params, "lock_id")?;
    let NativeState::Lock(lock) = state.pool.get_kind(lock_id, HandleKind::Lock)? else {
        return Err(BridgeError::Internal(format!(
            "handle {lock_id} tagged lock holds foreign state"
        )));
    };
    let lockfile = lock.lockfile_path.to_string_lossy().into_owned();
    state.pool.remove(lock_id)?;
    drop(lock); // removes the file once the last user lets go

    Ok(json!({ "released": lock_id, "lockfile": lockfile }))
}

fn cleanup_manager(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let manager_id = require_str(params, "manager_id")?;
    let manager = manager_state(state, manager_id)?;

    let issued: Vec<String> = manager.issued().drain(..).collect();
    let mut released = 0usize;
    for lock_id in issued {
        if state.pool.remove(&lock_id).is_ok() {
            released += 1;
        }
    }
    state.pool.remove(manager_id)?;

    Ok(json!({ "released_locks": released, "manager_id": manager_id }))
}

fn create_lockfile(path: &Path) -> std::io::Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    write!(file, "{}", std::process::id())?;
    Ok(())
}

/// Remove a lockfile whose age exceeds the hold time. Failure to remove
/// means another process won the race; the subsequent create reports that.
fn break_if_stale(path: &Path, hold: Duration) {
    let Ok(metadata) = std::fs::metadata(path) else {
        return;
    };
    let age = metadata
        .modified()
        .ok()
        .and_then(|mtime| SystemTime::now().duration_since(mtime).ok());
    if age.is_some_and(|age| age > hold) {
        debug!("breaking stale lockfile {}", path.display());
        let _ = std::fs::remove_file(path);
    }
}

fn manager_state(state: &Arc<AppState>, id: &str) -> Result<Arc<LockManagerState>, BridgeError> {
    match state.pool.get_kind(id, HandleKind::LockManager)? {
        NativeState::LockManager(manager) => Ok(manager),
        _ => Err(BridgeError::Internal(format!(
            "handle {id} tagged lock-manager holds foreign state"
        ))),
    }
}
