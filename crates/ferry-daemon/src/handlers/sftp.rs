//! SFTP file-transfer capability (libssh2 engine).
//!
//! A session handle holds an authenticated SSH session plus its SFTP channel
//! and a tracked working directory. libssh2 calls are blocking, so every
//! operation moves onto the blocking thread pool with the session behind a
//! mutex; the transport listener never stalls on a slow remote.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use ferry_proto::ParamMap;
use ferry_types::HandleKind;
use serde_json::{Value, json};

use super::{NativeState, opt_bool, opt_str, opt_u64, require_str, unknown_function};
use crate::error::BridgeError;
use crate::state::AppState;

const DEFAULT_PORT: u16 = 22;
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const DIR_CREATE_MODE: i32 = 0o755;

/// Pooled SFTP session
pub struct SftpState {
    pub host: String,
    inner: Mutex<SftpInner>,
}

struct SftpInner {
    session: ssh2::Session,
    sftp: ssh2::Sftp,
    cwd: String,
}

impl SftpState {
    fn lock(&self) -> MutexGuard<'_, SftpInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Entry point for the `sftp` module.
///
/// # Errors
///
/// Handle errors for dead session ids, execution errors for transport and
/// remote-filesystem failures, invalid-parameter errors for malformed input.
pub async fn handle(
    state: &Arc<AppState>,
    function: &str,
    params: &ParamMap,
) -> Result<Value, BridgeError> {
    match function {
        "new" => new_session(state, params).await,
        "put" => put(state, params).await,
        "get" => get(state, params).await,
        "ls" => ls(state, params).await,
        "mkdir" => mkdir(state, params).await,
        "remove" => remove(state, params).await,
        "rename" => rename(state, params).await,
        "setcwd" => setcwd(state, params).await,
        "cwd" => cwd(state, params),
        "disconnect" => disconnect(state, params).await,
        other => Err(unknown_function("sftp", other)),
    }
}

async fn new_session(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let host = require_str(params, "host")?.to_string();
    let user = require_str(params, "user")?.to_string();
    let port = opt_u64(params, "port")?.unwrap_or(u64::from(DEFAULT_PORT));
    let port = u16::try_from(port)
        .map_err(|_| BridgeError::InvalidParams(format!("port {port} out of range")))?;
    let timeout_secs = opt_u64(params, "timeout")?.unwrap_or(DEFAULT_TIMEOUT_SECS);
    let password = opt_str(params, "password")?.map(String::from);
    let key_file = opt_str(params, "key_file")?.map(String::from);

    let connect_host = host.clone();
    let inner = run_blocking(move || {
        let tcp = TcpStream::connect((connect_host.as_str(), port)).map_err(|e| {
            BridgeError::Execution(format!("connection to {connect_host}:{port} failed: {e}"))
        })?;
        let mut session = ssh2::Session::new()?;
        session.set_tcp_stream(tcp);
        let timeout_ms = u32::try_from(timeout_secs.saturating_mul(1000)).unwrap_or(u32::MAX);
        session.set_timeout(timeout_ms);
        session.handshake()?;

        if let Some(password) = &password {
            session.userauth_password(&user, password)?;
        } else if let Some(key_file) = &key_file {
            session.userauth_pubkey_file(&user, None, Path::new(key_file), None)?;
        } else {
            session.userauth_agent(&user)?;
        }
        if !session.authenticated() {
            return Err(BridgeError::Execution(format!(
                "authentication failed for {user}@{connect_host}"
            )));
        }

        let sftp = session.sftp()?;
        Ok(SftpInner {
            session,
            sftp,
            cwd: ".".to_string(),
        })
    })
    .await?;

    let payload = NativeState::Sftp(Arc::new(SftpState {
        host,
        inner: Mutex::new(inner),
    }));
    let session_id = state.pool.create(HandleKind::SftpSession, payload)?;
    Ok(json!({ "session_id": session_id }))
}

async fn put(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let session_id = require_str(params, "session_id")?;
    let local_file = require_str(params, "local_file")?.to_string();
    let remote_file = require_str(params, "remote_file")?.to_string();
    let session = sftp_state(state, session_id)?;

    let bytes = run_blocking(move || {
        let data = std::fs::read(&local_file)
            .map_err(|e| BridgeError::Execution(format!("cannot read {local_file}: {e}")))?;
        let inner = session.lock();
        let remote = resolve(&inner.cwd, &remote_file);
        let mut file = inner.sftp.create(&remote)?;
        file.write_all(&data)?;
        Ok(data.len())
    })
    .await?;

    state.pool.touch(session_id);
    Ok(json!({ "bytes_transferred": bytes }))
}

async fn get(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let session_id = require_str(params, "session_id")?;
    let remote_file = require_str(params, "remote_file")?.to_string();
    let local_file = require_str(params, "local_file")?.to_string();
    let session = sftp_state(state, session_id)?;

    let bytes = run_blocking(move || {
        let inner = session.lock();
        let remote = resolve(&inner.cwd, &remote_file);
        let mut file = inner.sftp.open(&remote)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        std::fs::write(&local_file, &data)
            .map_err(|e| BridgeError::Execution(format!("cannot write {local_file}: {e}")))?;
        Ok(data.len())
    })
    .await?;

    state.pool.touch(session_id);
    Ok(json!({ "bytes_transferred": bytes }))
}

async fn ls(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let session_id = require_str(params, "session_id")?;
    let remote_dir = opt_str(params, "remote_dir")?.map(String::from);
    let session = sftp_state(state, session_id)?;

    let entries = run_blocking(move || {
        let inner = session.lock();
        let dir = match &remote_dir {
            Some(dir) => resolve(&inner.cwd, dir),
            None => PathBuf::from(&inner.cwd),
        };
        let listing = inner.sftp.readdir(&dir)?;
        let entries: Vec<Value> = listing
            .into_iter()
            .map(|(path, stat)| {
                json!({
                    "name": path.file_name().map_or_else(String::new, |n| n.to_string_lossy().into_owned()),
                    "size": stat.size.unwrap_or(0),
                    "type": if stat.is_dir() { "directory" } else { "file" },
                })
            })
            .collect();
        Ok(entries)
    })
    .await?;

    state.pool.touch(session_id);
    Ok(json!({ "entries": entries }))
}

async fn mkdir(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let session_id = require_str(params, "session_id")?;
    let remote_dir = require_str(params, "remote_dir")?.to_string();
    let session = sftp_state(state, session_id)?;

    let created = run_blocking(move || {
        let inner = session.lock();
        let dir = resolve(&inner.cwd, &remote_dir);
        inner.sftp.mkdir(&dir, DIR_CREATE_MODE)?;
        Ok(dir.to_string_lossy().into_owned())
    })
    .await?;

    state.pool.touch(session_id);
    Ok(json!({ "created": created }))
}

async fn remove(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let session_id = require_str(params, "session_id")?;
    let remote_file = require_str(params, "remote_file")?.to_string();
    let session = sftp_state(state, session_id)?;

    let removed = run_blocking(move || {
        let inner = session.lock();
        let path = resolve(&inner.cwd, &remote_file);
        inner.sftp.unlink(&path)?;
        Ok(path.to_string_lossy().into_owned())
    })
    .await?;

    state.pool.touch(session_id);
    Ok(json!({ "removed": removed }))
}

async fn rename(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let session_id = require_str(params, "session_id")?;
    let old_name = require_str(params, "old_name")?.to_string();
    let new_name = require_str(params, "new_name")?.to_string();
    let overwrite = opt_bool(params, "overwrite")?.unwrap_or(false);
    let session = sftp_state(state, session_id)?;

    let new_name_for_closure = new_name.clone();
    run_blocking(move || {
        let inner = session.lock();
        let old = resolve(&inner.cwd, &old_name);
        let new = resolve(&inner.cwd, &new_name_for_closure);
        if overwrite {
            // Target may not exist; only the rename result matters
            let _ = inner.sftp.unlink(&new);
        }
        inner.sftp.rename(&old, &new, None)?;
        Ok(())
    })
    .await?;

    state.pool.touch(session_id);
    Ok(json!({ "renamed": new_name }))
}

async fn setcwd(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let session_id = require_str(params, "session_id")?;
    let remote_dir = require_str(params, "remote_dir")?.to_string();
    let session = sftp_state(state, session_id)?;

    let new_cwd = run_blocking(move || {
        let mut inner = session.lock();
        let dir = resolve(&inner.cwd, &remote_dir);
        let stat = inner.sftp.stat(&dir)?;
        if !stat.is_dir() {
            return Err(BridgeError::Execution(format!(
                "{} is not a directory",
                dir.display()
            )));
        }
        inner.cwd = dir.to_string_lossy().into_owned();
        Ok(inner.cwd.clone())
    })
    .await?;

    state.pool.touch(session_id);
    Ok(json!({ "cwd": new_cwd }))
}

fn cwd(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let session_id = require_str(params, "session_id")?;
    let session = sftp_state(state, session_id)?;
    let cwd = session.lock().cwd.clone();
    state.pool.touch(session_id);
    Ok(json!({ "cwd": cwd }))
}

async fn disconnect(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let session_id = require_str(params, "session_id")?;
    let session = sftp_state(state, session_id)?;
    state.pool.remove(session_id)?;

    // Polite SSH-level goodbye; the transport closes when the last clone drops
    run_blocking(move || {
        let inner = session.lock();
        let _ = inner
            .session
            .disconnect(None, "session released", None);
        Ok(())
    })
    .await?;

    Ok(json!({ "disconnected": session_id }))
}

/// Relative paths resolve against the session's tracked working directory.
fn resolve(cwd: &str, path: &str) -> PathBuf {
    if path.starts_with('/') {
        PathBuf::from(path)
    } else {
        Path::new(cwd).join(path)
    }
}

fn sftp_state(state: &Arc<AppState>, id: &str) -> Result<Arc<SftpState>, BridgeError> {
    match state.pool.get_kind(id, HandleKind::SftpSession)? {
        NativeState::Sftp(session) => Ok(session),
        _ => Err(BridgeError::Internal(format!(
            "handle {id} tagged sftp-session holds foreign state"
        ))),
    }
}

async fn run_blocking<T, F>(work: F) -> Result<T, BridgeError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, BridgeError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| BridgeError::Internal(format!("blocking task failed: {e}")))?
}
