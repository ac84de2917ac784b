//! Relational database capability (SQLite engine).
//!
//! Connections and prepared statements are both pooled handles. A statement
//! handle stores its SQL and owner connection; the underlying cursor only
//! materializes on execute, which buffers the full result set into the
//! handle so `fetch_row`/`fetch_all` never hold a borrow of the connection.
//! Re-executing a valid statement re-runs it and replaces the buffer;
//! executing a missing statement id fails fast with "handle not found" —
//! there is no silent re-prepare.
//!
//! All engine calls run on the blocking thread pool; the connection sits
//! behind a mutex because SQLite connections are single-threaded.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use ferry_proto::ParamMap;
use ferry_types::HandleKind;
use rusqlite::types::ValueRef;
use serde_json::{Value, json};

use super::{NativeState, opt_array, opt_map, opt_str, require_str, unknown_function};
use crate::error::BridgeError;
use crate::state::AppState;

/// Pooled database connection
pub struct DatabaseState {
    conn: Mutex<rusqlite::Connection>,
    autocommit: AtomicBool,
    pub dsn: String,
}

impl DatabaseState {
    fn lock(&self) -> MutexGuard<'_, rusqlite::Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Pooled prepared statement: SQL plus the buffered result of its most
/// recent execution.
pub struct StatementState {
    pub connection_id: String,
    pub sql: String,
    inner: Mutex<StatementInner>,
}

#[derive(Default)]
struct StatementInner {
    executed: bool,
    finished: bool,
    columns: Vec<String>,
    rows: VecDeque<Vec<Value>>,
}

impl StatementState {
    fn lock(&self) -> MutexGuard<'_, StatementInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

struct ExecOutcome {
    columns: Vec<String>,
    rows: VecDeque<Vec<Value>>,
    rows_affected: usize,
}

/// Entry point for the `database` module.
///
/// # Errors
///
/// Handle errors for dead connection/statement ids, execution errors from
/// the SQL engine, invalid-parameter errors for malformed input.
pub async fn handle(
    state: &Arc<AppState>,
    function: &str,
    params: &ParamMap,
) -> Result<Value, BridgeError> {
    match function {
        "connect" => connect(state, params).await,
        "disconnect" => disconnect(state, params),
        "prepare" => prepare(state, params),
        "execute_statement" => execute_statement(state, params).await,
        "fetch_row" => fetch_row(state, params),
        "fetch_all" => fetch_all(state, params),
        "execute_immediate" => execute_immediate(state, params).await,
        "begin_transaction" => transaction_control(state, params, "BEGIN").await,
        "commit" => transaction_control(state, params, "COMMIT").await,
        "rollback" => transaction_control(state, params, "ROLLBACK").await,
        "finish_statement" => finish_statement(state, params),
        other => Err(unknown_function("database", other)),
    }
}

async fn connect(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let dsn = require_str(params, "dsn")?.to_string();
    // Accepted for DSN-shape compatibility; SQLite has no credentials
    let _ = opt_str(params, "username")?;
    let _ = opt_str(params, "password")?;
    let autocommit = opt_map(params, "options")?
        .and_then(|o| o.get("AutoCommit"))
        .and_then(Value::as_bool)
        .unwrap_or(true);

    let path = parse_dsn(&dsn)?;
    let conn = run_blocking(move || {
        rusqlite::Connection::open(&path).map_err(BridgeError::from)
    })
    .await?;

    let payload = NativeState::Database(Arc::new(DatabaseState {
        conn: Mutex::new(conn),
        autocommit: AtomicBool::new(autocommit),
        dsn,
    }));
    let connection_id = state.pool.create(HandleKind::DatabaseConnection, payload)?;

    Ok(json!({
        "connection_id": connection_id,
        "db_type": "sqlite",
    }))
}

fn disconnect(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let connection_id = require_str(params, "connection_id")?;
    state
        .pool
        .get_kind(connection_id, HandleKind::DatabaseConnection)?;

    // Statements are owned by their connection; drop them together
    let dropped = state.pool.remove_where(|entry| {
        matches!(&entry.payload, NativeState::Statement(s) if s.connection_id == connection_id)
    });
    state.pool.remove(connection_id)?;

    Ok(json!({
        "disconnected": connection_id,
        "statements_closed": dropped.len(),
    }))
}

fn prepare(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let connection_id = require_str(params, "connection_id")?;
    let sql = require_str(params, "sql")?;
    state
        .pool
        .get_kind(connection_id, HandleKind::DatabaseConnection)?;

    let payload = NativeState::Statement(Arc::new(StatementState {
        connection_id: connection_id.to_string(),
        sql: sql.to_string(),
        inner: Mutex::new(StatementInner::default()),
    }));
    let statement_id = state.pool.create(HandleKind::PreparedStatement, payload)?;
    state.pool.touch(connection_id);

    Ok(json!({ "statement_id": statement_id }))
}

async fn execute_statement(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let connection_id = require_str(params, "connection_id")?;
    let statement_id = require_str(params, "statement_id")?;
    let binds = bind_values(params)?;

    let stmt = statement_state(state, statement_id)?;
    if stmt.connection_id != connection_id {
        return Err(BridgeError::InvalidParams(format!(
            "statement {statement_id} belongs to a different connection"
        )));
    }
    let db = database_state(state, &stmt.connection_id)?;

    let sql = stmt.sql.clone();
    let ExecOutcome {
        columns,
        rows,
        rows_affected,
    } = run_blocking(move || execute_sql(&db, &sql, &binds)).await?;

    let column_info = if columns.is_empty() {
        Value::Null
    } else {
        json!({
            "count": columns.len(),
            "names": &columns,
        })
    };

    {
        let mut inner = stmt.lock();
        inner.executed = true;
        inner.finished = false;
        inner.columns = columns;
        inner.rows = rows;
    }

    state.pool.touch(statement_id);
    state.pool.touch(connection_id);

    Ok(json!({
        "rows_affected": rows_affected,
        "column_info": column_info,
    }))
}

fn fetch_row(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let statement_id = require_str(params, "statement_id")?;
    let format = opt_str(params, "format")?.unwrap_or("array");
    let stmt = statement_state(state, statement_id)?;

    let row = {
        let mut inner = stmt.lock();
        if !inner.executed {
            return Err(BridgeError::Execution("statement not executed".to_string()));
        }
        if inner.finished {
            None
        } else {
            match inner.rows.pop_front() {
                Some(row) => Some(format_row(row, &inner.columns, format)),
                None => {
                    inner.finished = true;
                    None
                }
            }
        }
    };

    state.pool.touch(statement_id);
    Ok(json!({ "row": row }))
}

fn fetch_all(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let statement_id = require_str(params, "statement_id")?;
    let format = opt_str(params, "format")?.unwrap_or("array");
    let stmt = statement_state(state, statement_id)?;

    let rows: Vec<Value> = {
        let mut inner = stmt.lock();
        if !inner.executed {
            return Err(BridgeError::Execution("statement not executed".to_string()));
        }
        inner.finished = true;
        let columns = inner.columns.clone();
        inner
            .rows
            .drain(..)
            .map(|row| format_row(row, &columns, format))
            .collect()
    };

    state.pool.touch(statement_id);
    Ok(json!({ "rows": rows }))
}

async fn execute_immediate(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let connection_id = require_str(params, "connection_id")?;
    let sql = require_str(params, "sql")?.to_string();
    let binds = bind_values(params)?;
    let db = database_state(state, connection_id)?;

    let rows_affected = run_blocking(move || {
        let conn = db.lock();
        let affected = conn
            .execute(&sql, rusqlite::params_from_iter(binds.iter()))
            .map_err(BridgeError::from)?;
        Ok(affected)
    })
    .await?;

    state.pool.touch(connection_id);
    Ok(json!({ "rows_affected": rows_affected }))
}

async fn transaction_control(
    state: &Arc<AppState>,
    params: &ParamMap,
    verb: &'static str,
) -> Result<Value, BridgeError> {
    let connection_id = require_str(params, "connection_id")?;
    let db = database_state(state, connection_id)?;

    let flag = Arc::clone(&db);
    run_blocking(move || {
        let conn = flag.lock();
        conn.execute_batch(verb).map_err(BridgeError::from)
    })
    .await?;

    db.autocommit.store(verb != "BEGIN", Ordering::Relaxed);
    state.pool.touch(connection_id);
    Ok(json!({ "completed": verb.to_lowercase() }))
}

fn finish_statement(state: &Arc<AppState>, params: &ParamMap) -> Result<Value, BridgeError> {
    let statement_id = require_str(params, "statement_id")?;
    state
        .pool
        .get_kind(statement_id, HandleKind::PreparedStatement)?;
    state.pool.remove(statement_id)?;
    Ok(json!({ "finished": statement_id }))
}

fn execute_sql(
    db: &DatabaseState,
    sql: &str,
    binds: &[rusqlite::types::Value],
) -> Result<ExecOutcome, BridgeError> {
    let conn = db.lock();
    let mut stmt = conn.prepare(sql)?;
    let column_count = stmt.column_count();
    let columns: Vec<String> = stmt
        .column_names()
        .iter()
        .map(|name| (*name).to_string())
        .collect();

    if column_count == 0 {
        let rows_affected = stmt.execute(rusqlite::params_from_iter(binds.iter()))?;
        Ok(ExecOutcome {
            columns: Vec::new(),
            rows: VecDeque::new(),
            rows_affected,
        })
    } else {
        let mut query = stmt.query(rusqlite::params_from_iter(binds.iter()))?;
        let mut rows = VecDeque::new();
        while let Some(row) = query.next()? {
            let mut values = Vec::with_capacity(column_count);
            for i in 0..column_count {
                values.push(from_sql_ref(row.get_ref(i)?));
            }
            rows.push_back(values);
        }
        let rows_affected = rows.len();
        Ok(ExecOutcome {
            columns,
            rows,
            rows_affected,
        })
    }
}

/// Parse a DBI-flavored DSN down to a SQLite path.
///
/// Accepted: `dbi:SQLite:dbname=/path`, `dbi:SQLite:/path`, `dbi:SQLite:`
/// (in-memory), a bare path, or `:memory:`.
fn parse_dsn(dsn: &str) -> Result<String, BridgeError> {
    let lowered = dsn.to_ascii_lowercase();
    let Some(rest_len) = lowered.strip_prefix("dbi:").map(str::len) else {
        return Ok(dsn.to_string());
    };
    let rest = &dsn[dsn.len() - rest_len..];
    let (driver, info) = rest
        .split_once(':')
        .ok_or_else(|| BridgeError::InvalidParams(format!("malformed DSN: {dsn}")))?;
    if !driver.eq_ignore_ascii_case("sqlite") {
        return Err(BridgeError::Execution(format!(
            "only SQLite databases are supported, got: {driver}"
        )));
    }
    if info.is_empty() {
        return Ok(":memory:".to_string());
    }
    if info.contains('=') {
        for segment in info.split(';') {
            if let Some((key, value)) = segment.split_once('=') {
                if key.eq_ignore_ascii_case("dbname") || key.eq_ignore_ascii_case("database") {
                    return Ok(value.to_string());
                }
            }
        }
        return Err(BridgeError::InvalidParams(format!(
            "DSN has no dbname segment: {dsn}"
        )));
    }
    Ok(info.to_string())
}

fn bind_values(params: &ParamMap) -> Result<Vec<rusqlite::types::Value>, BridgeError> {
    Ok(opt_array(params, "bind_values")?
        .unwrap_or(&[])
        .iter()
        .map(to_sql_value)
        .collect())
}

fn to_sql_value(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(i64::from(*b)),
        Value::Number(n) => n
            .as_i64()
            .map(Sql::Integer)
            .or_else(|| n.as_f64().map(Sql::Real))
            .unwrap_or(Sql::Null),
        Value::String(s) => Sql::Text(s.clone()),
        other => Sql::Text(other.to_string()),
    }
}

fn from_sql_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => json!(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(hex::encode(b)),
    }
}

fn format_row(row: Vec<Value>, columns: &[String], format: &str) -> Value {
    if format == "hash" {
        let map: serde_json::Map<String, Value> = columns
            .iter()
            .cloned()
            .zip(row)
            .collect();
        Value::Object(map)
    } else {
        Value::Array(row)
    }
}

fn database_state(state: &Arc<AppState>, id: &str) -> Result<Arc<DatabaseState>, BridgeError> {
    match state.pool.get_kind(id, HandleKind::DatabaseConnection)? {
        NativeState::Database(db) => Ok(db),
        _ => Err(BridgeError::Internal(format!(
            "handle {id} tagged database-connection holds foreign state"
        ))),
    }
}

fn statement_state(state: &Arc<AppState>, id: &str) -> Result<Arc<StatementState>, BridgeError> {
    match state.pool.get_kind(id, HandleKind::PreparedStatement)? {
        NativeState::Statement(stmt) => Ok(stmt),
        _ => Err(BridgeError::Internal(format!(
            "handle {id} tagged prepared-statement holds foreign state"
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
