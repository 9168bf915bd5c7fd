use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, OpenFlags};
use tracing::trace;

use crate::error::SQLError;
use crate::traits::{Row, SQLStore, SQLTransaction, Value};

static MEMORY_DB_SEQ: AtomicU64 = AtomicU64::new(0);

/// Where the store's connections point to.
#[derive(Debug, Clone)]
enum Target {
    File(PathBuf),
    /// Shared-cache in-memory database URI. Alive as long as one connection is open.
    Memory(String),
}

/// SqliteStore is a SQLStore implementation backed by rusqlite (bundled SQLite).
///
/// Autocommit calls go through a long-lived connection. Every transaction
/// opens its own connection to the same database, so two environments
/// never share uncommitted state.
pub struct SqliteStore {
    target: Target,
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self, SQLError> {
        let target = Target::File(path.to_path_buf());
        let conn = connect(&target)?;

        // Enable WAL mode for better concurrent read performance.
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| SQLError::Connection(e.to_string()))?;

        Ok(Self {
            target,
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory SQLite database (useful for tests).
    ///
    /// Each call creates a distinct database.
    pub fn open_in_memory() -> Result<Self, SQLError> {
        let seq = MEMORY_DB_SEQ.fetch_add(1, Ordering::Relaxed);
        let uri = format!(
            "file:openerp_mem_{}_{}?mode=memory&cache=shared",
            std::process::id(),
            seq
        );
        let target = Target::Memory(uri);
        let conn = connect(&target)?;
        Ok(Self {
            target,
            conn: Mutex::new(conn),
        })
    }
}

fn connect(target: &Target) -> Result<Connection, SQLError> {
    let conn = match target {
        Target::File(path) => Connection::open(path),
        Target::Memory(uri) => Connection::open_with_flags(
            uri,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        ),
    }
    .map_err(|e| SQLError::Connection(e.to_string()))?;

    conn.busy_timeout(Duration::from_secs(5))
        .map_err(|e| SQLError::Connection(e.to_string()))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")
        .map_err(|e| SQLError::Connection(e.to_string()))?;
    Ok(conn)
}

/// Convert our Value enum to rusqlite's ToSql.
fn bind_params(params: &[Value]) -> Vec<Box<dyn rusqlite::types::ToSql + '_>> {
    params
        .iter()
        .map(|v| -> Box<dyn rusqlite::types::ToSql + '_> {
            match v {
                Value::Null => Box::new(rusqlite::types::Null),
                Value::Integer(i) => Box::new(*i),
                Value::Real(f) => Box::new(*f),
                Value::Text(s) => Box::new(s.as_str()),
                Value::Blob(b) => Box::new(b.as_slice()),
            }
        })
        .collect()
}

/// Map a rusqlite error, singling out constraint violations so their
/// message reaches the caller unchanged.
fn map_err(e: rusqlite::Error, wrap: fn(String) -> SQLError) -> SQLError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation => {
            SQLError::Constraint(e.to_string())
        }
        _ => wrap(e.to_string()),
    }
}

fn run_query(conn: &Connection, sql: &str, params: &[Value]) -> Result<Vec<Row>, SQLError> {
    trace!(sql, params = params.len(), "sqlite query");
    let bound = bind_params(params);
    let param_refs: Vec<&dyn rusqlite::types::ToSql> =
        bound.iter().map(|b| b.as_ref()).collect();

    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| map_err(e, SQLError::Query))?;

    let column_names: Vec<String> = stmt
        .column_names()
        .iter()
        .map(|s| s.to_string())
        .collect();

    let rows = stmt
        .query_map(param_refs.as_slice(), |row| {
            let mut columns = Vec::with_capacity(column_names.len());
            for (i, name) in column_names.iter().enumerate() {
                let val = row_value_at(row, i)?;
                columns.push((name.clone(), val));
            }
            Ok(Row { columns })
        })
        .map_err(|e| map_err(e, SQLError::Query))?;

    let mut result = Vec::new();
    for row in rows {
        result.push(row.map_err(|e| map_err(e, SQLError::Query))?);
    }
    Ok(result)
}

fn run_exec(conn: &Connection, sql: &str, params: &[Value]) -> Result<u64, SQLError> {
    trace!(sql, params = params.len(), "sqlite exec");
    let bound = bind_params(params);
    let param_refs: Vec<&dyn rusqlite::types::ToSql> =
        bound.iter().map(|b| b.as_ref()).collect();

    let affected = conn
        .execute(sql, param_refs.as_slice())
        .map_err(|e| map_err(e, SQLError::Execution))?;

    Ok(affected as u64)
}

impl SQLStore for SqliteStore {
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, SQLError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| SQLError::Query(e.to_string()))?;
        run_query(&conn, sql, params)
    }

    fn exec(&self, sql: &str, params: &[Value]) -> Result<u64, SQLError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| SQLError::Execution(e.to_string()))?;
        run_exec(&conn, sql, params)
    }

    fn begin(&self) -> Result<Box<dyn SQLTransaction>, SQLError> {
        let conn = connect(&self.target)?;
        conn.execute_batch("BEGIN")
            .map_err(|e| SQLError::Connection(e.to_string()))?;
        Ok(Box::new(SqliteTransaction {
            conn: Some(conn),
        }))
    }

    fn driver_name(&self) -> &'static str {
        "sqlite"
    }
}

/// A transaction owning its own connection.
pub struct SqliteTransaction {
    conn: Option<Connection>,
}

impl SqliteTransaction {
    fn conn(&self) -> Result<&Connection, SQLError> {
        self.conn
            .as_ref()
            .ok_or_else(|| SQLError::Connection("transaction already closed".into()))
    }

    fn finish(&mut self, statement: &str) -> Result<(), SQLError> {
        let conn = self
            .conn
            .take()
            .ok_or_else(|| SQLError::Connection("transaction already closed".into()))?;
        conn.execute_batch(statement)
            .map_err(|e| map_err(e, SQLError::Execution))
    }
}

impl SQLTransaction for SqliteTransaction {
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, SQLError> {
        run_query(self.conn()?, sql, params)
    }

    fn exec(&mut self, sql: &str, params: &[Value]) -> Result<u64, SQLError> {
        run_exec(self.conn()?, sql, params)
    }

    fn commit(mut self: Box<Self>) -> Result<(), SQLError> {
        self.finish("COMMIT")
    }

    fn rollback(mut self: Box<Self>) -> Result<(), SQLError> {
        self.finish("ROLLBACK")
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // Best effort: the connection is closed right after anyway.
            let _ = conn.execute_batch("ROLLBACK");
        }
    }
}

/// Extract a Value from a rusqlite row at a given column index.
fn row_value_at(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Value> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Real(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Blob(b.to_vec()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_table() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .exec(
                "CREATE TABLE item (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT UNIQUE, rate REAL)",
                &[],
            )
            .unwrap();
        store
    }

    #[test]
    fn autocommit_roundtrip() {
        let store = store_with_table();
        let n = store
            .exec(
                "INSERT INTO item (name, rate) VALUES (?1, ?2)",
                &[Value::Text("a".into()), Value::Real(2.5)],
            )
            .unwrap();
        assert_eq!(n, 1);

        let rows = store.query("SELECT id, name, rate FROM item", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_str("name"), Some("a"));
        assert_eq!(rows[0].get_f64("rate"), Some(2.5));
    }

    #[test]
    fn returning_generated_id() {
        let store = store_with_table();
        let mut tx = store.begin().unwrap();
        let rows = tx
            .query(
                "INSERT INTO item (name) VALUES (?1) RETURNING id",
                &[Value::Text("x".into())],
            )
            .unwrap();
        assert_eq!(rows[0].get_i64("id"), Some(1));
        tx.commit().unwrap();
    }

    #[test]
    fn rollback_discards_and_commit_persists() {
        let store = store_with_table();

        let mut tx = store.begin().unwrap();
        tx.exec("INSERT INTO item (name) VALUES ('gone')", &[]).unwrap();
        tx.rollback().unwrap();
        assert!(store.query("SELECT id FROM item", &[]).unwrap().is_empty());

        let mut tx = store.begin().unwrap();
        tx.exec("INSERT INTO item (name) VALUES ('kept')", &[]).unwrap();
        tx.commit().unwrap();
        assert_eq!(store.query("SELECT id FROM item", &[]).unwrap().len(), 1);
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let store = store_with_table();
        {
            let mut tx = store.begin().unwrap();
            tx.exec("INSERT INTO item (name) VALUES ('tmp')", &[]).unwrap();
        }
        assert!(store.query("SELECT id FROM item", &[]).unwrap().is_empty());
    }

    #[test]
    fn constraint_message_is_preserved() {
        let store = store_with_table();
        store.exec("INSERT INTO item (name) VALUES ('dup')", &[]).unwrap();
        let err = store
            .exec("INSERT INTO item (name) VALUES ('dup')", &[])
            .unwrap_err();
        match err {
            SQLError::Constraint(msg) => assert!(msg.starts_with("UNIQUE constraint failed")),
            other => panic!("expected constraint error, got {other:?}"),
        }
    }

    #[test]
    fn file_database_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("test.db")).unwrap();
        store
            .exec("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)", &[])
            .unwrap();
        let mut tx = store.begin().unwrap();
        tx.exec("INSERT INTO t (v) VALUES ('a')", &[]).unwrap();
        tx.commit().unwrap();
        assert_eq!(store.query("SELECT v FROM t", &[]).unwrap().len(), 1);
        assert_eq!(store.driver_name(), "sqlite");
    }
}
