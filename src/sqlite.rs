//! SQLite executor
//!
//! `SchemaExecutor` over a `rusqlite::Connection`. Used for embedded
//! deployments and as the database behind the test suite.
//!
//! SQLite has no advisory locks. For a file database, lock `key` is an
//! exclusive transaction held open on a sibling lock file
//! (`<db>.lock-<key as hex>`) through a dedicated connection. The OS file
//! lock goes away when that connection closes, so a runner that dies
//! without releasing still frees the lock. Polling for the lock never
//! touches the main database, so a runner stuck behind a long migration
//! keeps waiting instead of tripping the busy timeout. An in-memory database
//! is private to its connection; its locks only live in the executor.
//!
//! The statement timeout is enforced with a progress handler: once a call
//! runs past its deadline SQLite interrupts it.

use crate::executor::{Dialect, ExecutorError, SchemaExecutor, SqlRow, SqlValue};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, ErrorCode, OpenFlags};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// VM instructions between two deadline checks
const PROGRESS_OPS: i32 = 1_000;

/// `SchemaExecutor` backed by a single SQLite connection
pub struct SqliteExecutor {
    conn: Connection,
    /// Held locks; `Some` carries the connection keeping the lock file busy
    locks: RefCell<HashMap<i64, Option<Connection>>>,
    statement_timeout: Cell<Option<Duration>>,
}

impl SqliteExecutor {
    /// Open (or create) a database file
    ///
    /// File databases are switched to WAL so concurrent runners can read the
    /// ledger while another session holds the write lock.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ExecutorError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        Ok(Self::from_connection(conn))
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self, ExecutorError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self::from_connection(conn))
    }

    /// Wrap an existing connection
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn,
            locks: RefCell::new(HashMap::new()),
            statement_timeout: Cell::new(None),
        }
    }

    /// Get a reference to the underlying connection
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Lock file for `key`, or `None` for in-memory and temporary databases
    pub fn lock_path(&self, key: i64) -> Option<PathBuf> {
        match self.conn.path() {
            Some(path) if !path.is_empty() => Some(PathBuf::from(format!("{path}.lock-{key:016x}"))),
            _ => None,
        }
    }

    fn bind(params: &[SqlValue]) -> Vec<Value> {
        params
            .iter()
            .map(|param| match param {
                SqlValue::Null => Value::Null,
                SqlValue::BigInt(v) => Value::Integer(*v),
                SqlValue::Text(s) => Value::Text(s.clone()),
                SqlValue::Bool(b) => Value::Integer(i64::from(*b)),
                SqlValue::Timestamp(ts) => Value::Text(ts.to_rfc3339()),
            })
            .collect()
    }

    /// Run `f` under the session statement timeout, if one is set
    fn bounded<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, ExecutorError> {
        let Some(timeout) = self.statement_timeout.get() else {
            return Ok(f(&self.conn)?);
        };

        let deadline = Instant::now() + timeout;
        self.conn
            .progress_handler(PROGRESS_OPS, Some(move || Instant::now() >= deadline))?;
        let result = f(&self.conn);
        self.conn.progress_handler(0, None::<fn() -> bool>)?;

        result.map_err(|e| {
            if e.sqlite_error_code() == Some(ErrorCode::OperationInterrupted) {
                ExecutorError::Query(format!("statement exceeded timeout of {timeout:?}"))
            } else {
                e.into()
            }
        })
    }
}

/// Take an exclusive transaction on the lock file, `None` if another session
/// holds it
fn hold_lock_file(path: &Path) -> Result<Option<Connection>, ExecutorError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::ZERO)?;
    match conn.execute_batch("BEGIN EXCLUSIVE") {
        Ok(()) => Ok(Some(conn)),
        Err(e) if is_busy(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn sqlite_value(value: Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(v) => SqlValue::BigInt(v),
        Value::Real(v) => SqlValue::Text(v.to_string()),
        Value::Text(s) => SqlValue::Text(s),
        Value::Blob(bytes) => SqlValue::Text(String::from_utf8_lossy(&bytes).into_owned()),
    }
}

impl SchemaExecutor for SqliteExecutor {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn execute(&self, query: &str, params: &[SqlValue]) -> Result<u64, ExecutorError> {
        let bound = Self::bind(params);
        let affected = self.bounded(|conn| conn.execute(query, params_from_iter(bound.iter())))?;
        Ok(affected as u64)
    }

    fn batch_execute(&self, script: &str) -> Result<(), ExecutorError> {
        self.bounded(|conn| conn.execute_batch(script))
    }

    fn query_all(&self, query: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, ExecutorError> {
        let bound = Self::bind(params);
        self.bounded(|conn| {
            let mut stmt = conn.prepare(query)?;
            let width = stmt.column_count();
            let mut rows = stmt.query(params_from_iter(bound.iter()))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut values = Vec::with_capacity(width);
                for idx in 0..width {
                    values.push(sqlite_value(row.get::<_, Value>(idx)?));
                }
                out.push(SqlRow(values));
            }
            Ok(out)
        })
    }

    fn try_advisory_lock(&self, key: i64) -> Result<bool, ExecutorError> {
        let mut locks = self.locks.borrow_mut();
        if locks.contains_key(&key) {
            return Ok(false);
        }
        let holder = match self.lock_path(key) {
            None => None,
            Some(path) => match hold_lock_file(&path)? {
                Some(conn) => Some(conn),
                None => return Ok(false),
            },
        };
        locks.insert(key, holder);
        Ok(true)
    }

    fn advisory_unlock(&self, key: i64) -> Result<(), ExecutorError> {
        match self.locks.borrow_mut().remove(&key) {
            None => Err(ExecutorError::Query(format!("lock {key} was not held"))),
            Some(None) => Ok(()),
            Some(Some(conn)) => {
                // Closing the connection releases the file lock either way
                if let Err(e) = conn.execute_batch("ROLLBACK") {
                    log::warn!("Failed to end lock transaction for {key}: {e}");
                }
                Ok(())
            }
        }
    }

    fn set_statement_timeout(&self, timeout: Option<Duration>) -> Result<(), ExecutorError> {
        self.statement_timeout.set(timeout);
        Ok(())
    }
}
