//! Executor Module
//!
//! Provides the `SchemaExecutor` trait: the single boundary between the migration
//! engine and a concrete database driver.
//!
//! The engine only ever issues a small statement vocabulary through this trait
//! (ledger DDL, `ALTER TABLE`, ledger `INSERT`/`DELETE`/`SELECT`, verbatim scripts)
//! plus an exclusive advisory lock primitive. Everything dialect-specific lives
//! behind [`Dialect`] and the executor implementations.

use chrono::{DateTime, NaiveDateTime, Utc};
use may_postgres::types::{ToSql, Type};
use may_postgres::{Client, Error as PostgresError, Row};
use std::time::Duration;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Executor error type
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// `PostgreSQL` error from `may_postgres`
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] PostgresError),
    /// `SQLite` error from `rusqlite`
    #[cfg(feature = "sqlite")]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Query execution error
    #[error("Query error: {0}")]
    Query(String),
    /// Row parsing/conversion error
    #[error("Parse error: {0}")]
    Parse(String),
}

/// SQL dialect spoken by an executor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    /// Positional placeholder for the `n`-th (1-based) parameter
    #[must_use]
    pub fn placeholder(self, n: usize) -> String {
        match self {
            Dialect::Postgres => format!("${n}"),
            Dialect::Sqlite => format!("?{n}"),
        }
    }

    /// Statement that opens a write transaction
    ///
    /// SQLite takes the write lock up front so two connections never deadlock
    /// upgrading from a shared lock.
    #[must_use]
    pub fn begin_statement(self) -> &'static str {
        match self {
            Dialect::Postgres => "BEGIN",
            Dialect::Sqlite => "BEGIN IMMEDIATE",
        }
    }

    /// Column type used for ledger timestamps
    #[must_use]
    pub fn timestamp_type(self) -> &'static str {
        match self {
            Dialect::Postgres => "TIMESTAMPTZ",
            Dialect::Sqlite => "TEXT",
        }
    }
}

/// A parameter or column value crossing the executor boundary
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    BigInt(i64),
    Text(String),
    Bool(bool),
    Timestamp(DateTime<Utc>),
}

impl SqlValue {
    /// Interpret the value as an `i64`
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::BigInt(v) => Some(*v),
            SqlValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Interpret the value as a UTC timestamp
    ///
    /// Text values are accepted in RFC 3339 and the common
    /// `YYYY-MM-DD HH:MM:SS[.f]` / `YYYY-MM-DDTHH:MM:SS[.f]` forms.
    pub fn as_timestamp(&self) -> Result<DateTime<Utc>, ExecutorError> {
        match self {
            SqlValue::Timestamp(ts) => Ok(*ts),
            SqlValue::Text(s) => parse_timestamp(s),
            other => Err(ExecutorError::Parse(format!(
                "expected a timestamp, found {other:?}"
            ))),
        }
    }

    fn as_postgres(&self) -> &dyn ToSql {
        match self {
            SqlValue::Null => &None::<i64>,
            SqlValue::BigInt(v) => v,
            SqlValue::Text(s) => s,
            SqlValue::Bool(b) => b,
            SqlValue::Timestamp(ts) => ts,
        }
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ExecutorError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(ExecutorError::Parse(format!(
        "Failed to parse timestamp '{raw}': unrecognized format"
    )))
}

/// One result row, columns in select order
#[derive(Debug, Clone, PartialEq)]
pub struct SqlRow(pub Vec<SqlValue>);

impl SqlRow {
    /// Get the value at `idx`, if present
    #[must_use]
    pub fn get(&self, idx: usize) -> Option<&SqlValue> {
        self.0.get(idx)
    }

    /// Get column `idx` as an `i64`
    pub fn get_i64(&self, idx: usize) -> Result<i64, ExecutorError> {
        self.get(idx).and_then(SqlValue::as_i64).ok_or_else(|| {
            ExecutorError::Parse(format!("column {idx} is not an integer: {:?}", self.get(idx)))
        })
    }

    /// Get column `idx` as a UTC timestamp
    pub fn get_timestamp(&self, idx: usize) -> Result<DateTime<Utc>, ExecutorError> {
        self.get(idx)
            .ok_or_else(|| ExecutorError::Parse(format!("column {idx} out of range")))?
            .as_timestamp()
    }

    /// Get column `idx` as text
    #[must_use]
    pub fn get_str(&self, idx: usize) -> Option<&str> {
        match self.get(idx) {
            Some(SqlValue::Text(s)) => Some(s),
            _ => None,
        }
    }
}

/// Trait for executing migration statements against a target database
///
/// Implementations own a single session: transactions opened through
/// [`crate::transaction::Transaction`] and advisory locks are scoped to it.
pub trait SchemaExecutor {
    /// SQL dialect of the underlying database
    fn dialect(&self) -> Dialect;

    /// Execute one statement and return the number of rows affected
    fn execute(&self, query: &str, params: &[SqlValue]) -> Result<u64, ExecutorError>;

    /// Execute script text verbatim; it may contain several statements
    fn batch_execute(&self, script: &str) -> Result<(), ExecutorError>;

    /// Execute a query and return all rows
    fn query_all(&self, query: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, ExecutorError>;

    /// Try to take the database-scoped exclusive lock identified by `key`
    ///
    /// Returns `Ok(false)` without blocking when another session holds it.
    fn try_advisory_lock(&self, key: i64) -> Result<bool, ExecutorError>;

    /// Release a lock taken with [`SchemaExecutor::try_advisory_lock`]
    fn advisory_unlock(&self, key: i64) -> Result<(), ExecutorError>;

    /// Bound every subsequent statement in this session (`None` resets)
    fn set_statement_timeout(&self, timeout: Option<Duration>) -> Result<(), ExecutorError>;
}

/// Implementation of `SchemaExecutor` for `may_postgres::Client`
///
/// This is the production executor. Calls block the current coroutine (or
/// thread) until `PostgreSQL` answers.
pub struct MayPostgresExecutor {
    client: Client,
}

impl MayPostgresExecutor {
    /// Create a new executor from a `may_postgres::Client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Get a reference to the underlying client
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Consume the executor and return the underlying client
    pub fn into_client(self) -> Client {
        self.client
    }

    fn bind(params: &[SqlValue]) -> Vec<&dyn ToSql> {
        params.iter().map(SqlValue::as_postgres).collect()
    }
}

fn postgres_row(row: &Row) -> Result<SqlRow, ExecutorError> {
    let mut values = Vec::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        let value = match *column.type_() {
            Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(SqlValue::BigInt),
            Type::INT4 => row
                .try_get::<_, Option<i32>>(idx)?
                .map(|v| SqlValue::BigInt(i64::from(v))),
            Type::INT2 => row
                .try_get::<_, Option<i16>>(idx)?
                .map(|v| SqlValue::BigInt(i64::from(v))),
            Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(SqlValue::Bool),
            Type::TIMESTAMPTZ => row
                .try_get::<_, Option<DateTime<Utc>>>(idx)?
                .map(SqlValue::Timestamp),
            Type::TIMESTAMP => row
                .try_get::<_, Option<NaiveDateTime>>(idx)?
                .map(|naive| SqlValue::Timestamp(naive.and_utc())),
            _ => row.try_get::<_, Option<String>>(idx)?.map(SqlValue::Text),
        };
        values.push(value.unwrap_or(SqlValue::Null));
    }
    Ok(SqlRow(values))
}

impl SchemaExecutor for MayPostgresExecutor {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn execute(&self, query: &str, params: &[SqlValue]) -> Result<u64, ExecutorError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::execute_statement_span(query).entered();

        let bound = Self::bind(params);
        Ok(self.client.execute(query, &bound)?)
    }

    fn batch_execute(&self, script: &str) -> Result<(), ExecutorError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::execute_statement_span(script).entered();

        Ok(self.client.batch_execute(script)?)
    }

    fn query_all(&self, query: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, ExecutorError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::execute_statement_span(query).entered();

        let bound = Self::bind(params);
        let rows = self.client.query(query, &bound)?;
        rows.iter().map(postgres_row).collect()
    }

    fn try_advisory_lock(&self, key: i64) -> Result<bool, ExecutorError> {
        let row = self
            .client
            .query_one("SELECT pg_try_advisory_lock($1)", &[&key])?;
        Ok(row.try_get::<_, bool>(0)?)
    }

    fn advisory_unlock(&self, key: i64) -> Result<(), ExecutorError> {
        let row = self
            .client
            .query_one("SELECT pg_advisory_unlock($1)", &[&key])?;
        if row.try_get::<_, bool>(0)? {
            Ok(())
        } else {
            Err(ExecutorError::Query(format!(
                "advisory lock {key} was not held by this session"
            )))
        }
    }

    fn set_statement_timeout(&self, timeout: Option<Duration>) -> Result<(), ExecutorError> {
        match timeout {
            Some(timeout) => {
                let sql = format!("SET statement_timeout = '{}ms'", timeout.as_millis());
                self.client.batch_execute(&sql)?;
            }
            None => self.client.batch_execute("RESET statement_timeout")?,
        }
        Ok(())
    }
}
