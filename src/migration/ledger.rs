//! Version ledger
//!
//! A two-column table recording which migrations have been applied:
//!
//! ```sql
//! CREATE TABLE lockkeeper_migrations (
//!     migration_id BIGINT PRIMARY KEY,
//!     applied_at   TIMESTAMPTZ NOT NULL   -- TEXT on SQLite
//! );
//! ```
//!
//! Writes happen inside the applying migration's transaction, so a row exists
//! exactly when the migration's operations committed.

use super::error::MigrationError;
use super::migration::MigrationId;
use super::record::LedgerEntry;
use crate::executor::{SchemaExecutor, SqlValue};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::BTreeSet;

/// Default ledger table name
pub const DEFAULT_LEDGER_TABLE: &str = "lockkeeper_migrations";

/// Reads and writes the version ledger
#[derive(Debug, Clone)]
pub struct VersionLedger {
    table: String,
}

impl Default for VersionLedger {
    fn default() -> Self {
        Self {
            table: DEFAULT_LEDGER_TABLE.to_string(),
        }
    }
}

impl VersionLedger {
    /// Ledger stored in `table`
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::InvalidIdentifier` unless `table` is a plain SQL
    /// identifier (letters, digits, underscores; at most 63 characters).
    pub fn new(table: impl Into<String>) -> Result<Self, MigrationError> {
        let table = table.into();
        let identifier = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$")
            .map_err(|e| MigrationError::InvalidIdentifier(format!("{table}: {e}")))?;
        if !identifier.is_match(&table) {
            return Err(MigrationError::InvalidIdentifier(table));
        }
        Ok(Self { table })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the ledger table if absent; existing rows are left untouched
    pub fn ensure_initialized(&self, executor: &dyn SchemaExecutor) -> Result<(), MigrationError> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                migration_id BIGINT PRIMARY KEY,
                applied_at {} NOT NULL
            )",
            self.table,
            executor.dialect().timestamp_type()
        );
        executor.batch_execute(&sql)?;
        Ok(())
    }

    /// Ids of every applied migration
    pub fn applied_ids(
        &self,
        executor: &dyn SchemaExecutor,
    ) -> Result<BTreeSet<MigrationId>, MigrationError> {
        let rows = executor.query_all(&format!("SELECT migration_id FROM {}", self.table), &[])?;
        rows.iter()
            .map(|row| row.get_i64(0).map(MigrationId::new).map_err(MigrationError::from))
            .collect()
    }

    /// Every ledger row, ascending by id
    pub fn entries(&self, executor: &dyn SchemaExecutor) -> Result<Vec<LedgerEntry>, MigrationError> {
        let rows = executor.query_all(
            &format!(
                "SELECT migration_id, applied_at FROM {} ORDER BY migration_id",
                self.table
            ),
            &[],
        )?;
        rows.iter()
            .map(|row| LedgerEntry::from_row(row).map_err(MigrationError::from))
            .collect()
    }

    pub fn contains(
        &self,
        executor: &dyn SchemaExecutor,
        id: MigrationId,
    ) -> Result<bool, MigrationError> {
        let placeholder = executor.dialect().placeholder(1);
        let rows = executor.query_all(
            &format!(
                "SELECT 1 FROM {} WHERE migration_id = {placeholder}",
                self.table
            ),
            &[SqlValue::BigInt(id.value())],
        )?;
        Ok(!rows.is_empty())
    }

    /// Record `id` as applied at `applied_at`
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::DuplicateLedgerEntry` if `id` is already
    /// recorded.
    pub fn record(
        &self,
        executor: &dyn SchemaExecutor,
        id: MigrationId,
        applied_at: DateTime<Utc>,
    ) -> Result<(), MigrationError> {
        if self.contains(executor, id)? {
            return Err(MigrationError::DuplicateLedgerEntry(id));
        }
        let dialect = executor.dialect();
        executor.execute(
            &format!(
                "INSERT INTO {} (migration_id, applied_at) VALUES ({}, {})",
                self.table,
                dialect.placeholder(1),
                dialect.placeholder(2)
            ),
            &[SqlValue::BigInt(id.value()), SqlValue::Timestamp(applied_at)],
        )?;
        Ok(())
    }

    /// Remove `id` from the ledger
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::NotApplied` if `id` has no row.
    pub fn unrecord(&self, executor: &dyn SchemaExecutor, id: MigrationId) -> Result<(), MigrationError> {
        let placeholder = executor.dialect().placeholder(1);
        let deleted = executor.execute(
            &format!("DELETE FROM {} WHERE migration_id = {placeholder}", self.table),
            &[SqlValue::BigInt(id.value())],
        )?;
        if deleted == 0 {
            return Err(MigrationError::NotApplied(id));
        }
        Ok(())
    }
}
