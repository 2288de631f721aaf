//! `LedgerEntry` - a row of the version ledger

use crate::executor::{ExecutorError, SqlRow};
use crate::migration::MigrationId;
use chrono::{DateTime, Utc};

/// One applied migration, as recorded in the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub migration_id: MigrationId,
    pub applied_at: DateTime<Utc>,
}

impl LedgerEntry {
    #[must_use]
    pub fn new(migration_id: MigrationId, applied_at: DateTime<Utc>) -> Self {
        Self {
            migration_id,
            applied_at,
        }
    }

    /// Create a `LedgerEntry` from a row
    ///
    /// Expected column order: `migration_id`, `applied_at`.
    ///
    /// # Errors
    ///
    /// Returns `ExecutorError::Parse` if either column is missing or malformed.
    pub fn from_row(row: &SqlRow) -> Result<Self, ExecutorError> {
        let migration_id = MigrationId::new(row.get_i64(0)?);
        let applied_at = row.get_timestamp(1)?;
        Ok(Self {
            migration_id,
            applied_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SqlValue;

    #[test]
    fn test_from_row_accepts_text_timestamps() {
        let row = SqlRow(vec![
            SqlValue::BigInt(20_240_120_120_000),
            SqlValue::Text("2024-01-20 12:00:00".to_string()),
        ]);
        let entry = LedgerEntry::from_row(&row).unwrap();
        assert_eq!(entry.migration_id, MigrationId::new(20_240_120_120_000));
        assert_eq!(entry.applied_at.to_rfc3339(), "2024-01-20T12:00:00+00:00");
    }

    #[test]
    fn test_from_row_rejects_short_rows() {
        let row = SqlRow(vec![SqlValue::BigInt(1)]);
        assert!(LedgerEntry::from_row(&row).is_err());
    }
}
