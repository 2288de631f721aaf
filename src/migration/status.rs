//! Migration status reporting

use crate::migration::{LedgerEntry, MigrationId};
use std::collections::BTreeSet;

/// Applied and pending migrations for one database
///
/// `unknown` lists ledger ids with no registered migration, which happens when
/// the database was migrated by a newer build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationStatus {
    /// Ledger rows, ascending by id
    pub applied: Vec<LedgerEntry>,
    /// Registered but not applied, ascending by id
    pub pending: Vec<MigrationId>,
    /// Applied but not registered, ascending by id
    pub unknown: Vec<MigrationId>,
}

impl MigrationStatus {
    #[must_use]
    pub fn new(
        applied: Vec<LedgerEntry>,
        pending: Vec<MigrationId>,
        unknown: Vec<MigrationId>,
    ) -> Self {
        Self {
            applied,
            pending,
            unknown,
        }
    }

    /// Check if there is nothing left to apply
    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }

    #[must_use]
    pub fn applied_ids(&self) -> BTreeSet<MigrationId> {
        self.applied.iter().map(|e| e.migration_id).collect()
    }

    #[must_use]
    pub fn latest_applied(&self) -> Option<MigrationId> {
        self.applied.iter().map(|e| e.migration_id).max()
    }

    #[must_use]
    pub fn next_pending(&self) -> Option<MigrationId> {
        self.pending.first().copied()
    }

    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_status_helpers() {
        let now = Utc::now();
        let status = MigrationStatus::new(
            vec![
                LedgerEntry::new(MigrationId::new(1), now),
                LedgerEntry::new(MigrationId::new(2), now),
            ],
            vec![MigrationId::new(3), MigrationId::new(4)],
            vec![],
        );
        assert!(!status.is_up_to_date());
        assert_eq!(status.latest_applied(), Some(MigrationId::new(2)));
        assert_eq!(status.next_pending(), Some(MigrationId::new(3)));
        assert_eq!(status.applied_count(), 2);
        assert_eq!(status.pending_count(), 2);
        assert!(status.applied_ids().contains(&MigrationId::new(1)));
    }

    #[test]
    fn test_empty_status_is_up_to_date() {
        let status = MigrationStatus::default();
        assert!(status.is_up_to_date());
        assert_eq!(status.latest_applied(), None);
        assert_eq!(status.next_pending(), None);
    }
}
