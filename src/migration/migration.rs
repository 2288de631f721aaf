//! Migration definition

use super::operation::SchemaOperation;
use std::fmt;

/// Migration identifier
///
/// Ids are timestamps of the form `YYYYMMDDHHMMSS`, so numeric order is
/// authoring order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MigrationId(i64);

impl MigrationId {
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> i64 {
        self.0
    }
}

impl From<i64> for MigrationId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a migration is undone
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Revert {
    /// Operations that undo the apply sequence
    Operations(Vec<SchemaOperation>),
    /// The migration cannot be undone; revert is refused
    Irreversible,
}

/// A single schema change: an ordered apply sequence and its reversal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    id: MigrationId,
    name: String,
    apply: Vec<SchemaOperation>,
    revert: Revert,
}

impl Migration {
    pub fn new(
        id: i64,
        name: impl Into<String>,
        apply: Vec<SchemaOperation>,
        revert: Revert,
    ) -> Self {
        Self {
            id: MigrationId::new(id),
            name: name.into(),
            apply,
            revert,
        }
    }

    /// A migration whose revert runs `revert` in order
    pub fn reversible(
        id: i64,
        name: impl Into<String>,
        apply: Vec<SchemaOperation>,
        revert: Vec<SchemaOperation>,
    ) -> Self {
        Self::new(id, name, apply, Revert::Operations(revert))
    }

    /// A migration that refuses to be reverted
    pub fn irreversible(
        id: i64,
        name: impl Into<String>,
        apply: Vec<SchemaOperation>,
    ) -> Self {
        Self::new(id, name, apply, Revert::Irreversible)
    }

    pub fn id(&self) -> MigrationId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn apply(&self) -> &[SchemaOperation] {
        &self.apply
    }

    pub fn revert(&self) -> &Revert {
        &self.revert
    }

    pub fn is_reversible(&self) -> bool {
        matches!(self.revert, Revert::Operations(_))
    }

    /// Columns the apply sequence adds that the revert sequence never drops
    ///
    /// A reversible migration should return an empty list; anything listed here
    /// survives a revert. Raw scripts are opaque and not inspected. Irreversible
    /// migrations report nothing.
    pub fn reversal_gaps(&self) -> Vec<(&str, &str)> {
        let Revert::Operations(revert) = &self.revert else {
            return Vec::new();
        };

        self.apply
            .iter()
            .filter_map(|op| match op {
                SchemaOperation::AddColumn { table, column, .. } => {
                    Some((table.as_str(), column.as_str()))
                }
                _ => None,
            })
            .filter(|(table, column)| {
                !revert.iter().any(|undo| {
                    matches!(
                        undo,
                        SchemaOperation::DropColumn { table: t, column: c }
                            if t.as_str() == *table && c.as_str() == *column
                    )
                })
            })
            .collect()
    }
}
