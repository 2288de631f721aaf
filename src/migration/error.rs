//! Migration-specific error types

use crate::executor::ExecutorError;
use crate::migration::MigrationId;
use crate::transaction::TransactionError;
use std::time::Duration;

/// Registry construction errors
///
/// Raised only while building a [`crate::migration::MigrationRegistry`], never
/// while a run is in progress.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Two migrations share an id
    #[error("Duplicate migration id {id}: '{first}' and '{second}'")]
    DuplicateId {
        id: MigrationId,
        first: String,
        second: String,
    },
    /// Two migrations share a name
    #[error("Duplicate migration name '{name}': used by {first} and {second}")]
    DuplicateName {
        name: String,
        first: MigrationId,
        second: MigrationId,
    },
    /// A migration has nothing to apply
    #[error("Migration '{name}' ({id}) has an empty apply sequence")]
    EmptyApply { id: MigrationId, name: String },
}

/// Migration-specific errors
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// Registry construction failed
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The exclusive migration lock was not acquired in time
    #[error(
        "Migration lock timeout: lock {key} not acquired within {waited:?}. \
         Another process may be running migrations; retry once it finishes."
    )]
    LockTimeout { key: i64, waited: Duration },

    /// The script loader has no script under this id
    #[error("Script not found: '{script_id}'")]
    ScriptNotFound { script_id: String },

    /// The script exists but could not be read
    #[error("Failed to load script '{script_id}': {source}")]
    ScriptLoad {
        script_id: String,
        #[source]
        source: std::io::Error,
    },

    /// A schema operation failed against the database
    #[error("Migration {migration_id} failed during {operation}: {source}")]
    Statement {
        migration_id: MigrationId,
        operation: String,
        #[source]
        source: ExecutorError,
    },

    /// The ledger already has a row for this id
    #[error("Ledger already contains migration {0}")]
    DuplicateLedgerEntry(MigrationId),

    /// Revert requested for a migration declared irreversible
    #[error("Migration '{name}' ({id}) is irreversible and cannot be reverted")]
    IrreversibleMigration { id: MigrationId, name: String },

    /// The id is not part of the registry
    #[error("Migration {0} is not registered")]
    UnknownMigration(MigrationId),

    /// The id is registered but has no ledger row
    #[error("Migration {0} has not been applied")]
    NotApplied(MigrationId),

    /// A configured SQL identifier or script id is not acceptable
    #[error("Invalid identifier '{0}'")]
    InvalidIdentifier(String),

    /// Database error outside of a migration's own operations (ledger, lock)
    #[error("Database error: {0}")]
    Database(#[from] ExecutorError),

    /// Beginning or committing a migration's transaction failed
    #[error("Transaction error in migration {migration_id}: {source}")]
    Transaction {
        migration_id: MigrationId,
        #[source]
        source: TransactionError,
    },

    /// A pending migration failed; wraps the cause with the failing migration
    #[error("Migration '{name}' ({migration_id}) failed: {source}")]
    ExecutionFailed {
        migration_id: MigrationId,
        name: String,
        #[source]
        source: Box<MigrationError>,
    },

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// The database connection could not be established
    #[error("Connection error: {0}")]
    Connection(#[from] crate::connection::ConnectionError),
}

impl MigrationError {
    /// Process exit code for this error
    ///
    /// `2` lock timeout, `3` migration failure, `4` irreversible revert,
    /// `1` anything else.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            MigrationError::LockTimeout { .. } => 2,
            MigrationError::ScriptNotFound { .. }
            | MigrationError::ScriptLoad { .. }
            | MigrationError::Statement { .. }
            | MigrationError::Transaction { .. }
            | MigrationError::DuplicateLedgerEntry(_)
            | MigrationError::ExecutionFailed { .. } => 3,
            MigrationError::IrreversibleMigration { .. } => 4,
            _ => 1,
        }
    }
}
