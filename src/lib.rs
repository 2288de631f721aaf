//! # Lockkeeper
//!
//! Versioned schema migrations for PostgreSQL (via `may_postgres`) and SQLite.
//!
//! Migrations are plain values: an id, a name, an ordered list of
//! [`migration::SchemaOperation`]s to apply and the list that undoes them. A
//! [`migration::Migrator`] applies whatever the ledger table says is pending,
//! one transaction per migration, while holding a database-wide lock so that
//! several deploying instances can start at once.

pub mod config;
pub mod connection;
pub mod executor;
pub mod metrics;
pub mod migration;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod transaction;

pub use config::MigratorConfig;
pub use connection::{connect, ConnectionError};
pub use executor::{Dialect, ExecutorError, MayPostgresExecutor, SchemaExecutor, SqlRow, SqlValue};
pub use migration::{Migration, MigrationError, MigrationId, MigrationRegistry, Migrator};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteExecutor;
pub use transaction::{Transaction, TransactionError};
