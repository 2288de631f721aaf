//! Shared fixtures for the SQLite-backed integration tests
#![allow(dead_code)]

use lockkeeper::migration::{
    ColumnType, DefaultValue, Migration, MigrationRegistry, Migrator, SchemaOperation,
    StaticScriptLoader,
};
use lockkeeper::{SchemaExecutor, SqliteExecutor};
use std::path::Path;
use std::time::Duration;

pub const M1: i64 = 20_240_120_120_000;
pub const M2: i64 = 20_240_121_090_000;
pub const M3: i64 = 20_240_122_150_000;

pub fn create_user_table(db: &SqliteExecutor) {
    db.batch_execute(r#"CREATE TABLE IF NOT EXISTS "User" (Id INTEGER PRIMARY KEY, Email TEXT NOT NULL)"#)
        .expect("create User table");
}

/// In-memory database with an empty `User` table
pub fn user_db() -> SqliteExecutor {
    let db = SqliteExecutor::open_in_memory().expect("open in-memory database");
    create_user_table(&db);
    db
}

/// File database with an empty `User` table
pub fn user_db_file(path: &Path) -> SqliteExecutor {
    let db = SqliteExecutor::open(path).expect("open database file");
    create_user_table(&db);
    db
}

/// Adds a `boolean NOT NULL DEFAULT false` column to `User`; reverting drops it
pub fn flag_migration(id: i64, column: &str) -> Migration {
    Migration::reversible(
        id,
        format!("user_{}", column.to_lowercase()),
        vec![SchemaOperation::add_column(
            "User",
            column,
            ColumnType::Boolean,
            false,
            Some(DefaultValue::Bool(false)),
        )],
        vec![SchemaOperation::drop_column("User", column)],
    )
}

/// M1 adds `ForcePasswordReset`, M2 adds `UsesKeyConnector`
pub fn user_registry() -> MigrationRegistry {
    MigrationRegistry::new(vec![
        flag_migration(M1, "ForcePasswordReset"),
        flag_migration(M2, "UsesKeyConnector"),
    ])
    .expect("valid registry")
}

pub fn migrator(registry: MigrationRegistry) -> Migrator {
    migrator_with_scripts(registry, StaticScriptLoader::new())
}

pub fn migrator_with_scripts(registry: MigrationRegistry, scripts: StaticScriptLoader) -> Migrator {
    Migrator::new(registry, scripts)
        .with_lock_timeout(Duration::from_secs(10))
        .with_lock_poll_interval(Duration::from_millis(10))
}

/// Column names of `User`, in table order
pub fn user_columns(db: &SqliteExecutor) -> Vec<String> {
    db.query_all("SELECT name FROM pragma_table_info('User')", &[])
        .expect("read table info")
        .iter()
        .filter_map(|row| row.get_str(0).map(str::to_string))
        .collect()
}

pub fn ledger_ids(db: &SqliteExecutor) -> Vec<i64> {
    db.query_all(
        "SELECT migration_id FROM lockkeeper_migrations ORDER BY migration_id",
        &[],
    )
    .expect("read ledger")
    .iter()
    .map(|row| row.get_i64(0).expect("integer id"))
    .collect()
}
