//! SchemaManager - interprets schema operations against an executor
//!
//! Column edits are rendered with sea-query for the executor's dialect; raw
//! scripts are resolved through the [`ScriptLoader`] and run as a batch.

use super::error::MigrationError;
use super::migration::MigrationId;
use super::operation::{ColumnType, DefaultValue, SchemaOperation};
use super::script::ScriptLoader;
use crate::executor::{Dialect, SchemaExecutor};
use sea_query::{
    Alias, ColumnDef, Expr, PostgresQueryBuilder, SqliteQueryBuilder,
    Table, TableAlterStatement,
};

/// Executes schema operations on behalf of one migration step
pub struct SchemaManager<'a> {
    executor: &'a dyn SchemaExecutor,
    scripts: &'a dyn ScriptLoader,
}

impl<'a> SchemaManager<'a> {
    pub fn new(executor: &'a dyn SchemaExecutor, scripts: &'a dyn ScriptLoader) -> Self {
        Self { executor, scripts }
    }

    /// Get the executor operations run on
    pub fn executor(&self) -> &dyn SchemaExecutor {
        self.executor
    }

    /// Run `operations` in order, stopping at the first failure
    ///
    /// Failures are reported with `migration_id` and the failing operation.
    pub fn run_all(
        &self,
        migration_id: MigrationId,
        operations: &[SchemaOperation],
    ) -> Result<(), MigrationError> {
        for operation in operations {
            self.run(migration_id, operation)?;
        }
        Ok(())
    }

    /// Run a single operation
    pub fn run(
        &self,
        migration_id: MigrationId,
        operation: &SchemaOperation,
    ) -> Result<(), MigrationError> {
        log::debug!("Migration {migration_id}: {operation}");

        let sql = match operation {
            SchemaOperation::RawScript { script_id } => self.scripts.resolve(script_id)?,
            other => render(other, self.executor.dialect()).unwrap_or_default(),
        };

        self.executor
            .batch_execute(&sql)
            .map_err(|source| MigrationError::Statement {
                migration_id,
                operation: operation.to_string(),
                source,
            })
    }
}

/// Render a column operation as DDL for `dialect`
///
/// Returns `None` for `RawScript`, whose text comes from a script loader.
pub fn render(operation: &SchemaOperation, dialect: Dialect) -> Option<String> {
    let alter = match operation {
        SchemaOperation::AddColumn {
            table,
            column,
            column_type,
            nullable,
            default,
        } => {
            let mut def = ColumnDef::new(Alias::new(column.as_str()));
            apply_column_type(&mut def, column_type);
            if *nullable {
                def.null();
            } else {
                def.not_null();
            }
            if let Some(default) = default {
                apply_default(&mut def, default);
            }
            Table::alter()
                .table(Alias::new(table.as_str()))
                .add_column(&mut def)
                .to_owned()
        }
        SchemaOperation::DropColumn { table, column } => Table::alter()
            .table(Alias::new(table.as_str()))
            .drop_column(Alias::new(column.as_str()))
            .to_owned(),
        SchemaOperation::RawScript { .. } => return None,
    };
    Some(build(&alter, dialect))
}

fn build(alter: &TableAlterStatement, dialect: Dialect) -> String {
    match dialect {
        Dialect::Postgres => alter.build(PostgresQueryBuilder),
        Dialect::Sqlite => alter.build(SqliteQueryBuilder),
    }
}

fn apply_column_type(def: &mut ColumnDef, column_type: &ColumnType) {
    match column_type {
        ColumnType::Boolean => def.boolean(),
        ColumnType::SmallInt => def.small_integer(),
        ColumnType::Integer => def.integer(),
        ColumnType::BigInt => def.big_integer(),
        ColumnType::Text => def.text(),
        ColumnType::Varchar(len) => def.string_len(*len),
        ColumnType::Timestamp => def.timestamp(),
        ColumnType::TimestampTz => def.timestamp_with_time_zone(),
        ColumnType::Uuid => def.uuid(),
        ColumnType::Custom(name) => def.custom(Alias::new(name.as_str())),
    };
}

fn apply_default(def: &mut ColumnDef, default: &DefaultValue) {
    match default {
        DefaultValue::Bool(v) => def.default(*v),
        DefaultValue::Int(v) => def.default(*v),
        DefaultValue::Text(v) => def.default(v.clone()),
        DefaultValue::Expression(expr) => def.default(Expr::cust(expr.clone())),
    };
}
