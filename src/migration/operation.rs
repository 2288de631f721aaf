//! Schema operations: the closed set of primitive edits a migration composes

use std::fmt;

/// Column type of an added column
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Boolean,
    SmallInt,
    Integer,
    BigInt,
    Text,
    /// `VARCHAR(len)`
    Varchar(u32),
    Timestamp,
    TimestampTz,
    Uuid,
    /// Any other type, rendered verbatim (e.g. `"jsonb"`)
    Custom(String),
}

/// Default value of an added column
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefaultValue {
    Bool(bool),
    Int(i64),
    Text(String),
    /// Raw SQL expression such as `CURRENT_TIMESTAMP`
    Expression(String),
}

/// One primitive schema edit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaOperation {
    /// `ALTER TABLE <table> ADD COLUMN <column> <type> [NOT NULL] [DEFAULT ..]`
    AddColumn {
        table: String,
        column: String,
        column_type: ColumnType,
        nullable: bool,
        default: Option<DefaultValue>,
    },
    /// `ALTER TABLE <table> DROP COLUMN <column>`
    DropColumn { table: String, column: String },
    /// Script text resolved through the script loader and executed verbatim
    RawScript { script_id: String },
}

impl SchemaOperation {
    /// Add a column
    pub fn add_column(
        table: impl Into<String>,
        column: impl Into<String>,
        column_type: ColumnType,
        nullable: bool,
        default: Option<DefaultValue>,
    ) -> Self {
        SchemaOperation::AddColumn {
            table: table.into(),
            column: column.into(),
            column_type,
            nullable,
            default,
        }
    }

    /// Drop a column
    pub fn drop_column(table: impl Into<String>, column: impl Into<String>) -> Self {
        SchemaOperation::DropColumn {
            table: table.into(),
            column: column.into(),
        }
    }

    /// Execute the script registered under `script_id`
    pub fn raw_script(script_id: impl Into<String>) -> Self {
        SchemaOperation::RawScript {
            script_id: script_id.into(),
        }
    }
}

impl fmt::Display for SchemaOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaOperation::AddColumn { table, column, .. } => {
                write!(f, "ADD COLUMN {table}.{column}")
            }
            SchemaOperation::DropColumn { table, column } => {
                write!(f, "DROP COLUMN {table}.{column}")
            }
            SchemaOperation::RawScript { script_id } => write!(f, "SCRIPT {script_id}"),
        }
    }
}
