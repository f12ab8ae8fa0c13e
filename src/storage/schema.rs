//! Schema provisioning for the subscriptions table.
//!
//! Provides:
//! - The fixed desired table shape
//! - A narrow diff between an introspected shape and the desired one
//! - Dialect-specific rendering of the resulting changes
//!
//! Statements are applied one by one and are not wrapped in a transaction.
//! A failure part way through leaves the table partially migrated; running
//! provisioning again recomputes the diff from whatever is there and finishes
//! the job.

use std::fmt;
use thiserror::Error;

use super::backend::{Backend, BackendError, Dialect};
use crate::subscription::{MAX_ID_LENGTH, MAX_STATUS_LENGTH};

/// Longest identifier accepted for the table name (PostgreSQL's limit).
pub const MAX_TABLE_NAME_LENGTH: usize = 63;

/// Prefix of the scratch table used by SQLite table rebuilds.
const REBUILD_PREFIX: &str = "__temp__";

pub const COLUMN_ID: &str = "id";
pub const COLUMN_POSITION: &str = "position";
pub const COLUMN_STATUS: &str = "status";
pub const COLUMN_ERROR_MESSAGE: &str = "error_message";
pub const COLUMN_ERROR_PREVIOUS_STATUS: &str = "error_previous_status";
pub const COLUMN_ERROR_TRACE: &str = "error_trace";
pub const COLUMN_LAST_SAVED_AT: &str = "last_saved_at";

/// Every column in select-list order.
pub const COLUMNS: [&str; 7] = [
    COLUMN_ID,
    COLUMN_POSITION,
    COLUMN_STATUS,
    COLUMN_ERROR_MESSAGE,
    COLUMN_ERROR_PREVIOUS_STATUS,
    COLUMN_ERROR_TRACE,
    COLUMN_LAST_SAVED_AT,
];

/// Rejected table name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid table name {0:?}: expected [A-Za-z_][A-Za-z0-9_]* of at most 63 characters")]
pub struct InvalidTableName(pub String);

/// Validated name of the backing table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName(String);

impl TableName {
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidTableName> {
        let name = name.into();
        let mut chars = name.chars();
        let valid_start = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid_start || !valid_rest || name.len() > MAX_TABLE_NAME_LENGTH {
            return Err(InvalidTableName(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the secondary index on `status`.
    pub fn status_index(&self) -> String {
        format!("idx_{}_status", self.0)
    }

    fn rebuild_table(&self) -> String {
        format!("{REBUILD_PREFIX}{}", self.0)
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical column type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnKind {
    /// Bounded string (`VARCHAR(n)`).
    String { length: u32 },
    Integer,
    /// Unbounded text.
    Text,
    /// Date and time without zone, second precision.
    Timestamp,
    /// A declared type this crate does not model. Never equal to a desired
    /// column, so it always gets reconciled.
    Other(String),
}

impl ColumnKind {
    fn sql(&self, dialect: Dialect) -> String {
        match (self, dialect) {
            (Self::String { length }, _) => format!("VARCHAR({length})"),
            (Self::Integer, _) => "INTEGER".to_string(),
            (Self::Text, _) => "TEXT".to_string(),
            (Self::Timestamp, Dialect::Sqlite) => "DATETIME".to_string(),
            (Self::Timestamp, Dialect::Postgres) => "TIMESTAMP(0) WITHOUT TIME ZONE".to_string(),
            (Self::Other(declared), _) => declared.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnShape {
    pub name: String,
    pub kind: ColumnKind,
    pub nullable: bool,
}

impl ColumnShape {
    pub fn new(name: impl Into<String>, kind: ColumnKind, nullable: bool) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable,
        }
    }

    fn definition(&self, dialect: Dialect) -> String {
        let mut sql = format!("{} {}", dialect.quote(&self.name), self.kind.sql(dialect));
        if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        sql
    }
}

/// A secondary index. Indexes are matched by columns and uniqueness; the name
/// only matters for dropping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexShape {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

impl IndexShape {
    fn same_definition(&self, other: &Self) -> bool {
        self.columns == other.columns && self.unique == other.unique
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKeyShape {
    /// Constraint name, when the backend names primary keys.
    pub name: Option<String>,
    pub columns: Vec<String>,
}

/// Structure of one table as seen by the provisioner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableShape {
    pub columns: Vec<ColumnShape>,
    pub primary_key: Option<PrimaryKeyShape>,
    pub indexes: Vec<IndexShape>,
}

impl TableShape {
    pub fn column(&self, name: &str) -> Option<&ColumnShape> {
        self.columns.iter().find(|column| column.name == name)
    }
}

/// The shape the subscriptions table must have.
pub fn desired_shape(table: &TableName) -> TableShape {
    let status_length = MAX_STATUS_LENGTH as u32;
    TableShape {
        columns: vec![
            ColumnShape::new(
                COLUMN_ID,
                ColumnKind::String {
                    length: MAX_ID_LENGTH as u32,
                },
                false,
            ),
            ColumnShape::new(COLUMN_POSITION, ColumnKind::Integer, false),
            ColumnShape::new(
                COLUMN_STATUS,
                ColumnKind::String {
                    length: status_length,
                },
                false,
            ),
            ColumnShape::new(COLUMN_ERROR_MESSAGE, ColumnKind::Text, true),
            ColumnShape::new(
                COLUMN_ERROR_PREVIOUS_STATUS,
                ColumnKind::String {
                    length: status_length,
                },
                true,
            ),
            ColumnShape::new(COLUMN_ERROR_TRACE, ColumnKind::Text, true),
            ColumnShape::new(COLUMN_LAST_SAVED_AT, ColumnKind::Timestamp, false),
        ],
        primary_key: Some(PrimaryKeyShape {
            name: None,
            columns: vec![COLUMN_ID.to_string()],
        }),
        indexes: vec![IndexShape {
            name: table.status_index(),
            columns: vec![COLUMN_STATUS.to_string()],
            unique: false,
        }],
    }
}

/// One structural difference between the actual and desired shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChange {
    DropIndex(IndexShape),
    DropPrimaryKey(PrimaryKeyShape),
    DropColumn(String),
    AddColumn(ColumnShape),
    AlterColumn { from: ColumnShape, to: ColumnShape },
    AddPrimaryKey(Vec<String>),
    CreateIndex(IndexShape),
}

impl SchemaChange {
    /// Whether SQLite can apply this change without rebuilding the table.
    fn is_simple_for_sqlite(&self) -> bool {
        match self {
            Self::DropIndex(_) | Self::CreateIndex(_) => true,
            Self::AddColumn(column) => column.nullable,
            _ => false,
        }
    }
}

/// Compute the changes that turn `actual` into `desired`, ordered so that
/// drops precede additions.
pub fn diff(actual: &TableShape, desired: &TableShape) -> Vec<SchemaChange> {
    let mut changes = Vec::new();

    for index in &actual.indexes {
        if !desired.indexes.iter().any(|d| d.same_definition(index)) {
            changes.push(SchemaChange::DropIndex(index.clone()));
        }
    }

    let actual_pk = actual.primary_key.as_ref().map(|pk| &pk.columns);
    let desired_pk = desired.primary_key.as_ref().map(|pk| &pk.columns);
    let primary_key_differs = actual_pk != desired_pk;
    if primary_key_differs {
        if let Some(pk) = &actual.primary_key {
            changes.push(SchemaChange::DropPrimaryKey(pk.clone()));
        }
    }

    for column in &actual.columns {
        if desired.column(&column.name).is_none() {
            changes.push(SchemaChange::DropColumn(column.name.clone()));
        }
    }

    for column in &desired.columns {
        match actual.column(&column.name) {
            None => changes.push(SchemaChange::AddColumn(column.clone())),
            Some(existing) if existing != column => changes.push(SchemaChange::AlterColumn {
                from: existing.clone(),
                to: column.clone(),
            }),
            Some(_) => {}
        }
    }

    if primary_key_differs {
        if let Some(pk) = &desired.primary_key {
            changes.push(SchemaChange::AddPrimaryKey(pk.columns.clone()));
        }
    }

    for index in &desired.indexes {
        if !actual.indexes.iter().any(|a| a.same_definition(index)) {
            changes.push(SchemaChange::CreateIndex(index.clone()));
        }
    }

    changes
}

/// Statements creating `shape` as `table` from scratch.
pub fn create_table_statements(
    dialect: Dialect,
    table: &str,
    shape: &TableShape,
) -> Vec<String> {
    let mut definitions: Vec<String> = shape
        .columns
        .iter()
        .map(|column| column.definition(dialect))
        .collect();
    if let Some(pk) = &shape.primary_key {
        definitions.push(format!("PRIMARY KEY ({})", quote_list(dialect, &pk.columns)));
    }
    let mut statements = vec![format!(
        "CREATE TABLE {} ({})",
        dialect.quote(table),
        definitions.join(", ")
    )];
    statements.extend(
        shape
            .indexes
            .iter()
            .map(|index| create_index_statement(dialect, table, index)),
    );
    statements
}

/// Render `changes` for `dialect`.
pub fn alter_statements(
    dialect: Dialect,
    table: &TableName,
    actual: &TableShape,
    desired: &TableShape,
    changes: &[SchemaChange],
) -> Vec<String> {
    if changes.is_empty() {
        return Vec::new();
    }
    match dialect {
        Dialect::Sqlite if !changes.iter().all(SchemaChange::is_simple_for_sqlite) => {
            sqlite_rebuild(table, actual, desired)
        }
        _ => changes
            .iter()
            .flat_map(|change| render_change(dialect, table.as_str(), change))
            .collect(),
    }
}

/// Plain `ALTER TABLE` rendering. SQLite only ever sees the subset it
/// supports.
fn render_change(dialect: Dialect, table: &str, change: &SchemaChange) -> Vec<String> {
    let quoted = dialect.quote(table);
    match change {
        SchemaChange::DropIndex(index) => vec![format!("DROP INDEX {}", dialect.quote(&index.name))],
        SchemaChange::DropPrimaryKey(pk) => {
            let name = pk.name.clone().unwrap_or_else(|| format!("{table}_pkey"));
            vec![format!(
                "ALTER TABLE {quoted} DROP CONSTRAINT {}",
                dialect.quote(&name)
            )]
        }
        SchemaChange::DropColumn(column) => vec![format!(
            "ALTER TABLE {quoted} DROP COLUMN {}",
            dialect.quote(column)
        )],
        SchemaChange::AddColumn(column) => vec![format!(
            "ALTER TABLE {quoted} ADD COLUMN {}",
            column.definition(dialect)
        )],
        SchemaChange::AlterColumn { from, to } => {
            let column = dialect.quote(&to.name);
            let mut statements = Vec::new();
            if from.kind != to.kind {
                let target = to.kind.sql(dialect);
                // An explicit cast to VARCHAR(n) truncates; the implicit
                // conversion fails on values that do not fit.
                let using = match to.kind {
                    ColumnKind::String { .. } | ColumnKind::Text => String::new(),
                    _ => format!(" USING {column}::{target}"),
                };
                statements.push(format!(
                    "ALTER TABLE {quoted} ALTER COLUMN {column} TYPE {target}{using}"
                ));
            }
            if from.nullable != to.nullable {
                let action = if to.nullable { "DROP" } else { "SET" };
                statements.push(format!(
                    "ALTER TABLE {quoted} ALTER COLUMN {column} {action} NOT NULL"
                ));
            }
            statements
        }
        SchemaChange::AddPrimaryKey(columns) => vec![format!(
            "ALTER TABLE {quoted} ADD PRIMARY KEY ({})",
            quote_list(dialect, columns)
        )],
        SchemaChange::CreateIndex(index) => vec![create_index_statement(dialect, table, index)],
    }
}

/// SQLite cannot alter column types, nullability or keys in place: copy the
/// data into a freshly created table and swap it in.
fn sqlite_rebuild(table: &TableName, actual: &TableShape, desired: &TableShape) -> Vec<String> {
    let dialect = Dialect::Sqlite;
    let scratch = table.rebuild_table();
    let mut statements = vec![format!("DROP TABLE IF EXISTS {}", dialect.quote(&scratch))];
    let scratch_shape = TableShape {
        indexes: Vec::new(),
        ..desired.clone()
    };
    statements.extend(create_table_statements(dialect, &scratch, &scratch_shape));

    let shared: Vec<String> = desired
        .columns
        .iter()
        .filter(|column| actual.column(&column.name).is_some())
        .map(|column| column.name.clone())
        .collect();
    if !shared.is_empty() {
        let columns = quote_list(dialect, &shared);
        statements.push(format!(
            "INSERT INTO {} ({columns}) SELECT {columns} FROM {}",
            dialect.quote(&scratch),
            dialect.quote(table.as_str())
        ));
    }
    statements.push(format!("DROP TABLE {}", dialect.quote(table.as_str())));
    statements.push(format!(
        "ALTER TABLE {} RENAME TO {}",
        dialect.quote(&scratch),
        dialect.quote(table.as_str())
    ));
    statements.extend(
        desired
            .indexes
            .iter()
            .map(|index| create_index_statement(dialect, table.as_str(), index)),
    );
    statements
}

fn create_index_statement(dialect: Dialect, table: &str, index: &IndexShape) -> String {
    format!(
        "CREATE {}INDEX {} ON {} ({})",
        if index.unique { "UNIQUE " } else { "" },
        dialect.quote(&index.name),
        dialect.quote(table),
        quote_list(dialect, &index.columns)
    )
}

fn quote_list(dialect: Dialect, identifiers: &[String]) -> String {
    identifiers
        .iter()
        .map(|identifier| dialect.quote(identifier))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Failure while provisioning the schema.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to inspect table: {0}")]
    Introspection(#[source] BackendError),

    #[error("statement {index} failed ({statement}): {source}")]
    Statement {
        /// Zero-based position of the failed statement; also the number of
        /// statements already applied.
        index: usize,
        statement: String,
        #[source]
        source: BackendError,
    },
}

/// Statements needed to bring `table` to the desired shape. Empty when the
/// table already matches.
pub fn required_statements<B: Backend + ?Sized>(
    backend: &mut B,
    table: &TableName,
) -> Result<Vec<String>, BackendError> {
    let dialect = backend.dialect();
    let desired = desired_shape(table);

    if !backend.table_exists(table.as_str())? {
        let scratch = table.rebuild_table();
        if backend.table_exists(&scratch)? {
            // An earlier rebuild stopped after dropping the original table.
            let recovered = backend.introspect_table(&scratch)?;
            let mut statements = vec![format!(
                "ALTER TABLE {} RENAME TO {}",
                dialect.quote(&scratch),
                dialect.quote(table.as_str())
            )];
            let changes = diff(&recovered, &desired);
            statements.extend(alter_statements(
                dialect, table, &recovered, &desired, &changes,
            ));
            return Ok(statements);
        }
        return Ok(create_table_statements(dialect, table.as_str(), &desired));
    }

    let actual = backend.introspect_table(table.as_str())?;
    let changes = diff(&actual, &desired);
    tracing::debug!(table = %table, changes = changes.len(), "Computed schema diff");
    Ok(alter_statements(dialect, table, &actual, &desired, &changes))
}

/// Compute and apply the required statements in order, stopping at the first
/// failure. Returns the number of statements applied.
pub fn ensure_schema<B: Backend + ?Sized>(
    backend: &mut B,
    table: &TableName,
) -> Result<usize, SchemaError> {
    let statements = required_statements(backend, table).map_err(SchemaError::Introspection)?;
    for (index, statement) in statements.iter().enumerate() {
        tracing::info!(table = %table, statement = %statement, "Applying schema statement");
        backend
            .execute_batch(statement)
            .map_err(|source| SchemaError::Statement {
                index,
                statement: statement.clone(),
                source,
            })?;
    }
    Ok(statements.len())
}
