//! Relational backend abstraction.
//!
//! A [`Backend`] is one dedicated connection capable of running parameterized
//! statements, introspecting its own catalog and holding an explicit
//! transaction open across calls. The store never talks to a driver directly.

use std::fmt;
use thiserror::Error;

use super::schema::TableShape;

/// A single dynamically typed cell or statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    /// Name of the value's type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Integer(_) => "integer",
            Self::Real(_) => "real",
            Self::Text(_) => "text",
            Self::Blob(_) => "blob",
        }
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// One result row, cells in select-list order.
pub type BackendRow = Vec<SqlValue>;

/// Concurrency guarantee a backend provides for locked reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockingMode {
    /// Matching rows are locked individually (`SELECT ... FOR UPDATE`).
    RowLevel,
    /// No row locks; writers are serialized by a database-wide write lock
    /// taken when the transaction begins.
    DatabaseLevel,
}

impl fmt::Display for LockingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RowLevel => "row-level",
            Self::DatabaseLevel => "database-level",
        })
    }
}

/// SQL dialect of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    pub fn name(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
        }
    }

    pub fn locking_mode(self) -> LockingMode {
        match self {
            Self::Sqlite => LockingMode::DatabaseLevel,
            Self::Postgres => LockingMode::RowLevel,
        }
    }

    /// Placeholder for the 1-based parameter `index`.
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Self::Sqlite => format!("?{index}"),
            Self::Postgres => format!("${index}"),
        }
    }

    /// Statement opening an explicit transaction.
    ///
    /// SQLite takes its write lock up front so concurrent catch-up runs
    /// serialize at the transaction boundary instead of failing on upgrade.
    pub fn begin_statement(self) -> &'static str {
        match self {
            Self::Sqlite => "BEGIN IMMEDIATE",
            Self::Postgres => "BEGIN",
        }
    }

    /// Quote an identifier. Both dialects accept ANSI double quotes.
    pub fn quote(self, identifier: &str) -> String {
        format!("\"{}\"", identifier.replace('"', "\"\""))
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Coarse classification of backend failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// Pool exhaustion or connection setup failure.
    Connection,
    /// Unique or primary key constraint violated.
    UniqueViolation,
    /// Lock wait timed out or the database was busy.
    Busy,
    Other,
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connection => "connection",
            Self::UniqueViolation => "unique violation",
            Self::Busy => "busy",
            Self::Other => "database",
        })
    }
}

/// Error raised by a backend.
#[derive(Debug, Clone, Error)]
#[error("{kind} error: {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Other, message)
    }

    pub fn is_unique_violation(&self) -> bool {
        self.kind == BackendErrorKind::UniqueViolation
    }
}

impl From<r2d2::Error> for BackendError {
    fn from(err: r2d2::Error) -> Self {
        Self::new(BackendErrorKind::Connection, err.to_string())
    }
}

/// A dedicated connection to a relational database.
pub trait Backend {
    fn dialect(&self) -> Dialect;

    /// Run a parameterized statement, returning the number of affected rows.
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, BackendError>;

    /// Run one or more parameterless statements.
    fn execute_batch(&mut self, sql: &str) -> Result<(), BackendError>;

    /// Run a parameterized query and collect every row.
    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<BackendRow>, BackendError>;

    fn table_exists(&mut self, table: &str) -> Result<bool, BackendError>;

    /// Read the current shape of `table` from the catalog.
    fn introspect_table(&mut self, table: &str) -> Result<TableShape, BackendError>;
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn dialect(&self) -> Dialect {
        (**self).dialect()
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, BackendError> {
        (**self).execute(sql, params)
    }

    fn execute_batch(&mut self, sql: &str) -> Result<(), BackendError> {
        (**self).execute_batch(sql)
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<BackendRow>, BackendError> {
        (**self).query(sql, params)
    }

    fn table_exists(&mut self, table: &str) -> Result<bool, BackendError> {
        (**self).table_exists(table)
    }

    fn introspect_table(&mut self, table: &str) -> Result<TableShape, BackendError> {
        (**self).introspect_table(table)
    }
}
