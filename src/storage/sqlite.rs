//! SQLite backend.
//!
//! Uses r2d2 with r2d2_sqlite for pooled connections. Every connection gets
//! the same pragmas on checkout: WAL journaling, `synchronous=FULL` and a
//! busy timeout taken from the configured lock timeout.
//!
//! SQLite has no row locks. Transactions open with `BEGIN IMMEDIATE`, which
//! takes the database-wide write lock up front; a second writer waits there
//! (up to the busy timeout) until the first commits or rolls back.

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{params_from_iter, ErrorCode, ToSql};
use std::path::Path;
use std::time::Duration;

use super::backend::{Backend, BackendError, BackendErrorKind, BackendRow, Dialect, SqlValue};
use super::schema::{ColumnKind, ColumnShape, IndexShape, PrimaryKeyShape, TableShape};

/// Pool of SQLite connections sharing one database.
#[derive(Clone)]
pub struct SqlitePool {
    pool: Pool<SqliteConnectionManager>,
}

impl SqlitePool {
    /// Open a pool on the database file at `path`, creating it if needed.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    /// * `max_size` - Maximum number of connections in the pool
    /// * `lock_timeout` - How long a connection waits on a locked database
    pub fn open<P: AsRef<Path>>(
        path: P,
        max_size: u32,
        lock_timeout: Duration,
    ) -> Result<Self, BackendError> {
        Self::build(SqliteConnectionManager::file(path), max_size, lock_timeout)
    }

    /// A private in-memory database.
    ///
    /// Each in-memory connection is its own database, so the pool holds a
    /// single connection.
    pub fn memory() -> Result<Self, BackendError> {
        Self::build(SqliteConnectionManager::memory(), 1, Duration::ZERO)
    }

    fn build(
        manager: SqliteConnectionManager,
        max_size: u32,
        lock_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let pool = Pool::builder()
            .max_size(max_size)
            .connection_customizer(Box::new(SqliteConnectionCustomizer { lock_timeout }))
            .build(manager)?;
        Ok(Self { pool })
    }

    /// Check out a dedicated connection.
    pub fn backend(&self) -> Result<SqliteBackend, BackendError> {
        Ok(SqliteBackend {
            conn: self.pool.get()?,
        })
    }

    /// Get the current pool state for monitoring.
    pub fn state(&self) -> r2d2::State {
        self.pool.state()
    }
}

/// Connection customizer that applies pragmas on checkout.
#[derive(Debug)]
struct SqliteConnectionCustomizer {
    lock_timeout: Duration,
}

impl r2d2::CustomizeConnection<rusqlite::Connection, rusqlite::Error>
    for SqliteConnectionCustomizer
{
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;
        conn.busy_timeout(self.lock_timeout)
    }
}

/// One pooled SQLite connection.
pub struct SqliteBackend {
    conn: PooledConnection<SqliteConnectionManager>,
}

impl SqliteBackend {
    /// Raw access to the underlying connection.
    pub fn connection(&self) -> &rusqlite::Connection {
        &self.conn
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::Owned(Value::Null),
            Self::Integer(value) => ToSqlOutput::Owned(Value::Integer(*value)),
            Self::Real(value) => ToSqlOutput::Owned(Value::Real(*value)),
            Self::Text(value) => ToSqlOutput::Borrowed(ValueRef::Text(value.as_bytes())),
            Self::Blob(value) => ToSqlOutput::Borrowed(ValueRef::Blob(value)),
        })
    }
}

fn read_value(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(value) => SqlValue::Integer(value),
        ValueRef::Real(value) => SqlValue::Real(value),
        ValueRef::Text(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => SqlValue::Text(text.to_string()),
            Err(_) => SqlValue::Blob(bytes.to_vec()),
        },
        ValueRef::Blob(bytes) => SqlValue::Blob(bytes.to_vec()),
    }
}

impl From<rusqlite::Error> for BackendError {
    fn from(err: rusqlite::Error) -> Self {
        let kind = match &err {
            rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
                ErrorCode::ConstraintViolation
                    if matches!(
                        failure.extended_code,
                        rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                            | rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    ) =>
                {
                    BackendErrorKind::UniqueViolation
                }
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => BackendErrorKind::Busy,
                ErrorCode::CannotOpen => BackendErrorKind::Connection,
                _ => BackendErrorKind::Other,
            },
            _ => BackendErrorKind::Other,
        };
        Self::new(kind, err.to_string())
    }
}

/// Map a declared SQLite column type onto the logical kind.
fn parse_declared_type(declared: &str) -> ColumnKind {
    let normalized = declared.trim().to_ascii_uppercase();
    match normalized.as_str() {
        "INTEGER" => ColumnKind::Integer,
        "TEXT" | "CLOB" => ColumnKind::Text,
        "DATETIME" => ColumnKind::Timestamp,
        _ => normalized
            .strip_prefix("VARCHAR(")
            .or_else(|| normalized.strip_prefix("CHARACTER VARYING("))
            .and_then(|rest| rest.strip_suffix(')'))
            .and_then(|length| length.trim().parse().ok())
            .map_or_else(
                || ColumnKind::Other(declared.to_string()),
                |length| ColumnKind::String { length },
            ),
    }
}

impl Backend for SqliteBackend {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, BackendError> {
        let affected = self.conn.execute(sql, params_from_iter(params.iter()))?;
        Ok(affected as u64)
    }

    fn execute_batch(&mut self, sql: &str) -> Result<(), BackendError> {
        Ok(self.conn.execute_batch(sql)?)
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<BackendRow>, BackendError> {
        let mut stmt = self.conn.prepare(sql)?;
        let width = stmt.column_count();
        let rows = stmt
            .query_map(params_from_iter(params.iter()), |row| {
                (0..width)
                    .map(|index| row.get_ref(index).map(read_value))
                    .collect::<Result<BackendRow, _>>()
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn table_exists(&mut self, table: &str) -> Result<bool, BackendError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn introspect_table(&mut self, table: &str) -> Result<TableShape, BackendError> {
        let mut columns = Vec::new();
        let mut key_columns: Vec<(i64, String)> = Vec::new();
        {
            let mut stmt = self.conn.prepare(
                "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1) ORDER BY cid",
            )?;
            let mut rows = stmt.query([table])?;
            while let Some(row) = rows.next()? {
                let name: String = row.get(0)?;
                let declared: String = row.get(1)?;
                let not_null: bool = row.get(2)?;
                let key_position: i64 = row.get(3)?;
                if key_position > 0 {
                    key_columns.push((key_position, name.clone()));
                }
                columns.push(ColumnShape::new(
                    name,
                    parse_declared_type(&declared),
                    !not_null,
                ));
            }
        }
        key_columns.sort();
        let primary_key = (!key_columns.is_empty()).then(|| PrimaryKeyShape {
            name: None,
            columns: key_columns.into_iter().map(|(_, name)| name).collect(),
        });

        // Only explicitly created indexes; automatic ones back the primary
        // key and UNIQUE constraints.
        let listed: Vec<(String, bool)> = {
            let mut stmt = self.conn.prepare(
                "SELECT name, \"unique\" FROM pragma_index_list(?1) WHERE origin = 'c' ORDER BY name",
            )?;
            let rows = stmt
                .query_map([table], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        let mut indexes = Vec::with_capacity(listed.len());
        for (name, unique) in listed {
            let mut stmt = self
                .conn
                .prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")?;
            let columns = stmt
                .query_map([&name], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            indexes.push(IndexShape {
                name,
                columns,
                unique,
            });
        }

        Ok(TableShape {
            columns,
            primary_key,
            indexes,
        })
    }
}
