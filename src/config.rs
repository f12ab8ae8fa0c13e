//! Configuration parsing for substore.
//!
//! Supports:
//! - CLI arguments via clap
//! - Environment variable overrides
//! - A database URL selecting the backend

use clap::Args;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::storage::schema::{InvalidTableName, TableName};

/// Error type for configuration values that clap cannot validate on its own.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unsupported database url {0:?}: expected sqlite://PATH, sqlite::memory: or postgres://...")]
    UnsupportedUrl(String),

    #[error("sqlite url is missing a file path")]
    EmptySqlitePath,

    #[error(transparent)]
    InvalidTable(#[from] InvalidTableName),
}

/// Which database to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseConfig {
    /// `None` selects a private in-memory database.
    Sqlite { path: Option<PathBuf> },
    Postgres { url: String },
}

impl FromStr for DatabaseConfig {
    type Err = ConfigError;

    fn from_str(url: &str) -> Result<Self, Self::Err> {
        if url == "sqlite::memory:" || url == "sqlite://:memory:" {
            return Ok(Self::Sqlite { path: None });
        }
        if let Some(path) = url.strip_prefix("sqlite://") {
            if path.is_empty() {
                return Err(ConfigError::EmptySqlitePath);
            }
            return Ok(Self::Sqlite {
                path: Some(PathBuf::from(path)),
            });
        }
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            return Ok(Self::Postgres {
                url: url.to_string(),
            });
        }
        Err(ConfigError::UnsupportedUrl(url.to_string()))
    }
}

/// Store configuration shared by every `substore` command.
#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Database URL: sqlite://PATH, sqlite::memory: or postgres://USER@HOST/DB
    #[arg(
        long,
        env = "SUBSTORE_DATABASE_URL",
        default_value = "sqlite://./data/subscriptions.db"
    )]
    pub database_url: String,

    /// Name of the subscriptions table
    #[arg(long, env = "SUBSTORE_TABLE", default_value = "subscriptions")]
    pub table: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "SUBSTORE_LOG_JSON")]
    pub log_json: bool,

    /// Size of the connection pool
    #[arg(long, env = "SUBSTORE_POOL_SIZE", default_value_t = 4)]
    pub pool_size: u32,

    /// How long to wait on a lock held by another transaction, in milliseconds
    #[arg(long, env = "SUBSTORE_LOCK_TIMEOUT_MS", default_value_t = 5000)]
    pub lock_timeout_ms: u64,

    /// Connection timeout in milliseconds (PostgreSQL only)
    #[arg(long, env = "SUBSTORE_CONNECT_TIMEOUT_MS", default_value_t = 5000)]
    pub connect_timeout_ms: u64,
}

impl Config {
    /// Configuration for a SQLite database file, defaults elsewhere.
    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Self {
            database_url: format!("sqlite://{}", path.into().display()),
            ..Self::default()
        }
    }

    pub fn database(&self) -> Result<DatabaseConfig, ConfigError> {
        self.database_url.parse()
    }

    pub fn table_name(&self) -> Result<TableName, ConfigError> {
        Ok(TableName::new(self.table.clone())?)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/subscriptions.db".into(),
            table: "subscriptions".into(),
            log_level: "info".into(),
            log_json: false,
            pool_size: 4,
            lock_timeout_ms: 5000,
            connect_timeout_ms: 5000,
        }
    }
}
