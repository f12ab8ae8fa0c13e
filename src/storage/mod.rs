//! Relational persistence for subscriptions.
//!
//! Provides:
//! - A backend abstraction with SQLite and PostgreSQL implementations
//! - Schema provisioning by introspect-and-diff
//! - The row codec and criteria filter
//! - The transactional store used by the catch-up engine

pub mod backend;
pub mod codec;
pub mod criteria;
pub mod postgres;
pub mod schema;
pub mod sqlite;
pub mod store;

pub use backend::{Backend, BackendError, BackendErrorKind, Dialect, LockingMode, SqlValue};
pub use criteria::{CriteriaError, SubscriptionCriteria};
pub use schema::TableName;
pub use store::{SqlSubscriptionStore, StoreError, SubscriptionStore};

use crate::config::{Config, ConfigError, DatabaseConfig};
use crate::clock::Clock;
use thiserror::Error;

/// Failure opening a store from configuration.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to connect: {0}")]
    Connect(#[from] BackendError),
}

/// A backend selected at runtime.
pub type DynBackend = Box<dyn Backend + Send>;

/// Open a dedicated connection to the configured database.
pub fn open_backend(config: &Config) -> Result<DynBackend, OpenError> {
    let backend: DynBackend = match config.database()? {
        DatabaseConfig::Sqlite { path: Some(path) } => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|err| {
                    BackendError::new(
                        BackendErrorKind::Connection,
                        format!("cannot create {}: {err}", parent.display()),
                    )
                })?;
            }
            let pool = sqlite::SqlitePool::open(&path, config.pool_size, config.lock_timeout())?;
            Box::new(pool.backend()?)
        }
        DatabaseConfig::Sqlite { path: None } => Box::new(sqlite::SqlitePool::memory()?.backend()?),
        DatabaseConfig::Postgres { url } => {
            let options = self::postgres::PostgresOptions {
                url,
                pool_size: config.pool_size,
                connect_timeout: config.connect_timeout(),
                lock_timeout: config.lock_timeout(),
            };
            Box::new(self::postgres::PostgresPool::new(&options)?.backend()?)
        }
    };
    tracing::debug!(dialect = %backend.dialect(), "Opened backend");
    Ok(backend)
}

/// Open a store on the configured database and table.
pub fn open_store<C: Clock>(
    config: &Config,
    clock: C,
) -> Result<SqlSubscriptionStore<DynBackend, C>, OpenError> {
    let table = config.table_name()?;
    Ok(SqlSubscriptionStore::new(open_backend(config)?, clock, table))
}
