//! Test utilities for substore integration tests.
//!
//! Provides:
//! - Temporary SQLite database fixtures
//! - Stores wired to a shared mock clock
//! - Subscription builders

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use time::macros::datetime;
use time::OffsetDateTime;

use substore::storage::sqlite::{SqliteBackend, SqlitePool};
use substore::storage::TableName;
use substore::{
    MockClock, Position, SqlSubscriptionStore, Subscription, SubscriptionId, SubscriptionStatus,
};

/// Time every fixture clock starts at.
pub const START: OffsetDateTime = datetime!(2025-01-06 14:32:08 UTC);

pub type TestStore = SqlSubscriptionStore<SqliteBackend, Arc<MockClock>>;

/// Test fixture that manages a temporary database file.
///
/// The directory is automatically cleaned up when the fixture is dropped.
pub struct TestFixture {
    /// Temporary directory for test database
    pub temp_dir: TempDir,
    /// Path to the database file
    pub db_path: PathBuf,
    pub pool: SqlitePool,
    pub clock: Arc<MockClock>,
}

impl TestFixture {
    /// Create a new fixture with an empty database and a clock at [`START`].
    pub fn new() -> Self {
        Self::with_lock_timeout(Duration::from_secs(5))
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        substore::observability::tracing::init_test_tracing();
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let db_path = temp_dir.path().join("test.db");
        let pool = SqlitePool::open(&db_path, 4, lock_timeout).expect("failed to open pool");
        Self {
            temp_dir,
            db_path,
            pool,
            clock: Arc::new(MockClock::new(START)),
        }
    }

    /// A store on the `subscriptions` table, without provisioning it.
    pub fn raw_store(&self) -> TestStore {
        self.raw_store_on("subscriptions")
    }

    pub fn raw_store_on(&self, table: &str) -> TestStore {
        SqlSubscriptionStore::new(
            self.pool.backend().expect("failed to check out connection"),
            Arc::clone(&self.clock),
            TableName::new(table).expect("invalid table name"),
        )
    }

    /// A store on the `subscriptions` table, provisioned and ready.
    pub fn store(&self) -> TestStore {
        use substore::SubscriptionStore;
        let mut store = self.raw_store();
        store.ensure_schema().expect("failed to provision schema");
        store
    }

    /// A separate plain connection for poking at the table directly.
    pub fn connection(&self) -> rusqlite::Connection {
        rusqlite::Connection::open(&self.db_path).expect("failed to open connection")
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

pub fn id(value: &str) -> SubscriptionId {
    SubscriptionId::new(value).expect("invalid id")
}

pub fn subscription(value: &str, status: SubscriptionStatus, position: i64) -> Subscription {
    Subscription::new(
        id(value),
        status,
        Position::new(position).expect("invalid position"),
    )
}
