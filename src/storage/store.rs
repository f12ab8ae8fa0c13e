//! Transactional subscription store.
//!
//! The engine drives a catch-up run as:
//!
//! 1. `begin_transaction()`
//! 2. `find_by_criteria_for_update()` to lock the subscriptions it will work on
//! 3. `update()` / `add()` as positions advance
//! 4. `commit()`
//!
//! On row-locking backends step 2 is where concurrent runs wait for each
//! other. On SQLite the wait happens at step 1 instead (see
//! [`LockingMode::DatabaseLevel`]).

use thiserror::Error;

use super::backend::{Backend, BackendError, LockingMode, SqlValue};
use super::codec::{self, format_timestamp, MalformedRowError, Row};
use super::criteria::{build_predicate, SubscriptionCriteria};
use super::schema::{self, SchemaError, TableName, COLUMNS, COLUMN_ID};
use crate::clock::Clock;
use crate::subscription::{Subscription, SubscriptionId};

/// Savepoint guarding inserts made inside an open transaction.
const ADD_SAVEPOINT: &str = "substore_add";

/// Error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to provision table {table} after {applied} statements: {source}")]
    SchemaProvisioning {
        table: String,
        /// Statements applied before the failure.
        applied: usize,
        #[source]
        source: SchemaError,
    },

    #[error("malformed subscription row: {0}")]
    MalformedRow(#[from] MalformedRowError),

    #[error("subscription {0} already exists")]
    DuplicateId(SubscriptionId),

    #[error("subscription {0} not found")]
    NotFound(SubscriptionId),

    #[error("invalid transaction state: {0}")]
    InvalidTransactionState(String),

    #[error("{operation} on table {table} failed: {source}")]
    Backend {
        operation: &'static str,
        table: String,
        #[source]
        source: BackendError,
    },
}

/// The persistence contract the catch-up engine works against.
pub trait SubscriptionStore {
    /// Create or reconcile the backing table. Returns the number of
    /// statements applied; zero when the table was already up to date.
    fn ensure_schema(&mut self) -> Result<usize, StoreError>;

    fn begin_transaction(&mut self) -> Result<(), StoreError>;

    fn commit(&mut self) -> Result<(), StoreError>;

    fn rollback(&mut self) -> Result<(), StoreError>;

    /// Read matching subscriptions in ascending id order, locking them until
    /// the surrounding transaction ends. Requires an open transaction.
    fn find_by_criteria_for_update(
        &mut self,
        criteria: &SubscriptionCriteria,
    ) -> Result<Vec<Subscription>, StoreError>;

    /// Insert a new subscription, stamping `last_saved_at`.
    fn add(&mut self, subscription: &Subscription) -> Result<(), StoreError>;

    /// Replace a stored subscription by id, stamping `last_saved_at`.
    fn update(&mut self, subscription: &Subscription) -> Result<(), StoreError>;

    fn locking_mode(&self) -> LockingMode;
}

/// [`SubscriptionStore`] over a relational [`Backend`].
///
/// Owns one dedicated connection; use one store per concurrent engine.
pub struct SqlSubscriptionStore<B: Backend, C: Clock> {
    backend: B,
    clock: C,
    table: TableName,
    in_transaction: bool,
}

impl<B: Backend, C: Clock> SqlSubscriptionStore<B, C> {
    pub fn new(backend: B, clock: C, table: TableName) -> Self {
        Self {
            backend,
            clock,
            table,
            in_transaction: false,
        }
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Statements [`ensure_schema`](SubscriptionStore::ensure_schema) would
    /// apply, without applying them.
    pub fn required_statements(&mut self) -> Result<Vec<String>, StoreError> {
        schema::required_statements(&mut self.backend, &self.table)
            .map_err(|source| self.backend_error("required_statements", source))
    }

    /// Same read as
    /// [`find_by_criteria_for_update`](SubscriptionStore::find_by_criteria_for_update)
    /// without taking locks. Usable outside a transaction.
    pub fn find_by_criteria(
        &mut self,
        criteria: &SubscriptionCriteria,
    ) -> Result<Vec<Subscription>, StoreError> {
        self.select(criteria, false, "find_by_criteria")
    }

    fn select(
        &mut self,
        criteria: &SubscriptionCriteria,
        for_update: bool,
        operation: &'static str,
    ) -> Result<Vec<Subscription>, StoreError> {
        let dialect = self.backend.dialect();
        let (filter, params) = build_predicate(criteria).render(dialect, 1);
        let mut sql = format!(
            "SELECT {} FROM {}",
            self.column_list(),
            dialect.quote(self.table.as_str())
        );
        if !filter.is_empty() {
            sql.push(' ');
            sql.push_str(&filter);
        }
        sql.push_str(&format!(" ORDER BY {} ASC", dialect.quote(COLUMN_ID)));
        if for_update && dialect.locking_mode() == LockingMode::RowLevel {
            sql.push_str(" FOR UPDATE");
        }

        let rows = self
            .backend
            .query(&sql, &params)
            .map_err(|source| self.backend_error(operation, source))?;
        let subscriptions = rows
            .into_iter()
            .map(|cells| Row::from_cells(cells).and_then(codec::decode))
            .collect::<Result<Vec<_>, _>>()?;
        tracing::debug!(
            table = %self.table,
            operation,
            rows = subscriptions.len(),
            "Selected subscriptions"
        );
        Ok(subscriptions)
    }

    fn insert(&mut self, subscription: &Subscription) -> Result<(), StoreError> {
        let dialect = self.backend.dialect();
        let mut row = codec::encode(subscription);
        row.id = SqlValue::from(subscription.id.as_str());
        row.last_saved_at = SqlValue::Text(format_timestamp(self.clock.now()));

        let placeholders: Vec<String> = (1..=COLUMNS.len())
            .map(|index| dialect.placeholder(index))
            .collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            dialect.quote(self.table.as_str()),
            self.column_list(),
            placeholders.join(", ")
        );
        match self.backend.execute(&sql, &row.into_cells()) {
            Ok(_) => Ok(()),
            Err(err) if err.is_unique_violation() => {
                Err(StoreError::DuplicateId(subscription.id.clone()))
            }
            Err(source) => Err(self.backend_error("add", source)),
        }
    }

    fn column_list(&self) -> String {
        let dialect = self.backend.dialect();
        COLUMNS
            .iter()
            .map(|column| dialect.quote(column))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn require_transaction(&self, operation: &str) -> Result<(), StoreError> {
        if self.in_transaction {
            Ok(())
        } else {
            Err(StoreError::InvalidTransactionState(format!(
                "{operation} requires an open transaction"
            )))
        }
    }

    fn backend_error(&self, operation: &'static str, source: BackendError) -> StoreError {
        StoreError::Backend {
            operation,
            table: self.table.to_string(),
            source,
        }
    }
}

impl<B: Backend, C: Clock> SubscriptionStore for SqlSubscriptionStore<B, C> {
    #[tracing::instrument(skip(self), fields(table = %self.table))]
    fn ensure_schema(&mut self) -> Result<usize, StoreError> {
        let applied = schema::ensure_schema(&mut self.backend, &self.table).map_err(|source| {
            let applied = match &source {
                SchemaError::Introspection(_) => 0,
                SchemaError::Statement { index, .. } => *index,
            };
            StoreError::SchemaProvisioning {
                table: self.table.to_string(),
                applied,
                source,
            }
        })?;
        if applied > 0 {
            tracing::info!(applied, "Schema provisioned");
        }
        Ok(applied)
    }

    fn begin_transaction(&mut self) -> Result<(), StoreError> {
        if self.in_transaction {
            return Err(StoreError::InvalidTransactionState(
                "a transaction is already open; nesting is not supported".into(),
            ));
        }
        let begin = self.backend.dialect().begin_statement();
        self.backend
            .execute_batch(begin)
            .map_err(|source| self.backend_error("begin_transaction", source))?;
        self.in_transaction = true;
        tracing::trace!(table = %self.table, "Transaction started");
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.require_transaction("commit")?;
        self.in_transaction = false;
        if let Err(source) = self.backend.execute_batch("COMMIT") {
            // SQLite keeps the transaction open after a failed COMMIT.
            if let Err(err) = self.backend.execute_batch("ROLLBACK") {
                tracing::debug!(error = %err, "Rollback after failed commit");
            }
            return Err(self.backend_error("commit", source));
        }
        tracing::trace!(table = %self.table, "Transaction committed");
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.require_transaction("rollback")?;
        self.in_transaction = false;
        self.backend
            .execute_batch("ROLLBACK")
            .map_err(|source| self.backend_error("rollback", source))?;
        tracing::trace!(table = %self.table, "Transaction rolled back");
        Ok(())
    }

    #[tracing::instrument(skip(self, criteria), fields(table = %self.table))]
    fn find_by_criteria_for_update(
        &mut self,
        criteria: &SubscriptionCriteria,
    ) -> Result<Vec<Subscription>, StoreError> {
        self.require_transaction("find_by_criteria_for_update")?;
        self.select(criteria, true, "find_by_criteria_for_update")
    }

    #[tracing::instrument(skip(self, subscription), fields(table = %self.table, id = %subscription.id))]
    fn add(&mut self, subscription: &Subscription) -> Result<(), StoreError> {
        if !self.in_transaction {
            return self.insert(subscription);
        }

        // A failed statement aborts the whole transaction on PostgreSQL; the
        // savepoint confines a duplicate insert to itself.
        self.backend
            .execute_batch(&format!("SAVEPOINT {ADD_SAVEPOINT}"))
            .map_err(|source| self.backend_error("add", source))?;
        let result = self.insert(subscription);
        let cleanup = if result.is_ok() {
            format!("RELEASE SAVEPOINT {ADD_SAVEPOINT}")
        } else {
            format!("ROLLBACK TO SAVEPOINT {ADD_SAVEPOINT}; RELEASE SAVEPOINT {ADD_SAVEPOINT}")
        };
        self.backend
            .execute_batch(&cleanup)
            .map_err(|source| self.backend_error("add", source))?;
        result
    }

    #[tracing::instrument(skip(self, subscription), fields(table = %self.table, id = %subscription.id))]
    fn update(&mut self, subscription: &Subscription) -> Result<(), StoreError> {
        let dialect = self.backend.dialect();
        let mut row = codec::encode(subscription);
        row.last_saved_at = SqlValue::Text(format_timestamp(self.clock.now()));

        // Every column but the id, followed by the id for the WHERE clause.
        let mut cells = row.into_cells();
        cells.remove(0);
        let assignments: Vec<String> = COLUMNS[1..]
            .iter()
            .enumerate()
            .map(|(offset, column)| {
                format!("{} = {}", dialect.quote(column), dialect.placeholder(offset + 1))
            })
            .collect();
        cells.push(SqlValue::from(subscription.id.as_str()));
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = {}",
            dialect.quote(self.table.as_str()),
            assignments.join(", "),
            dialect.quote(COLUMN_ID),
            dialect.placeholder(cells.len())
        );

        let affected = self
            .backend
            .execute(&sql, &cells)
            .map_err(|source| self.backend_error("update", source))?;
        if affected == 0 {
            return Err(StoreError::NotFound(subscription.id.clone()));
        }
        Ok(())
    }

    fn locking_mode(&self) -> LockingMode {
        self.backend.dialect().locking_mode()
    }
}

impl<B: Backend, C: Clock> Drop for SqlSubscriptionStore<B, C> {
    fn drop(&mut self) {
        if !self.in_transaction {
            return;
        }
        tracing::warn!(table = %self.table, "Store dropped with an open transaction, rolling back");
        if let Err(err) = self.backend.execute_batch("ROLLBACK") {
            tracing::warn!(table = %self.table, error = %err, "Rollback on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::storage::sqlite::{SqliteBackend, SqlitePool};
    use crate::subscription::{Position, SubscriptionStatus};
    use std::sync::Arc;
    use time::macros::datetime;

    fn store() -> (SqlSubscriptionStore<SqliteBackend, Arc<MockClock>>, Arc<MockClock>) {
        let clock = Arc::new(MockClock::new(datetime!(2025-01-06 14:32:08 UTC)));
        let backend = SqlitePool::memory().unwrap().backend().unwrap();
        let mut store = SqlSubscriptionStore::new(
            backend,
            Arc::clone(&clock),
            TableName::new("subscriptions").unwrap(),
        );
        store.ensure_schema().unwrap();
        (store, clock)
    }

    fn subscription(id: &str) -> Subscription {
        Subscription::new(
            SubscriptionId::new(id).unwrap(),
            SubscriptionStatus::New,
            Position::NONE,
        )
    }

    #[test]
    fn test_locked_read_requires_transaction() {
        let (mut store, _) = store();
        let err = store
            .find_by_criteria_for_update(&SubscriptionCriteria::all())
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransactionState(_)));
    }

    #[test]
    fn test_transaction_state_checks() {
        let (mut store, _) = store();
        assert!(matches!(
            store.commit(),
            Err(StoreError::InvalidTransactionState(_))
        ));
        assert!(matches!(
            store.rollback(),
            Err(StoreError::InvalidTransactionState(_))
        ));

        store.begin_transaction().unwrap();
        assert!(matches!(
            store.begin_transaction(),
            Err(StoreError::InvalidTransactionState(_))
        ));
        store.commit().unwrap();
        assert!(!store.in_transaction());
    }

    #[test]
    fn test_duplicate_inside_transaction_keeps_transaction_usable() {
        let (mut store, _) = store();
        store.begin_transaction().unwrap();
        store.add(&subscription("sub-a")).unwrap();
        assert!(matches!(
            store.add(&subscription("sub-a")),
            Err(StoreError::DuplicateId(_))
        ));
        store.add(&subscription("sub-b")).unwrap();
        store.commit().unwrap();

        let ids: Vec<String> = store
            .find_by_criteria(&SubscriptionCriteria::all())
            .unwrap()
            .into_iter()
            .map(|s| s.id.to_string())
            .collect();
        assert_eq!(ids, vec!["sub-a", "sub-b"]);
    }

    #[test]
    fn test_rollback_discards_writes() {
        let (mut store, _) = store();
        store.begin_transaction().unwrap();
        store.add(&subscription("sub-a")).unwrap();
        store.rollback().unwrap();

        assert!(store
            .find_by_criteria(&SubscriptionCriteria::all())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_update_stamps_clock_time() {
        let (mut store, clock) = store();
        let mut sub = subscription("sub-a");
        sub.last_saved_at = Some(datetime!(1999-01-01 00:00:00 UTC));
        store.add(&sub).unwrap();

        clock.advance(time::Duration::minutes(5));
        store.update(&sub.clone().with_position(Position::new(9).unwrap())).unwrap();

        let found = store.find_by_criteria(&SubscriptionCriteria::all()).unwrap();
        assert_eq!(found[0].position.value(), 9);
        assert_eq!(found[0].last_saved_at, Some(datetime!(2025-01-06 14:37:08 UTC)));
    }

    #[test]
    fn test_update_unknown_is_not_found() {
        let (mut store, _) = store();
        assert!(matches!(
            store.update(&subscription("ghost")),
            Err(StoreError::NotFound(id)) if id.as_str() == "ghost"
        ));
    }

    #[test]
    fn test_sqlite_reports_database_level_locking() {
        let (store, _) = store();
        assert_eq!(store.locking_mode(), LockingMode::DatabaseLevel);
    }
}
