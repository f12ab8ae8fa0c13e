//! substore: durable subscription registry for event-stream catch-up engines.
//!
//! Each subscription is one consumer of an ordered event stream. The store
//! records how far it has progressed, its lifecycle status and its last
//! error, and lets concurrent engine runs lock the subscriptions they work on.
//!
//! # Architecture
//!
//! - **Pessimistic locking**: `SELECT ... FOR UPDATE` on PostgreSQL, a
//!   database-wide write lock on SQLite
//! - **Self-provisioning**: the table is created or reconciled by
//!   introspect-and-diff, no migration tooling required
//! - **Deterministic time**: `last_saved_at` comes from an injected clock
//!
//! # Modules
//!
//! - [`config`]: CLI and environment configuration
//! - [`clock`]: Injected time source
//! - [`observability`]: Tracing setup
//! - [`storage`]: Backends, schema provisioning and the transactional store
//! - [`subscription`]: Domain model

// Lint configuration
#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions,    // storage::store::StoreError is fine
    clippy::must_use_candidate,         // Not all functions need #[must_use]
    clippy::missing_errors_doc,         // Error docs can be verbose
    clippy::missing_panics_doc,         // Panic docs can be verbose
    clippy::needless_raw_string_hashes, // r#""# is fine for SQL
    clippy::cast_possible_truncation,   // Row counts and lengths fit
    clippy::too_many_lines              // Some functions are inherently long
)]

pub mod clock;
pub mod config;
pub mod observability;
pub mod storage;
pub mod subscription;

pub use clock::{Clock, MockClock, SystemClock};
pub use storage::{
    open_store, LockingMode, SqlSubscriptionStore, StoreError, SubscriptionCriteria,
    SubscriptionStore,
};
pub use subscription::{Position, Subscription, SubscriptionError, SubscriptionId, SubscriptionStatus};
