//! Subscription domain model.
//!
//! A subscription is one consumer of an ordered event stream. The store
//! persists its id, catch-up position, lifecycle status and the last error
//! it ran into.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use time::OffsetDateTime;

/// Maximum length of a subscription id, in characters.
pub const MAX_ID_LENGTH: usize = 150;

/// Maximum length of a persisted status token.
pub const MAX_STATUS_LENGTH: usize = 32;

/// Rejected subscription identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidSubscriptionId {
    #[error("subscription id must not be empty")]
    Empty,

    #[error("subscription id is {length} characters long (max {MAX_ID_LENGTH})")]
    TooLong { length: usize },
}

/// Opaque, bounded subscription identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubscriptionId(String);

impl SubscriptionId {
    /// Create an id, validating its length.
    pub fn new(value: impl Into<String>) -> Result<Self, InvalidSubscriptionId> {
        let value = value.into();
        if value.is_empty() {
            return Err(InvalidSubscriptionId::Empty);
        }
        let length = value.chars().count();
        if length > MAX_ID_LENGTH {
            return Err(InvalidSubscriptionId::TooLong { length });
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SubscriptionId {
    type Error = InvalidSubscriptionId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SubscriptionId> for String {
    fn from(id: SubscriptionId) -> Self {
        id.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Negative positions are never valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("position must not be negative, got {0}")]
pub struct InvalidPosition(pub i64);

/// Catch-up position of a subscriber within its stream.
///
/// Monotonic advancement is the engine's responsibility; the store persists
/// whatever value it is handed.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "i64", into = "i64")]
pub struct Position(i64);

impl Position {
    pub const NONE: Self = Self(0);

    pub fn new(value: i64) -> Result<Self, InvalidPosition> {
        if value < 0 {
            return Err(InvalidPosition(value));
        }
        Ok(Self(value))
    }

    pub fn value(self) -> i64 {
        self.0
    }
}

impl TryFrom<i64> for Position {
    type Error = InvalidPosition;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Position> for i64 {
    fn from(position: Position) -> Self {
        position.0
    }
}

/// Status token that is not part of [`SubscriptionStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown subscription status: {0:?}")]
pub struct UnknownStatus(pub String);

/// Lifecycle status of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubscriptionStatus {
    New,
    Booting,
    Active,
    Paused,
    Detached,
    Error,
}

impl SubscriptionStatus {
    pub const ALL: [Self; 6] = [
        Self::New,
        Self::Booting,
        Self::Active,
        Self::Paused,
        Self::Detached,
        Self::Error,
    ];

    /// Persisted token for this status.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Booting => "BOOTING",
            Self::Active => "ACTIVE",
            Self::Paused => "PAUSED",
            Self::Detached => "DETACHED",
            Self::Error => "ERROR",
        }
    }
}

impl FromStr for SubscriptionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure details recorded alongside a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionError {
    /// Human-readable error message.
    pub message: String,
    /// Status the subscription held when the failure happened.
    pub previous_status: SubscriptionStatus,
    /// Diagnostic trace.
    pub trace: String,
}

impl SubscriptionError {
    pub fn new(
        message: impl Into<String>,
        previous_status: SubscriptionStatus,
        trace: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            previous_status,
            trace: trace.into(),
        }
    }
}

/// A tracked consumer of an ordered event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub status: SubscriptionStatus,
    pub position: Position,
    pub error: Option<SubscriptionError>,
    /// Time of the last persisted write. Assigned by the store, `None` until
    /// the subscription has been saved once.
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_saved_at: Option<OffsetDateTime>,
}

impl Subscription {
    /// A fresh, never-persisted subscription.
    pub fn new(id: SubscriptionId, status: SubscriptionStatus, position: Position) -> Self {
        Self {
            id,
            status,
            position,
            error: None,
            last_saved_at: None,
        }
    }

    #[must_use]
    pub fn with_position(mut self, position: Position) -> Self {
        self.position = position;
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: SubscriptionStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: Option<SubscriptionError>) -> Self {
        self.error = error;
        self
    }
}
