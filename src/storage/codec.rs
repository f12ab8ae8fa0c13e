//! Conversion between [`Subscription`] and its flat persisted row.
//!
//! The optional error triple only exists as three independent nullable
//! columns at this boundary; the all-or-nothing rule is enforced here and
//! nowhere else.

use thiserror::Error;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

use super::backend::SqlValue;
use super::schema::{
    COLUMN_ERROR_MESSAGE, COLUMN_ERROR_PREVIOUS_STATUS, COLUMN_ERROR_TRACE, COLUMN_ID,
    COLUMN_LAST_SAVED_AT, COLUMN_POSITION, COLUMN_STATUS,
};
use crate::subscription::{
    InvalidPosition, InvalidSubscriptionId, Position, Subscription, SubscriptionError,
    SubscriptionId, SubscriptionStatus, UnknownStatus,
};

/// Persisted format of `last_saved_at`.
pub const TIMESTAMP_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// `last_saved_at` did not match [`TIMESTAMP_FORMAT`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("last_saved_at {value:?} is not a valid date: {reason}")]
pub struct TimestampParseError {
    pub value: String,
    pub reason: String,
}

/// A stored row that does not describe a valid subscription.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedRowError {
    #[error("row has {0} columns, expected 7")]
    ColumnCount(usize),

    #[error("column {column} holds a {found} value, expected {expected}")]
    UnexpectedType {
        column: &'static str,
        expected: &'static str,
        found: &'static str,
    },

    #[error("invalid id: {0}")]
    InvalidId(#[from] InvalidSubscriptionId),

    #[error("invalid position: {0}")]
    InvalidPosition(#[from] InvalidPosition),

    #[error("column {column}: {source}")]
    UnknownStatus {
        column: &'static str,
        #[source]
        source: UnknownStatus,
    },

    #[error("error columns must be all set or all null, only {present:?} set")]
    PartialError { present: Vec<&'static str> },

    #[error(transparent)]
    Timestamp(#[from] TimestampParseError),
}

/// Flat row representation, one cell per column.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub id: SqlValue,
    pub position: SqlValue,
    pub status: SqlValue,
    pub error_message: SqlValue,
    pub error_previous_status: SqlValue,
    pub error_trace: SqlValue,
    pub last_saved_at: SqlValue,
}

impl Row {
    /// Build a row from cells in [`COLUMNS`](super::schema::COLUMNS) order.
    pub fn from_cells(cells: Vec<SqlValue>) -> Result<Self, MalformedRowError> {
        let count = cells.len();
        let Ok(
            [id, position, status, error_message, error_previous_status, error_trace, last_saved_at],
        ) = <[SqlValue; 7]>::try_from(cells)
        else {
            return Err(MalformedRowError::ColumnCount(count));
        };
        Ok(Self {
            id,
            position,
            status,
            error_message,
            error_previous_status,
            error_trace,
            last_saved_at,
        })
    }

    /// Cells in [`COLUMNS`](super::schema::COLUMNS) order.
    pub fn into_cells(self) -> Vec<SqlValue> {
        vec![
            self.id,
            self.position,
            self.status,
            self.error_message,
            self.error_previous_status,
            self.error_trace,
            self.last_saved_at,
        ]
    }
}

/// Flatten a subscription. `id` and `last_saved_at` are left null for the
/// write path to fill in.
pub fn encode(subscription: &Subscription) -> Row {
    let error = subscription.error.as_ref();
    Row {
        id: SqlValue::Null,
        position: SqlValue::Integer(subscription.position.value()),
        status: SqlValue::from(subscription.status.as_str()),
        error_message: error.map(|e| e.message.clone()).into(),
        error_previous_status: error.map(|e| e.previous_status.as_str()).into(),
        error_trace: error.map(|e| e.trace.clone()).into(),
        last_saved_at: SqlValue::Null,
    }
}

/// Rebuild a subscription from a stored row, rejecting anything malformed.
pub fn decode(row: Row) -> Result<Subscription, MalformedRowError> {
    let id = SubscriptionId::new(text(COLUMN_ID, row.id)?)?;
    let position = Position::new(integer(COLUMN_POSITION, row.position)?)?;
    let status = parse_status(COLUMN_STATUS, &text(COLUMN_STATUS, row.status)?)?;

    let message = optional_text(COLUMN_ERROR_MESSAGE, row.error_message)?;
    let previous_status =
        optional_text(COLUMN_ERROR_PREVIOUS_STATUS, row.error_previous_status)?;
    let trace = optional_text(COLUMN_ERROR_TRACE, row.error_trace)?;
    let error = match (message, previous_status, trace) {
        (Some(message), Some(previous_status), Some(trace)) => Some(SubscriptionError {
            message,
            previous_status: parse_status(COLUMN_ERROR_PREVIOUS_STATUS, &previous_status)?,
            trace,
        }),
        (None, None, None) => None,
        (message, previous_status, trace) => {
            let present = [
                (COLUMN_ERROR_MESSAGE, message.is_some()),
                (COLUMN_ERROR_PREVIOUS_STATUS, previous_status.is_some()),
                (COLUMN_ERROR_TRACE, trace.is_some()),
            ]
            .into_iter()
            .filter_map(|(column, set)| set.then_some(column))
            .collect();
            return Err(MalformedRowError::PartialError { present });
        }
    };

    let last_saved_at = parse_timestamp(&text(COLUMN_LAST_SAVED_AT, row.last_saved_at)?)?;

    Ok(Subscription {
        id,
        status,
        position,
        error,
        last_saved_at: Some(last_saved_at),
    })
}

/// Render a timestamp in UTC at second precision.
pub fn format_timestamp(at: OffsetDateTime) -> String {
    at.to_offset(UtcOffset::UTC)
        .format(TIMESTAMP_FORMAT)
        .expect("OffsetDateTime carries every component of TIMESTAMP_FORMAT")
}

/// Parse a stored timestamp, interpreted as UTC.
pub fn parse_timestamp(value: &str) -> Result<OffsetDateTime, TimestampParseError> {
    PrimitiveDateTime::parse(value, TIMESTAMP_FORMAT)
        .map(PrimitiveDateTime::assume_utc)
        .map_err(|err| TimestampParseError {
            value: value.to_string(),
            reason: err.to_string(),
        })
}

fn text(column: &'static str, value: SqlValue) -> Result<String, MalformedRowError> {
    match value {
        SqlValue::Text(text) => Ok(text),
        other => Err(unexpected(column, "text", &other)),
    }
}

fn optional_text(column: &'static str, value: SqlValue) -> Result<Option<String>, MalformedRowError> {
    match value {
        SqlValue::Null => Ok(None),
        SqlValue::Text(text) => Ok(Some(text)),
        other => Err(unexpected(column, "text or null", &other)),
    }
}

fn integer(column: &'static str, value: SqlValue) -> Result<i64, MalformedRowError> {
    match value {
        SqlValue::Integer(value) => Ok(value),
        other => Err(unexpected(column, "integer", &other)),
    }
}

fn parse_status(column: &'static str, token: &str) -> Result<SubscriptionStatus, MalformedRowError> {
    token
        .parse()
        .map_err(|source| MalformedRowError::UnknownStatus { column, source })
}

fn unexpected(column: &'static str, expected: &'static str, found: &SqlValue) -> MalformedRowError {
    MalformedRowError::UnexpectedType {
        column,
        expected,
        found: found.type_name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn stored(subscription: &Subscription, at: &str) -> Row {
        let mut row = encode(subscription);
        row.id = SqlValue::from(subscription.id.as_str());
        row.last_saved_at = SqlValue::from(at);
        row
    }

    fn failed_subscription() -> Subscription {
        Subscription::new(
            SubscriptionId::new("projection-orders").unwrap(),
            SubscriptionStatus::Error,
            Position::new(1337).unwrap(),
        )
        .with_error(Some(SubscriptionError::new(
            "boom",
            SubscriptionStatus::Active,
            "#0 handler.rs(12)",
        )))
    }

    #[test]
    fn test_encode_leaves_id_and_timestamp_to_caller() {
        let row = encode(&failed_subscription());
        assert_eq!(row.id, SqlValue::Null);
        assert_eq!(row.last_saved_at, SqlValue::Null);
        assert_eq!(row.position, SqlValue::Integer(1337));
        assert_eq!(row.status, SqlValue::from("ERROR"));
        assert_eq!(row.error_previous_status, SqlValue::from("ACTIVE"));
    }

    #[test]
    fn test_round_trip() {
        let at = datetime!(2025-01-06 14:32:08 UTC);
        for subscription in [
            failed_subscription(),
            Subscription::new(
                SubscriptionId::new("sub-a").unwrap(),
                SubscriptionStatus::New,
                Position::NONE,
            ),
        ] {
            let mut expected = subscription.clone();
            expected.last_saved_at = Some(at);
            let decoded = decode(stored(&subscription, "2025-01-06 14:32:08")).unwrap();
            assert_eq!(decoded, expected);
        }
    }

    #[test]
    fn test_partial_error_rejected() {
        let subscription = failed_subscription();
        let mut row = stored(&subscription, "2025-01-06 14:32:08");
        row.error_trace = SqlValue::Null;
        assert_eq!(
            decode(row),
            Err(MalformedRowError::PartialError {
                present: vec![COLUMN_ERROR_MESSAGE, COLUMN_ERROR_PREVIOUS_STATUS]
            })
        );

        let mut row = stored(&subscription, "2025-01-06 14:32:08");
        row.error_message = SqlValue::Null;
        row.error_previous_status = SqlValue::Null;
        assert_eq!(
            decode(row),
            Err(MalformedRowError::PartialError {
                present: vec![COLUMN_ERROR_TRACE]
            })
        );
    }

    #[test]
    fn test_wrong_types_rejected() {
        let subscription = failed_subscription();

        let mut row = stored(&subscription, "2025-01-06 14:32:08");
        row.position = SqlValue::Real(1.5);
        assert!(matches!(
            decode(row),
            Err(MalformedRowError::UnexpectedType {
                column: COLUMN_POSITION,
                found: "real",
                ..
            })
        ));

        let mut row = stored(&subscription, "2025-01-06 14:32:08");
        row.position = SqlValue::from("12");
        assert!(matches!(
            decode(row),
            Err(MalformedRowError::UnexpectedType { column: COLUMN_POSITION, .. })
        ));

        let mut row = stored(&subscription, "2025-01-06 14:32:08");
        row.id = SqlValue::Integer(5);
        assert!(matches!(
            decode(row),
            Err(MalformedRowError::UnexpectedType { column: COLUMN_ID, .. })
        ));
    }

    #[test]
    fn test_unknown_status_rejected() {
        let mut row = stored(&failed_subscription(), "2025-01-06 14:32:08");
        row.status = SqlValue::from("RUNNING");
        assert!(matches!(
            decode(row),
            Err(MalformedRowError::UnknownStatus { column: COLUMN_STATUS, .. })
        ));

        let mut row = stored(&failed_subscription(), "2025-01-06 14:32:08");
        row.error_previous_status = SqlValue::from("nope");
        assert!(matches!(
            decode(row),
            Err(MalformedRowError::UnknownStatus {
                column: COLUMN_ERROR_PREVIOUS_STATUS,
                ..
            })
        ));
    }

    #[test]
    fn test_negative_position_rejected() {
        let mut row = stored(&failed_subscription(), "2025-01-06 14:32:08");
        row.position = SqlValue::Integer(-3);
        assert_eq!(
            decode(row),
            Err(MalformedRowError::InvalidPosition(InvalidPosition(-3)))
        );
    }

    #[test]
    fn test_bad_timestamp_rejected() {
        let row = stored(&failed_subscription(), "2025-01-06T14:32:08Z");
        assert!(matches!(decode(row), Err(MalformedRowError::Timestamp(_))));
    }

    #[test]
    fn test_row_cell_count() {
        assert_eq!(
            Row::from_cells(vec![SqlValue::Null; 3]),
            Err(MalformedRowError::ColumnCount(3))
        );
        let cells = stored(&failed_subscription(), "2025-01-06 14:32:08").into_cells();
        assert_eq!(Row::from_cells(cells.clone()).unwrap().into_cells(), cells);
    }

    #[test]
    fn test_timestamp_formatting_is_utc_seconds() {
        let at = datetime!(2025-01-06 16:32:08.750 +02:00);
        assert_eq!(format_timestamp(at), "2025-01-06 14:32:08");
        assert_eq!(
            parse_timestamp("2025-01-06 14:32:08").unwrap(),
            datetime!(2025-01-06 14:32:08 UTC)
        );
    }
}
