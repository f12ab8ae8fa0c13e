//! Selection criteria for subscription reads.
//!
//! Criteria are translated into a native `WHERE` clause with numbered
//! placeholders. An absent id filter and an empty status set both mean
//! "no restriction", so default criteria select the whole table.

use std::collections::BTreeSet;
use thiserror::Error;

use super::backend::{Dialect, SqlValue};
use super::schema::{COLUMN_ID, COLUMN_STATUS};
use crate::subscription::{SubscriptionId, SubscriptionStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CriteriaError {
    /// `id IN ()` is not valid SQL and would match nothing anyway.
    #[error("id filter must name at least one subscription; omit it to select every id")]
    EmptyIds,
}

/// Which subscriptions a read should return.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionCriteria {
    ids: Option<BTreeSet<SubscriptionId>>,
    statuses: BTreeSet<SubscriptionStatus>,
}

impl SubscriptionCriteria {
    /// Every subscription.
    pub fn all() -> Self {
        Self::default()
    }

    /// Only the given ids. Duplicates are collapsed.
    pub fn by_ids(ids: impl IntoIterator<Item = SubscriptionId>) -> Result<Self, CriteriaError> {
        Self::all().with_ids(ids)
    }

    pub fn by_statuses(statuses: impl IntoIterator<Item = SubscriptionStatus>) -> Self {
        Self::all().with_statuses(statuses)
    }

    /// Restrict to the given ids, replacing any earlier id filter.
    pub fn with_ids(
        mut self,
        ids: impl IntoIterator<Item = SubscriptionId>,
    ) -> Result<Self, CriteriaError> {
        let ids: BTreeSet<_> = ids.into_iter().collect();
        if ids.is_empty() {
            return Err(CriteriaError::EmptyIds);
        }
        self.ids = Some(ids);
        Ok(self)
    }

    /// Restrict to the given statuses. An empty set leaves statuses
    /// unrestricted.
    #[must_use]
    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = SubscriptionStatus>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    pub fn ids(&self) -> Option<&BTreeSet<SubscriptionId>> {
        self.ids.as_ref()
    }

    pub fn statuses(&self) -> &BTreeSet<SubscriptionStatus> {
        &self.statuses
    }

    /// Whether the criteria select the entire table.
    pub fn is_unrestricted(&self) -> bool {
        self.ids.is_none() && self.statuses.is_empty()
    }
}

/// `column IN (values...)`
#[derive(Debug, Clone, PartialEq)]
struct Condition {
    column: &'static str,
    values: Vec<SqlValue>,
}

/// Dialect-neutral filter built from [`SubscriptionCriteria`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Predicate {
    conditions: Vec<Condition>,
}

impl Predicate {
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Render as a `WHERE` clause whose placeholders start at `first_index`.
    ///
    /// Returns an empty string and no parameters when the predicate is empty.
    pub fn render(&self, dialect: Dialect, first_index: usize) -> (String, Vec<SqlValue>) {
        let mut params = Vec::new();
        let clauses: Vec<String> = self
            .conditions
            .iter()
            .map(|condition| {
                let placeholders: Vec<String> = condition
                    .values
                    .iter()
                    .map(|value| {
                        params.push(value.clone());
                        dialect.placeholder(first_index + params.len() - 1)
                    })
                    .collect();
                format!(
                    "{} IN ({})",
                    dialect.quote(condition.column),
                    placeholders.join(", ")
                )
            })
            .collect();

        if clauses.is_empty() {
            return (String::new(), params);
        }
        (format!("WHERE {}", clauses.join(" AND ")), params)
    }
}

/// Translate criteria into a predicate. Values come out sorted, so the same
/// criteria always produce the same statement.
pub fn build_predicate(criteria: &SubscriptionCriteria) -> Predicate {
    let mut conditions = Vec::new();
    if let Some(ids) = &criteria.ids {
        conditions.push(Condition {
            column: COLUMN_ID,
            values: ids.iter().map(|id| SqlValue::from(id.as_str())).collect(),
        });
    }
    if !criteria.statuses.is_empty() {
        conditions.push(Condition {
            column: COLUMN_STATUS,
            values: criteria
                .statuses
                .iter()
                .map(|status| SqlValue::from(status.as_str()))
                .collect(),
        });
    }
    Predicate { conditions }
}
