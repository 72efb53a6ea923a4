//! Query filters and ordering.

use crate::{Record, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Listing direction over [`crate::SortKey`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Oldest first.
    #[default]
    Ascending,
    /// Newest first.
    Descending,
}

/// A single predicate on a top-level field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    /// Field equals the value exactly.
    Eq {
        /// Field name.
        field: String,
        /// Expected value.
        value: Value,
    },
    /// Field lies within inclusive bounds. Numbers compare numerically,
    /// strings lexicographically; anything else never matches.
    Range {
        /// Field name.
        field: String,
        /// Lower bound, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<Value>,
        /// Upper bound, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<Value>,
    },
}

impl Condition {
    /// Evaluates the condition against a record.
    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Condition::Eq { field, value } => record.field(field) == Some(value),
            Condition::Range { field, min, max } => {
                let Some(actual) = record.field(field) else {
                    return false;
                };
                let above_min = match min {
                    Some(min) => matches!(
                        compare_values(actual, min),
                        Some(Ordering::Greater | Ordering::Equal)
                    ),
                    None => true,
                };
                let below_max = match max {
                    Some(max) => matches!(
                        compare_values(actual, max),
                        Some(Ordering::Less | Ordering::Equal)
                    ),
                    None => true,
                };
                above_min && below_max
            }
        }
    }

    fn is_exact_match(&self) -> bool {
        matches!(self, Condition::Eq { .. })
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// How much of a [`Filter`] a store can evaluate natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterSupport {
    /// No predicates; the store can only scan in key order.
    ScanOnly,
    /// Equality predicates only.
    ExactMatch,
    /// Equality, range and creation-window predicates.
    Full,
}

/// A conjunction of conditions plus an optional creation-time window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Field predicates, all of which must hold.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Inclusive lower bound on `created_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_after: Option<Timestamp>,
    /// Exclusive upper bound on `created_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_before: Option<Timestamp>,
}

impl Filter {
    /// Creates a filter that matches everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an equality condition.
    #[must_use]
    pub fn where_eq(mut self, field: impl Into<String>, value: Value) -> Self {
        self.conditions.push(Condition::Eq {
            field: field.into(),
            value,
        });
        self
    }

    /// Adds an inclusive range condition.
    #[must_use]
    pub fn where_range(mut self, field: impl Into<String>, min: Option<Value>, max: Option<Value>) -> Self {
        self.conditions.push(Condition::Range {
            field: field.into(),
            min,
            max,
        });
        self
    }

    /// Restricts the creation-time window to `[from, until)`.
    #[must_use]
    pub fn created_between(mut self, from: Option<Timestamp>, until: Option<Timestamp>) -> Self {
        self.created_after = from;
        self.created_before = until;
        self
    }

    /// Returns true if the filter has no predicates.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty() && self.created_after.is_none() && self.created_before.is_none()
    }

    /// Evaluates the filter against a record.
    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        if let Some(from) = self.created_after {
            if record.created_at < from {
                return false;
            }
        }
        if let Some(until) = self.created_before {
            if record.created_at >= until {
                return false;
            }
        }
        self.conditions.iter().all(|c| c.matches(record))
    }

    /// Minimum store capability needed to evaluate this filter natively.
    #[must_use]
    pub fn required_support(&self) -> FilterSupport {
        if self.is_empty() {
            FilterSupport::ScanOnly
        } else if self.created_after.is_none()
            && self.created_before.is_none()
            && self.conditions.iter().all(Condition::is_exact_match)
        {
            FilterSupport::ExactMatch
        } else {
            FilterSupport::Full
        }
    }

    /// Returns the part of this filter a store with `support` can evaluate.
    ///
    /// The result is always weaker than `self`: every record matching `self`
    /// also matches the pushed-down filter.
    #[must_use]
    pub fn pushdown(&self, support: FilterSupport) -> Filter {
        match support {
            FilterSupport::Full => self.clone(),
            FilterSupport::ExactMatch => Filter {
                conditions: self
                    .conditions
                    .iter()
                    .filter(|c| c.is_exact_match())
                    .cloned()
                    .collect(),
                created_after: None,
                created_before: None,
            },
            FilterSupport::ScanOnly => Filter::default(),
        }
    }
}
