//! Records and their identity.

use crate::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Field map carried by a record.
pub type Fields = Map<String, Value>;

/// Globally unique, caller-visible record identifier.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Wraps an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({})", self.0)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Position of a record in the canonical listing order.
///
/// Records are ordered by creation time; records created in the same
/// millisecond are ordered by id so that keyset pagination never skips or
/// repeats a row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SortKey {
    /// Creation time of the record.
    pub created_at: Timestamp,
    /// Identifier of the record.
    pub id: RecordId,
}

/// A document stored in one of the collections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Identifier, immutable once assigned.
    pub id: RecordId,
    /// Creation time, immutable once assigned.
    pub created_at: Timestamp,
    /// Collection-specific payload.
    #[serde(default)]
    pub fields: Fields,
}

impl Record {
    /// Creates a record with a fresh id stamped with the current time.
    #[must_use]
    pub fn new(fields: Fields) -> Self {
        Self {
            id: RecordId::generate(),
            created_at: Timestamp::now(),
            fields,
        }
    }

    /// Creates a record with explicit identity.
    #[must_use]
    pub fn with_identity(id: RecordId, created_at: Timestamp, fields: Fields) -> Self {
        Self {
            id,
            created_at,
            fields,
        }
    }

    /// Creates a record from a JSON object. Returns `None` for non-objects.
    #[must_use]
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self::new(fields)),
            _ => None,
        }
    }

    /// Returns this record's position in the listing order.
    #[must_use]
    pub fn sort_key(&self) -> SortKey {
        SortKey {
            created_at: self.created_at,
            id: self.id.clone(),
        }
    }

    /// Returns a field value.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Merges a patch into the payload.
    ///
    /// Top-level keys replace existing ones; a `null` value removes the key.
    /// Identity is never touched.
    pub fn apply_patch(&mut self, patch: &Fields) {
        for (key, value) in patch {
            if value.is_null() {
                self.fields.remove(key);
            } else {
                self.fields.insert(key.clone(), value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn patch_merges_and_removes() {
        let mut record = Record::new(fields(json!({"status": "open", "table": 3, "note": "x"})));
        let id = record.id.clone();

        record.apply_patch(&fields(json!({"status": "served", "note": null})));

        assert_eq!(record.id, id);
        assert_eq!(record.field("status"), Some(&json!("served")));
        assert_eq!(record.field("table"), Some(&json!(3)));
        assert_eq!(record.field("note"), None);
    }

    #[test]
    fn sort_key_breaks_ties_by_id() {
        let ts = Timestamp::from_millis(10);
        let a = Record::with_identity("a".into(), ts, Fields::new());
        let b = Record::with_identity("b".into(), ts, Fields::new());
        let earlier = Record::with_identity("z".into(), Timestamp::from_millis(5), Fields::new());

        assert!(a.sort_key() < b.sort_key());
        assert!(earlier.sort_key() < a.sort_key());
    }

    #[test]
    fn from_value_rejects_non_objects() {
        assert!(Record::from_value(json!([1, 2])).is_none());
        assert!(Record::from_value(json!({"name": "soup"})).is_some());
    }
}
