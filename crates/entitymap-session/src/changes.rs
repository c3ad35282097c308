//! Column-level change detection.
//!
//! Current column values (fields already cast and renamed by the mapper)
//! are compared to the heap snapshot with value equality. JSON documents
//! compare structurally, so mutating a nested value object shows up as a
//! change of exactly that column.

use entitymap_core::Value;
use std::collections::BTreeMap;

/// Columns whose value differs from the snapshot, with their new values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    columns: BTreeMap<String, Value>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn contains(&self, column: &str) -> bool {
        self.columns.contains_key(column)
    }

    /// Changed column names, sorted.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.keys().map(String::as_str).collect()
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.columns
    }

    pub fn into_values(self) -> BTreeMap<String, Value> {
        self.columns
    }

    pub(crate) fn insert(&mut self, column: String, value: Value) {
        self.columns.insert(column, value);
    }
}

/// Value equality used for diffing: exact match, or equal after key-form
/// normalization (so integer widths do not produce spurious updates).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    a == b || a.key_form() == b.key_form()
}

/// Diff current column values against a snapshot.
///
/// A column missing from the snapshot counts as changed unless the current
/// value is null.
#[tracing::instrument(level = "trace", skip_all)]
pub fn diff(current: &BTreeMap<String, Value>, snapshot: &BTreeMap<String, Value>) -> ChangeSet {
    let mut changes = ChangeSet::default();
    for (column, value) in current {
        let unchanged = match snapshot.get(column) {
            Some(old) => values_equal(old, value),
            None => value.is_null(),
        };
        if !unchanged {
            changes.insert(column.clone(), value.clone());
        }
    }
    tracing::trace!(
        changed_count = changes.len(),
        columns = ?changes.column_names(),
        "Computed change set"
    );
    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn unchanged_row_produces_empty_set() {
        let snap = cols(&[("id", Value::BigInt(1)), ("name", Value::Text("a".into()))]);
        let current = cols(&[("id", Value::Int(1)), ("name", Value::Text("a".into()))]);
        assert!(diff(&current, &snap).is_empty());
    }

    #[test]
    fn nested_json_mutation_is_one_column() {
        let snap = cols(&[
            ("id", Value::BigInt(1)),
            (
                "address",
                Value::Json(serde_json::json!({"city": "Oslo", "zip": "0150"})),
            ),
        ]);
        let current = cols(&[
            ("id", Value::BigInt(1)),
            (
                "address",
                Value::Json(serde_json::json!({"city": "Bergen", "zip": "0150"})),
            ),
        ]);
        let changes = diff(&current, &snap);
        assert_eq!(changes.len(), 1);
        assert!(changes.contains("address"));
        assert_eq!(changes.column_names(), vec!["address"]);
    }

    #[test]
    fn missing_snapshot_columns() {
        let snap = cols(&[("id", Value::BigInt(1))]);
        let current = cols(&[
            ("id", Value::BigInt(1)),
            ("bio", Value::Null),
            ("age", Value::BigInt(3)),
        ]);
        let changes = diff(&current, &snap);
        assert_eq!(changes.column_names(), vec!["age"]);
        assert_eq!(changes.into_values().get("age"), Some(&Value::BigInt(3)));
    }
}
