//! Storage collaborator traits.
//!
//! The engine never produces query text. Reads are described by a
//! [`FetchQuery`] handed to a [`RowSource`]; writes are column maps handed
//! to a [`WriteExecutor`], which also owns the transaction boundary.

use crate::row::Row;
use crate::value::Value;
use crate::Result;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A table in a named database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableRef {
    pub database: String,
    pub table: String,
}

impl TableRef {
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

/// A filter term. All clauses of a query are combined with AND.
#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    /// `column = value`
    Eq(String, Value),
    /// `column IN (values)`; an empty list matches nothing.
    In(String, Vec<Value>),
    /// `column IS NULL`
    IsNull(String),
    /// OR of AND-groups; used for batched composite-key lookups.
    AnyOf(Vec<Vec<Clause>>),
}

impl Clause {
    /// Evaluate against a column lookup.
    ///
    /// Comparison uses key form so `Int(1)` matches `BigInt(1)`.
    pub fn matches<'a, F>(&self, lookup: &F) -> bool
    where
        F: Fn(&str) -> Option<&'a Value>,
    {
        let get = |c: &str| lookup(c).cloned().unwrap_or(Value::Null);
        match self {
            Clause::Eq(col, v) => {
                let current = get(col);
                !current.is_null() && current.key_form() == v.key_form()
            }
            Clause::In(col, values) => {
                let current = get(col).key_form();
                !current.is_null() && values.iter().any(|v| v.key_form() == current)
            }
            Clause::IsNull(col) => get(col).is_null(),
            Clause::AnyOf(groups) => groups
                .iter()
                .any(|group| group.iter().all(|c| c.matches(lookup))),
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// A read request.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchQuery {
    pub table: TableRef,
    /// Columns to return; empty means all.
    pub columns: Vec<String>,
    pub filters: Vec<Clause>,
    pub order_by: Vec<(String, Order)>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl FetchQuery {
    pub fn new(table: TableRef) -> Self {
        Self {
            table,
            columns: Vec::new(),
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    #[must_use]
    pub fn columns(mut self, columns: Vec<String>) -> Self {
        self.columns = columns;
        self
    }

    #[must_use]
    pub fn filter(mut self, clause: Clause) -> Self {
        self.filters.push(clause);
        self
    }
}

/// Executes reads.
pub trait RowSource {
    /// Run `query` and return matching rows in storage order.
    fn fetch(&self, query: &FetchQuery) -> Result<Vec<Row>>;
}

/// Executes writes inside a transaction it owns.
///
/// Zero affected rows is a normal `Ok(0)`; failures are errors.
pub trait WriteExecutor {
    fn begin(&self) -> Result<()>;
    fn commit(&self) -> Result<()>;
    fn rollback(&self) -> Result<()>;

    /// Insert a row. Returns the generated key when storage produced one.
    fn insert(&self, table: &TableRef, values: &BTreeMap<String, Value>) -> Result<Option<Value>>;

    /// Update rows matching `identity`. Returns rows affected.
    fn update(
        &self,
        table: &TableRef,
        values: &BTreeMap<String, Value>,
        identity: &BTreeMap<String, Value>,
    ) -> Result<u64>;

    /// Delete rows matching `identity`. Returns rows affected.
    fn delete(&self, table: &TableRef, identity: &BTreeMap<String, Value>) -> Result<u64>;
}

impl<T: RowSource + ?Sized> RowSource for Arc<T> {
    fn fetch(&self, query: &FetchQuery) -> Result<Vec<Row>> {
        (**self).fetch(query)
    }
}

impl<T: WriteExecutor + ?Sized> WriteExecutor for Arc<T> {
    fn begin(&self) -> Result<()> {
        (**self).begin()
    }

    fn commit(&self) -> Result<()> {
        (**self).commit()
    }

    fn rollback(&self) -> Result<()> {
        (**self).rollback()
    }

    fn insert(&self, table: &TableRef, values: &BTreeMap<String, Value>) -> Result<Option<Value>> {
        (**self).insert(table, values)
    }

    fn update(
        &self,
        table: &TableRef,
        values: &BTreeMap<String, Value>,
        identity: &BTreeMap<String, Value>,
    ) -> Result<u64> {
        (**self).update(table, values, identity)
    }

    fn delete(&self, table: &TableRef, identity: &BTreeMap<String, Value>) -> Result<u64> {
        (**self).delete(table, identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> BTreeMap<String, Value> {
        BTreeMap::from([
            ("id".to_string(), Value::Int(3)),
            ("parent_id".to_string(), Value::Null),
            ("kind".to_string(), Value::Text("a".into())),
        ])
    }

    #[test]
    fn clause_matching() {
        let r = row();
        let lookup = |c: &str| r.get(c);
        assert!(Clause::Eq("id".into(), Value::BigInt(3)).matches(&lookup));
        assert!(!Clause::Eq("parent_id".into(), Value::Null).matches(&lookup));
        assert!(Clause::IsNull("parent_id".into()).matches(&lookup));
        assert!(!Clause::In("id".into(), vec![]).matches(&lookup));
        assert!(Clause::In("id".into(), vec![Value::Int(1), Value::Int(3)]).matches(&lookup));
        let any = Clause::AnyOf(vec![
            vec![Clause::Eq("kind".into(), Value::Text("b".into()))],
            vec![
                Clause::Eq("kind".into(), Value::Text("a".into())),
                Clause::Eq("id".into(), Value::Int(3)),
            ],
        ]);
        assert!(any.matches(&lookup));
    }

    #[test]
    fn table_display() {
        assert_eq!(TableRef::new("default", "users").to_string(), "default.users");
    }
}
