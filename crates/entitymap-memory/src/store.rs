//! Row vectors behind a mutex, with snapshot transactions.

use entitymap_core::{
    Clause, Error, FetchError, FetchQuery, Order, Result, Row, RowSource, TableRef, Value,
    WriteErrorKind, WriteExecutor,
};
use entitymap_schema::{RelationKind, SchemaRegistry};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Kind of a logged statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatementKind {
    Fetch,
    Insert,
    Update,
    Delete,
    Begin,
    Commit,
    Rollback,
}

impl StatementKind {
    pub fn is_write(self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete)
    }
}

/// One entry of the statement log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statement {
    pub kind: StatementKind,
    /// `database.table`, empty for transaction statements.
    pub table: String,
    /// Columns written (insert/update) or filtered on (fetch/delete).
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct Table {
    primary_key: Vec<String>,
    auto_increment: bool,
    last_id: i64,
    rows: Vec<BTreeMap<String, Value>>,
}

impl Table {
    fn key_of(&self, row: &BTreeMap<String, Value>) -> Option<Vec<Value>> {
        self.primary_key
            .iter()
            .map(|c| row.get(c).filter(|v| !v.is_null()).map(Value::key_form))
            .collect()
    }
}

#[derive(Debug, Default)]
struct Inner {
    tables: BTreeMap<TableRef, Table>,
    saved: Option<BTreeMap<TableRef, Table>>,
    log: Vec<Statement>,
}

/// In-memory storage backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store with one table per root role and one per pivot table.
    pub fn from_registry(registry: &SchemaRegistry) -> Self {
        let store = Self::new();
        for role in registry.roles() {
            let Ok(entry) = registry.entry(role) else {
                continue;
            };
            if entry.embeddable {
                continue;
            }
            if entry.parent.is_none() {
                store.define_table(entry.table_ref(), entry.pk_columns(), entry.has_generated_key());
            }
            for def in entry.relations.values() {
                if def.kind != RelationKind::ManyToMany {
                    continue;
                }
                let Some(through) = &def.through else {
                    continue;
                };
                if through.role.is_some() {
                    continue;
                }
                let table = TableRef::new(
                    through
                        .database
                        .clone()
                        .unwrap_or_else(|| entry.database.clone()),
                    through.table.clone().unwrap_or_default(),
                );
                let key = through
                    .inner_key
                    .iter()
                    .chain(&through.outer_key)
                    .cloned()
                    .collect();
                store.define_table(table, key, false);
            }
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create (or keep) a table.
    pub fn define_table(&self, table: TableRef, primary_key: Vec<String>, auto_increment: bool) {
        tracing::trace!(table = %table, ?primary_key, auto_increment, "Defining table");
        self.lock().tables.entry(table).or_insert_with(|| Table {
            primary_key,
            auto_increment,
            ..Table::default()
        });
    }

    /// Insert a row without logging, for fixtures.
    pub fn seed(&self, table: &TableRef, values: BTreeMap<String, Value>) -> Result<Option<Value>> {
        let mut inner = self.lock();
        insert_row(&mut inner, table, values)
    }

    /// Current rows of a table, in insertion order.
    pub fn rows(&self, table: &TableRef) -> Vec<BTreeMap<String, Value>> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn statements(&self) -> Vec<Statement> {
        self.lock().log.clone()
    }

    /// Logged statements of one kind.
    pub fn count(&self, kind: StatementKind) -> usize {
        self.lock().log.iter().filter(|s| s.kind == kind).count()
    }

    pub fn reads(&self) -> usize {
        self.count(StatementKind::Fetch)
    }

    pub fn writes(&self) -> usize {
        self.lock().log.iter().filter(|s| s.kind.is_write()).count()
    }

    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    pub fn in_transaction(&self) -> bool {
        self.lock().saved.is_some()
    }
}

fn log(inner: &mut Inner, kind: StatementKind, table: Option<&TableRef>, columns: Vec<String>) {
    inner.log.push(Statement {
        kind,
        table: table.map(ToString::to_string).unwrap_or_default(),
        columns,
    });
}

fn missing_table(table: &TableRef) -> Error {
    Error::write(WriteErrorKind::Failed, &table.to_string(), "no such table")
}

fn insert_row(inner: &mut Inner, table: &TableRef, mut values: BTreeMap<String, Value>) -> Result<Option<Value>> {
    let name = table.to_string();
    let t = inner.tables.get_mut(table).ok_or_else(|| missing_table(table))?;

    let mut generated = None;
    if let [pk] = t.primary_key.as_slice() {
        let given = values.get(pk).filter(|v| !v.is_null()).cloned();
        match given {
            None if t.auto_increment => {
                t.last_id += 1;
                let id = Value::BigInt(t.last_id);
                values.insert(pk.clone(), id.clone());
                generated = Some(id);
            }
            Some(v) if t.auto_increment => {
                if let Some(n) = v.as_i64() {
                    t.last_id = t.last_id.max(n);
                }
            }
            _ => {}
        }
    }

    let Some(key) = t.key_of(&values) else {
        return Err(Error::write(WriteErrorKind::Failed, &name, "primary key column is null"));
    };
    if t.rows.iter().any(|r| t.key_of(r).as_ref() == Some(&key)) {
        return Err(Error::write(
            WriteErrorKind::Conflict,
            &name,
            format!("duplicate primary key {key:?}"),
        ));
    }
    t.rows.push(values);
    Ok(generated)
}

fn identity_matches(row: &BTreeMap<String, Value>, identity: &BTreeMap<String, Value>) -> bool {
    identity.iter().all(|(column, value)| {
        let clause = if value.is_null() {
            Clause::IsNull(column.clone())
        } else {
            Clause::Eq(column.clone(), value.clone())
        };
        clause.matches(&|c: &str| row.get(c))
    })
}

/// Storage ordering: nulls first, numbers numerically, text lexically.
fn compare(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
    }
    if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
        return x.cmp(y);
    }
    a.to_string().cmp(&b.to_string())
}

impl RowSource for MemoryStore {
    fn fetch(&self, query: &FetchQuery) -> Result<Vec<Row>> {
        let mut inner = self.lock();
        let filtered: Vec<String> = query
            .filters
            .iter()
            .filter_map(|c| match c {
                Clause::Eq(col, _) | Clause::In(col, _) | Clause::IsNull(col) => Some(col.clone()),
                Clause::AnyOf(_) => None,
            })
            .collect();
        log(&mut inner, StatementKind::Fetch, Some(&query.table), filtered);

        let Some(table) = inner.tables.get(&query.table) else {
            return Err(Error::Fetch(FetchError {
                table: query.table.to_string(),
                message: "no such table".into(),
                source: None,
            }));
        };
        let mut rows: Vec<&BTreeMap<String, Value>> = table
            .rows
            .iter()
            .filter(|row| {
                query
                    .filters
                    .iter()
                    .all(|clause| clause.matches(&|c: &str| row.get(c)))
            })
            .collect();
        for (column, order) in query.order_by.iter().rev() {
            rows.sort_by(|a, b| {
                let ord = compare(
                    a.get(column).unwrap_or(&Value::Null),
                    b.get(column).unwrap_or(&Value::Null),
                );
                match order {
                    Order::Asc => ord,
                    Order::Desc => ord.reverse(),
                }
            });
        }

        let out: Vec<Row> = rows
            .into_iter()
            .skip(query.offset.unwrap_or(0))
            .take(query.limit.unwrap_or(usize::MAX))
            .map(|row| {
                if query.columns.is_empty() {
                    Row::from_pairs(row.iter().map(|(k, v)| (k.clone(), v.clone())))
                } else {
                    Row::from_pairs(query.columns.iter().map(|c| {
                        (c.clone(), row.get(c).cloned().unwrap_or(Value::Null))
                    }))
                }
            })
            .collect();
        tracing::trace!(table = %query.table, rows = out.len(), "Fetched");
        Ok(out)
    }
}

impl WriteExecutor for MemoryStore {
    fn begin(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.saved.is_some() {
            return Err(Error::write(
                WriteErrorKind::Transaction,
                "",
                "transaction already active",
            ));
        }
        inner.saved = Some(inner.tables.clone());
        log(&mut inner, StatementKind::Begin, None, Vec::new());
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.saved.take().is_none() {
            return Err(Error::write(WriteErrorKind::Transaction, "", "no active transaction"));
        }
        log(&mut inner, StatementKind::Commit, None, Vec::new());
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        let mut inner = self.lock();
        let Some(saved) = inner.saved.take() else {
            return Err(Error::write(WriteErrorKind::Transaction, "", "no active transaction"));
        };
        inner.tables = saved;
        log(&mut inner, StatementKind::Rollback, None, Vec::new());
        tracing::debug!("Rolled back");
        Ok(())
    }

    fn insert(&self, table: &TableRef, values: &BTreeMap<String, Value>) -> Result<Option<Value>> {
        let mut inner = self.lock();
        log(&mut inner, StatementKind::Insert, Some(table), values.keys().cloned().collect());
        insert_row(&mut inner, table, values.clone())
    }

    fn update(
        &self,
        table: &TableRef,
        values: &BTreeMap<String, Value>,
        identity: &BTreeMap<String, Value>,
    ) -> Result<u64> {
        let mut inner = self.lock();
        log(&mut inner, StatementKind::Update, Some(table), values.keys().cloned().collect());
        let t = inner.tables.get_mut(table).ok_or_else(|| missing_table(table))?;
        let mut affected = 0;
        for row in t.rows.iter_mut().filter(|r| identity_matches(r, identity)) {
            for (column, value) in values {
                row.insert(column.clone(), value.clone());
            }
            affected += 1;
        }
        Ok(affected)
    }

    fn delete(&self, table: &TableRef, identity: &BTreeMap<String, Value>) -> Result<u64> {
        let mut inner = self.lock();
        log(&mut inner, StatementKind::Delete, Some(table), identity.keys().cloned().collect());
        let t = inner.tables.get_mut(table).ok_or_else(|| missing_table(table))?;
        let before = t.rows.len();
        t.rows.retain(|r| !identity_matches(r, identity));
        Ok((before - t.rows.len()) as u64)
    }
}
