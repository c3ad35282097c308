//! Executes an ordered command plan against a [`WriteExecutor`].
//!
//! Foreign keys are copied from providers right before each holder is
//! written, so generated keys flow down the graph as it runs. On success
//! heap snapshots, identities and relation baselines are synced; on
//! failure the transaction is rolled back and every in-memory change made
//! by the run is reverted, leaving snapshots as they were before it.

use crate::changes;
use crate::graph::{Command, CommandGraph, CommandKind};
use crate::heap::{Heap, IdentityKey, RelationState, Status};
use crate::loader::identities;
use crate::mapper;
use crate::unit_of_work::{Journal, Planner};
use entitymap_core::{
    ConsistencyErrorKind, EntityRef, Error, Result, Value, WriteExecutor,
};
use entitymap_schema::{SchemaEntry, SchemaRegistry};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

/// Row counts of one successful run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushResult {
    pub inserted: usize,
    /// Updated rows, including deferred key patches.
    pub updated: usize,
    pub deleted: usize,
    /// Pivot rows inserted, through-entities included.
    pub linked: usize,
    /// Pivot rows deleted.
    pub unlinked: usize,
}

impl FlushResult {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted + self.linked + self.unlinked
    }
}

/// Columns written for an entity during the run.
struct Written {
    entity: EntityRef,
    role: String,
    columns: BTreeMap<String, Value>,
}

struct Executor<'a> {
    registry: &'a SchemaRegistry,
    heap: &'a Heap,
    writer: &'a dyn WriteExecutor,
    graph: &'a CommandGraph,
    journal: &'a mut Journal,
    links_by_holder: HashMap<usize, Vec<usize>>,
    written: HashMap<usize, Written>,
    deleted: Vec<EntityRef>,
    result: FlushResult,
}

/// Run `order` inside one transaction (when `transactional`).
pub(crate) fn execute(
    planner: Planner<'_>,
    order: &[usize],
    writer: &dyn WriteExecutor,
    transactional: bool,
) -> Result<FlushResult> {
    let Planner {
        loader,
        graph,
        mut journal,
        baselines,
        ..
    } = planner;
    let registry = loader.registry;
    let heap = loader.heap;

    tracing::info!(commands = order.len(), transactional, "Executing flush plan");
    let start = Instant::now();

    let mut links_by_holder: HashMap<usize, Vec<usize>> = HashMap::new();
    for (index, link) in graph.links().iter().enumerate() {
        links_by_holder
            .entry(link.holder.addr())
            .or_default()
            .push(index);
    }

    let mut executor = Executor {
        registry,
        heap: &*heap,
        writer,
        graph: &graph,
        journal: &mut journal,
        links_by_holder,
        written: HashMap::new(),
        deleted: Vec::new(),
        result: FlushResult::default(),
    };

    let outcome = (|| -> Result<()> {
        if transactional {
            writer.begin()?;
        }
        for &index in order {
            executor.step(index)?;
        }
        if transactional {
            writer.commit()?;
        }
        Ok(())
    })();

    let Executor {
        written,
        deleted,
        result,
        ..
    } = executor;

    if let Err(e) = outcome {
        tracing::warn!(error = %e, "Flush failed; rolling back");
        if transactional {
            if let Err(rollback) = writer.rollback() {
                tracing::warn!(error = %rollback, "Rollback failed");
            }
        }
        journal.revert(heap);
        return Err(e);
    }

    for w in written.into_values() {
        let entry = registry.entry(&w.role)?;
        if let Some(identity) = mapper::identity_from_columns(entry, &w.columns) {
            heap.set_identity(&w.entity, identity);
        }
        heap.sync(&w.entity, w.columns, Status::Managed);
    }
    for command in graph.commands() {
        if let (Some(entity), CommandKind::Insert | CommandKind::Update | CommandKind::Link) = (&command.entity, command.kind) {
            if heap.get(entity).is_some_and(|n| n.status() != Status::Managed) {
                heap.set_status(entity, Status::Managed);
            }
        }
    }
    for entity in &deleted {
        heap.detach(entity);
    }
    for (entity, name, members) in baselines {
        let ids = identities(registry, &members);
        heap.set_relation_state(&entity, &name, RelationState::Known(ids));
    }

    tracing::info!(
        inserted = result.inserted,
        updated = result.updated,
        deleted = result.deleted,
        linked = result.linked,
        unlinked = result.unlinked,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Flush complete"
    );
    Ok(result)
}

impl Executor<'_> {
    fn step(&mut self, index: usize) -> Result<()> {
        let graph = self.graph;
        let command = graph.command(index);
        match (command.kind, &command.entity) {
            (CommandKind::Insert, Some(entity)) => self.insert(command, entity),
            (CommandKind::Update, Some(entity)) => self.update(command, entity),
            (CommandKind::Update, None) => {
                let rows = self
                    .writer
                    .update(&command.table, &command.values, &command.identity)?;
                self.result.updated += rows as usize;
                Ok(())
            }
            (CommandKind::Delete, _) => self.delete(command),
            (CommandKind::Patch, Some(entity)) => self.patch(command, entity),
            (CommandKind::Link, Some(entity)) => self.insert(command, entity),
            (CommandKind::Link, None) => self.link(command),
            (CommandKind::Unlink, through) => {
                let rows = self.writer.delete(&command.table, &command.identity)?;
                tracing::trace!(table = %command.table, rows, "Unlinked pivot rows");
                self.result.unlinked += rows as usize;
                if let Some(through) = through {
                    self.deleted.push(through.clone());
                }
                Ok(())
            }
            (kind, None) => Err(Error::Custom(format!("{kind:?} command without an entity"))),
        }
    }

    /// Copy provider keys into `entity`. Returns the holder fields of links
    /// that were deferred to a patch.
    fn apply_links(&mut self, entity: &EntityRef) -> Result<Vec<String>> {
        let graph = self.graph;
        let mut deferred = Vec::new();
        let links = self
            .links_by_holder
            .get(&entity.addr())
            .cloned()
            .unwrap_or_default();
        for index in links {
            let link = &graph.links()[index];
            if link.deferred {
                deferred.extend(link.holder_fields.iter().cloned());
                continue;
            }
            let values = provider_key(link.provider_fields.as_slice(), &link.provider, &link.relation, &entity.role())?;
            for (field, value) in link.holder_fields.iter().zip(values) {
                self.journal.assign(entity, field, value);
            }
        }
        Ok(deferred)
    }

    fn insert(&mut self, command: &Command, entity: &EntityRef) -> Result<()> {
        let registry = self.registry;
        let deferred = self.apply_links(entity)?;
        let entry = registry.entry(&command.role)?;
        let mut values = mapper::to_columns(registry, entry, entity)?;
        for field in &deferred {
            if let Some(column) = entry.column_of(field) {
                values.insert(column.to_string(), Value::Null);
            }
        }

        let pk_columns = entry.pk_columns();
        let generated = entry.has_generated_key()
            && pk_columns
                .iter()
                .all(|c| values.get(c).is_none_or(Value::is_null));
        if generated {
            for column in &pk_columns {
                values.remove(column);
            }
        } else if pk_columns
            .iter()
            .any(|c| values.get(c).is_none_or(Value::is_null))
        {
            return Err(Error::consistency(
                ConsistencyErrorKind::MissingKey,
                &entry.role,
                None,
                format!("cannot insert {} without a primary key", entry.role),
            ));
        }

        tracing::trace!(table = %command.table, columns = values.len(), "Executing INSERT");
        let key = self.writer.insert(&command.table, &values)?;
        if generated {
            let Some(key) = key.filter(|k| !k.is_null()) else {
                return Err(Error::consistency(
                    ConsistencyErrorKind::MissingKey,
                    &entry.role,
                    None,
                    format!("storage returned no generated key for {}", command.table),
                ));
            };
            if let (Some(field), Some(column)) = (entry.primary_key.first(), pk_columns.first()) {
                let key = entry.cast_field(field, &key)?;
                self.journal.assign(entity, field, key.clone());
                values.insert(column.clone(), key);
            }
        }

        match command.kind {
            CommandKind::Link => self.result.linked += 1,
            _ => self.result.inserted += 1,
        }
        self.remember(entity, &command.role, values);
        Ok(())
    }

    fn update(&mut self, command: &Command, entity: &EntityRef) -> Result<()> {
        let registry = self.registry;
        let deferred = self.apply_links(entity)?;
        let entry = registry.entry(&command.role)?;
        let snapshot = self
            .heap
            .get(entity)
            .map(|node| node.snapshot().clone())
            .unwrap_or_default();
        let identity = self.stored_identity(entry, &snapshot)?;

        let mut current = mapper::to_columns(registry, entry, entity)?;
        for field in &deferred {
            if let Some(column) = entry.column_of(field) {
                let kept = snapshot.get(column).cloned().unwrap_or(Value::Null);
                current.insert(column.to_string(), kept);
            }
        }
        let changes = changes::diff(&current, &snapshot);
        if changes.is_empty() {
            tracing::trace!(role = %command.role, "No changes; skipping UPDATE");
            return Ok(());
        }

        tracing::trace!(table = %command.table, columns = ?changes.column_names(), "Executing UPDATE");
        let rows = self.writer.update(
            &command.table,
            changes.values(),
            &mapper::pk_filter(entry, &identity),
        )?;
        if rows == 0 {
            return Err(stale(entry, &identity));
        }
        self.result.updated += 1;
        self.remember(entity, &command.role, current);
        Ok(())
    }

    fn delete(&mut self, command: &Command) -> Result<()> {
        let filter = match &command.entity {
            Some(entity) => {
                let entry = self.registry.entry(&command.role)?;
                let snapshot = self
                    .heap
                    .get(entity)
                    .map(|node| node.snapshot().clone())
                    .unwrap_or_default();
                let identity = self.stored_identity(entry, &snapshot)?;
                mapper::pk_filter(entry, &identity)
            }
            None => command.identity.clone(),
        };
        tracing::trace!(table = %command.table, "Executing DELETE");
        let rows = self.writer.delete(&command.table, &filter)?;
        if rows == 0 {
            tracing::warn!(table = %command.table, "DELETE affected no rows");
        }
        self.result.deleted += rows as usize;
        if let Some(entity) = &command.entity {
            self.deleted.push(entity.clone());
        }
        Ok(())
    }

    /// Write a key that was deferred to break a cycle.
    fn patch(&mut self, command: &Command, holder: &EntityRef) -> Result<()> {
        let (registry, graph) = (self.registry, self.graph);
        let Some(link) = command.link.map(|l| &graph.links()[l]) else {
            return Err(Error::Custom("patch command without a link".into()));
        };
        let entry = registry.entry(&command.role)?;
        let values = provider_key(&link.provider_fields, &link.provider, &link.relation, &command.role)?;

        let mut base = match self.written.get(&holder.addr()) {
            Some(w) => w.columns.clone(),
            None => self
                .heap
                .get(holder)
                .map(|node| node.snapshot().clone())
                .unwrap_or_default(),
        };
        let identity = self.stored_identity(entry, &base)?;

        let mut set = BTreeMap::new();
        for (field, value) in link.holder_fields.iter().zip(values) {
            self.journal.assign(holder, field, value.clone());
            let column = entry.column_of(field).unwrap_or(field).to_string();
            let value = entry.cast_field(field, &value)?;
            set.insert(column.clone(), value.clone());
            base.insert(column, value);
        }

        tracing::trace!(table = %command.table, relation = %link.relation, "Executing deferred key UPDATE");
        let rows = self
            .writer
            .update(&command.table, &set, &mapper::pk_filter(entry, &identity))?;
        if rows == 0 {
            return Err(stale(entry, &identity));
        }
        self.result.updated += 1;
        self.remember(holder, &command.role, base);
        Ok(())
    }

    fn link(&mut self, command: &Command) -> Result<()> {
        let Some(pivot) = &command.pivot else {
            return Err(Error::Custom("link command without pivot".into()));
        };
        let source = provider_key(&pivot.source_fields, &pivot.source, &command.role, &command.role)?;
        let target = provider_key(&pivot.target_fields, &pivot.target, &command.role, &command.role)?;
        let row: BTreeMap<String, Value> = pivot
            .inner_columns
            .iter()
            .cloned()
            .zip(source)
            .chain(pivot.outer_columns.iter().cloned().zip(target))
            .collect();
        tracing::trace!(table = %command.table, "Inserting pivot row");
        self.writer.insert(&command.table, &row)?;
        self.result.linked += 1;
        Ok(())
    }

    fn stored_identity(&self, entry: &SchemaEntry, columns: &BTreeMap<String, Value>) -> Result<IdentityKey> {
        mapper::identity_from_columns(entry, columns).ok_or_else(|| {
            Error::consistency(
                ConsistencyErrorKind::MissingKey,
                &entry.role,
                None,
                format!("{} has no stored primary key", entry.role),
            )
        })
    }

    fn remember(&mut self, entity: &EntityRef, role: &str, columns: BTreeMap<String, Value>) {
        self.written.insert(
            entity.addr(),
            Written {
                entity: entity.clone(),
                role: role.to_string(),
                columns,
            },
        );
    }
}

/// Key values of a provider, which must be known by the time its holder runs.
fn provider_key(fields: &[String], provider: &EntityRef, relation: &str, holder_role: &str) -> Result<Vec<Value>> {
    fields
        .iter()
        .map(|f| Some(provider.get(f)).filter(|v| !v.is_null()))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| {
            Error::consistency(
                ConsistencyErrorKind::MissingKey,
                holder_role,
                Some(relation),
                format!("key of related {} is not known", provider.role()),
            )
        })
}

fn stale(entry: &SchemaEntry, identity: &IdentityKey) -> Error {
    Error::consistency(
        ConsistencyErrorKind::StaleEntity,
        &entry.role,
        None,
        format!("{identity} no longer exists in storage"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use entitymap_core::Entity;

    #[test]
    fn totals_add_up() {
        let result = FlushResult {
            inserted: 2,
            updated: 1,
            deleted: 1,
            linked: 3,
            unlinked: 0,
        };
        assert_eq!(result.total(), 7);
        assert_eq!(FlushResult::default().total(), 0);
    }

    #[test]
    fn provider_keys_must_be_complete() {
        let provider = EntityRef::new(Entity::new("user").with("id", 3_i64));
        let key = provider_key(&["id".to_string()], &provider, "post.author", "post").unwrap();
        assert_eq!(key, vec![Value::BigInt(3)]);

        let blank = EntityRef::new(Entity::new("user"));
        let err = provider_key(&["id".to_string()], &blank, "post.author", "post").unwrap_err();
        assert_eq!(err.consistency_kind(), Some(ConsistencyErrorKind::MissingKey));
    }
}
