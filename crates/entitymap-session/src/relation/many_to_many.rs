//! `many_to_many` through a pivot table or a through-entity role.
//!
//! Pivot rows hold the source's inner key and the target's outer key.
//! Persisting the source inserts pivot rows for added targets and deletes
//! them for removed ones; the targets themselves are persisted only when
//! the relation cascades.
//!
//! With a through-entity role every pivot row is an entity of that role,
//! attached to the source per member (see [`EntityRef::pivot`]). Its own
//! fields are written with the row and hydrated when the relation loads.

use super::{current_members, route, RelationRef};
use crate::graph::{Command, CommandKind, KeyLink, PivotLink};
use crate::heap::{IdentityKey, RelationState};
use crate::loader::{base_query, Loader};
use crate::mapper;
use crate::resolver;
use crate::unit_of_work::Planner;
use entitymap_core::{
    Cardinality, Entity, EntityRef, Error, FetchQuery, Reference, Related, Resolved, Result,
    SchemaErrorKind, TableRef, TypeError, Value,
};
use entitymap_schema::{SchemaEntry, SchemaRegistry, Through};
use std::collections::BTreeMap;

/// Pivot table and its inner/outer columns.
struct Pivot<'r> {
    table: TableRef,
    inner: Vec<String>,
    outer: Vec<String>,
    /// Through-entity role, when the pivot is backed by one.
    entry: Option<&'r SchemaEntry>,
}

impl Pivot<'_> {
    /// Through-entity fields behind pivot `columns`.
    fn fields(&self, columns: &[String]) -> Vec<String> {
        match self.entry {
            Some(entry) => columns
                .iter()
                .map(|c| entry.field_of(c).unwrap_or(c).to_string())
                .collect(),
            None => columns.to_vec(),
        }
    }
}

fn pivot<'r>(registry: &'r SchemaRegistry, rel: &RelationRef<'_>) -> Result<Pivot<'r>> {
    let through: &Through = rel.def.through.as_ref().ok_or_else(|| {
        Error::schema(
            SchemaErrorKind::Invalid,
            Some(&rel.owner.role),
            format!("'{}' has no pivot table", rel.qualified()),
        )
    })?;
    let table = through.table.clone().unwrap_or_default();
    let database = through
        .database
        .clone()
        .unwrap_or_else(|| rel.owner.database.clone());
    let entry = match &through.role {
        Some(role) => Some(registry.entry(role)?),
        None => None,
    };
    Ok(Pivot {
        table: TableRef::new(database, table),
        inner: through.inner_key.clone(),
        outer: through.outer_key.clone(),
        entry,
    })
}

/// One pivot row: source tuple, target tuple and its through-entity.
struct PivotRow {
    source: Vec<Value>,
    target: Vec<Value>,
    through: Option<EntityRef>,
}

/// Pivot rows for the given source tuples, in storage order.
fn pivot_rows(loader: &mut Loader<'_>, pivot: &Pivot<'_>, sources: &[Vec<Value>]) -> Result<Vec<PivotRow>> {
    if sources.is_empty() {
        return Ok(Vec::new());
    }
    if let Some(entry) = pivot.entry {
        let query = base_query(loader.registry, entry)?.filter(mapper::tuple_clause(&pivot.inner, sources));
        let (inner, outer) = (pivot.fields(&pivot.inner), pivot.fields(&pivot.outer));
        return Ok(loader
            .fetch(&entry.role, &query)?
            .into_iter()
            .filter_map(|through| {
                Some(PivotRow {
                    source: mapper::field_tuple(&through, &inner)?,
                    target: mapper::field_tuple(&through, &outer)?,
                    through: Some(through),
                })
            })
            .collect());
    }

    let query = FetchQuery::new(pivot.table.clone()).filter(mapper::tuple_clause(&pivot.inner, sources));
    let rows = loader.source.fetch(&query)?;
    let pick = |row: &entitymap_core::Row, columns: &[String]| -> Vec<Value> {
        columns
            .iter()
            .map(|c| row.get_by_name(c).map_or(Value::Null, Value::key_form))
            .collect()
    };
    Ok(rows
        .iter()
        .map(|row| PivotRow {
            source: pick(row, &pivot.inner),
            target: pick(row, &pivot.outer),
            through: None,
        })
        .collect())
}

/// Targets for the given outer tuples, in one read.
fn fetch_targets(
    loader: &mut Loader<'_>,
    rel: &RelationRef<'_>,
    tuples: &[Vec<Value>],
) -> Result<Vec<EntityRef>> {
    if tuples.is_empty() {
        return Ok(Vec::new());
    }
    let columns = mapper::columns_for(rel.target, &rel.def.outer_key);
    let query = base_query(loader.registry, rel.target)?.filter(mapper::tuple_clause(&columns, tuples));
    loader.fetch(&rel.target.role, &query)
}

fn unique(tuples: impl IntoIterator<Item = Vec<Value>>) -> Vec<Vec<Value>> {
    let mut out: Vec<Vec<Value>> = Vec::new();
    for t in tuples {
        if !out.contains(&t) {
            out.push(t);
        }
    }
    out
}

/// Targets of one source in pivot row order, each with its through-entity.
fn ordered_members(
    targets: &[EntityRef],
    rows: &[PivotRow],
    source_key: &[Value],
    outer_fields: &[String],
) -> Vec<(EntityRef, Option<EntityRef>)> {
    rows.iter()
        .filter(|row| row.source.as_slice() == source_key)
        .filter_map(|row| {
            targets
                .iter()
                .find(|e| mapper::field_tuple(e, outer_fields).as_ref() == Some(&row.target))
                .map(|target| (target.clone(), row.through.clone()))
        })
        .collect()
}

/// Attach through-entities to `parent` and return the bare members.
fn attach_pivots(parent: &EntityRef, rel: &RelationRef<'_>, members: Vec<(EntityRef, Option<EntityRef>)>) -> Vec<EntityRef> {
    members
        .into_iter()
        .map(|(target, through)| {
            if let Some(through) = through {
                parent.set_pivot(rel.name, &target, &through);
            }
            target
        })
        .collect()
}

pub(super) fn load_batch(
    loader: &mut Loader<'_>,
    rel: &RelationRef<'_>,
    parents: &[EntityRef],
) -> Result<Vec<EntityRef>> {
    let pivot = pivot(loader.registry, rel)?;
    let sources = unique(
        parents
            .iter()
            .filter_map(|p| mapper::field_tuple(p, &rel.def.inner_key)),
    );
    let rows = pivot_rows(loader, &pivot, &sources)?;
    let targets = fetch_targets(loader, rel, &unique(rows.iter().map(|r| r.target.clone())))?;

    for parent in parents {
        let members = match mapper::field_tuple(parent, &rel.def.inner_key) {
            Some(key) => attach_pivots(parent, rel, ordered_members(&targets, &rows, &key, &rel.def.outer_key)),
            None => Vec::new(),
        };
        parent.set_related(rel.name, Related::many(&members));
        loader.record_baseline(parent, rel.name, &members);
    }
    Ok(targets)
}

pub(super) fn defer(loader: &mut Loader<'_>, rel: &RelationRef<'_>, parent: &EntityRef) -> Result<()> {
    let scope: BTreeMap<String, Value> = rel
        .def
        .inner_key
        .iter()
        .map(|f| (f.clone(), parent.get(f)))
        .collect();
    let reference = resolver::create(
        loader.heap,
        loader.registry,
        &rel.target.role,
        scope,
        Cardinality::Many,
        Some(route(rel, parent)),
    )?;
    super::attach_deferred(loader, rel, parent, reference);
    Ok(())
}

/// The scope of a deferred many-to-many reference is the source key.
pub(super) fn resolve(
    loader: &mut Loader<'_>,
    rel: &RelationRef<'_>,
    reference: &Reference,
) -> Result<Resolved> {
    let pivot = pivot(loader.registry, rel)?;
    let source_key: Option<Vec<Value>> = rel
        .def
        .inner_key
        .iter()
        .map(|f| {
            reference
                .scope()
                .get(f)
                .filter(|v| !v.is_null())
                .map(Value::key_form)
        })
        .collect();
    let Some(source_key) = source_key else {
        return Ok(Resolved::Many(Vec::new()));
    };
    let rows = pivot_rows(loader, &pivot, std::slice::from_ref(&source_key))?;
    let targets = fetch_targets(loader, rel, &unique(rows.iter().map(|r| r.target.clone())))?;
    let members = ordered_members(&targets, &rows, &source_key, &rel.def.outer_key);

    let parent = reference.route().and_then(|route| {
        loader
            .heap
            .find(&IdentityKey::new(rel.owner.root_role(), route.source_key.clone()))
    });
    Ok(Resolved::Many(match parent {
        Some(parent) => attach_pivots(&parent, rel, members),
        None => members.into_iter().map(|(target, _)| target).collect(),
    }))
}

pub(super) fn queue(
    planner: &mut Planner<'_>,
    rel: &RelationRef<'_>,
    entity: &EntityRef,
    command: usize,
) -> Result<()> {
    let Some(listed) = current_members(entity, rel.name) else {
        return Ok(());
    };
    let mut members: Vec<EntityRef> = Vec::new();
    for m in listed {
        if !members.iter().any(|e| e.ptr_eq(&m)) {
            members.push(m);
        }
    }
    let pivot = pivot(planner.loader.registry, rel)?;

    let mut target_commands = Vec::with_capacity(members.len());
    for target in &members {
        if rel.def.cascade {
            target_commands.push(Some(planner.visit_persist(target)?));
        } else {
            planner.require_persisted(rel, target);
            target_commands.push(None);
        }
    }

    let baseline = baseline(planner, rel, &pivot, entity, &members)?;
    let current: Vec<Option<Vec<Value>>> = members
        .iter()
        .map(|t| mapper::field_tuple(t, &rel.def.outer_key))
        .collect();

    for (target, (key, target_command)) in members.iter().zip(current.iter().zip(target_commands)) {
        if key.as_ref().is_some_and(|k| baseline.contains(k)) {
            // Already linked; a tracked through-entity may carry changes.
            if let Some(through) = entity.pivot(rel.name, target) {
                if rel.def.cascade && planner.is_persisted(&through) {
                    planner.visit_persist(&through)?;
                }
            }
            continue;
        }
        let link = match pivot.entry {
            Some(entry) => link_through(planner, rel, &pivot, entry, entity, target)?,
            None => planner.graph.add(Command::link(
                &rel.owner.role,
                pivot.table.clone(),
                PivotLink {
                    source: entity.clone(),
                    source_fields: rel.def.inner_key.clone(),
                    inner_columns: pivot.inner.clone(),
                    target: target.clone(),
                    target_fields: rel.def.outer_key.clone(),
                    outer_columns: pivot.outer.clone(),
                },
            )),
        };
        if planner.is_insert(command) {
            planner.graph.depend(command, link, None);
        }
        match target_command {
            Some(tc) if planner.is_insert(tc) => planner.graph.depend(tc, link, None),
            Some(_) => {}
            None => planner.depend_late_command(target, link),
        }
    }

    if let Some(source_key) = mapper::field_tuple(entity, &rel.def.inner_key) {
        for removed in baseline.iter().filter(|b| !current.iter().any(|c| c.as_ref() == Some(*b))) {
            let identity = pivot
                .inner
                .iter()
                .cloned()
                .zip(source_key.iter().cloned())
                .chain(pivot.outer.iter().cloned().zip(removed.iter().cloned()))
                .collect();
            let mut unlink = Command::raw(
                CommandKind::Unlink,
                &rel.owner.role,
                pivot.table.clone(),
                BTreeMap::new(),
                identity,
            );
            unlink.entity = tracked_through(planner, rel, entity, removed);
            planner.graph.add(unlink);
        }
    }

    planner.record_baseline(entity, rel.name, members);
    Ok(())
}

/// Queue the through-entity row linking `source` to `target`. A member
/// without one gets a fresh, empty through-entity attached.
fn link_through(
    planner: &mut Planner<'_>,
    rel: &RelationRef<'_>,
    pivot: &Pivot<'_>,
    entry: &SchemaEntry,
    source: &EntityRef,
    target: &EntityRef,
) -> Result<usize> {
    let through = match source.pivot(rel.name, target) {
        Some(through) => through,
        None => {
            let through = EntityRef::new(Entity::new(entry.role.clone()));
            source.set_pivot(rel.name, target, &through);
            through
        }
    };
    if through.role() != entry.role {
        return Err(Error::Type(
            TypeError::new("through-entity of the pivot role", through.role()).field(rel.qualified()),
        ));
    }

    let index = if planner.is_persisted(&through) {
        planner.visit_persist(&through)?
    } else {
        planner.queue_link(&through, entry)
    };
    let keys = [
        (pivot.fields(&pivot.inner), source, &rel.def.inner_key),
        (pivot.fields(&pivot.outer), target, &rel.def.outer_key),
    ];
    for (holder_fields, provider, provider_fields) in keys {
        planner.graph.add_link(KeyLink {
            holder: through.clone(),
            holder_fields,
            provider: provider.clone(),
            provider_fields: provider_fields.clone(),
            relation: rel.qualified(),
            deferrable: false,
            deferred: false,
        });
    }
    Ok(index)
}

/// Tracked through-entity of a member whose outer key is `key`.
fn tracked_through(
    planner: &Planner<'_>,
    rel: &RelationRef<'_>,
    source: &EntityRef,
    key: &[Value],
) -> Option<EntityRef> {
    let pairs = source.read().pivots(rel.name).to_vec();
    pairs
        .into_iter()
        .find(|(member, _)| mapper::field_tuple(member, &rel.def.outer_key).as_deref() == Some(key))
        .map(|(_, through)| through)
        .filter(|through| planner.is_persisted(through))
}

/// Target keys currently linked in storage.
///
/// A known baseline is used when the outer key is the target's primary
/// key; otherwise (or when the relation was handed out unresolved) the
/// pivot is read. New sources have no links. Through-entities read here
/// are attached to the matching current members.
fn baseline(
    planner: &mut Planner<'_>,
    rel: &RelationRef<'_>,
    pivot: &Pivot<'_>,
    entity: &EntityRef,
    members: &[EntityRef],
) -> Result<Vec<Vec<Value>>> {
    if !planner.is_persisted(entity) {
        return Ok(Vec::new());
    }
    if rel.def.outer_key == rel.target.primary_key {
        if let Some(RelationState::Known(ids)) = planner.relation_state(entity, rel.name) {
            return Ok(ids.iter().map(|id| id.values().to_vec()).collect());
        }
    }
    let Some(source_key) = mapper::field_tuple(entity, &rel.def.inner_key) else {
        return Ok(Vec::new());
    };
    let rows = pivot_rows(&mut planner.loader, pivot, &[source_key])?;
    for row in &rows {
        let Some(through) = &row.through else {
            continue;
        };
        let member = members
            .iter()
            .find(|m| mapper::field_tuple(m, &rel.def.outer_key).as_ref() == Some(&row.target));
        if let Some(member) = member {
            if entity.pivot(rel.name, member).is_none() {
                entity.set_pivot(rel.name, member, through);
            }
        }
    }
    Ok(unique(rows.into_iter().map(|r| r.target)))
}

pub(super) fn queue_delete(
    planner: &mut Planner<'_>,
    rel: &RelationRef<'_>,
    entity: &EntityRef,
    command: usize,
) -> Result<()> {
    let Some(source_key) = mapper::field_tuple(entity, &rel.def.inner_key) else {
        return Ok(());
    };
    let pivot = pivot(planner.loader.registry, rel)?;
    let identity = pivot.inner.iter().cloned().zip(source_key).collect();
    let unlink = planner.graph.add(Command::raw(
        CommandKind::Unlink,
        &rel.owner.role,
        pivot.table.clone(),
        BTreeMap::new(),
        identity,
    ));
    planner.graph.depend(unlink, command, None);
    Ok(())
}
