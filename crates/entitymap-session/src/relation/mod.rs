//! Relation strategies.
//!
//! Each relation kind knows how to hydrate itself (batched eager load,
//! deferred reference, reference resolution) and how to queue the writes
//! it implies when its owner is persisted or deleted. Strategies are a
//! closed set, dispatched by [`RelationKind`].

mod belongs_to;
mod embedded;
mod has;
mod many_to_many;

use crate::heap::RelationState;
use crate::loader::{base_query, identities, Loader};
use crate::mapper;
use crate::resolver;
use crate::unit_of_work::Planner;
use entitymap_core::{
    Cardinality, EntityRef, Reference, Related, Resolved, Result, Route, Value,
};
use entitymap_schema::{RelationDef, RelationKind, SchemaEntry};
use std::collections::BTreeMap;

/// A relation of a concrete owner role, with both ends resolved.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RelationRef<'a> {
    pub owner: &'a SchemaEntry,
    pub name: &'a str,
    pub def: &'a RelationDef,
    pub target: &'a SchemaEntry,
}

impl RelationRef<'_> {
    /// `role.relation`, for diagnostics.
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.owner.role, self.name)
    }
}

/// Loading and persistence behavior of one relation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationStrategy {
    BelongsTo,
    RefersTo,
    HasOne,
    HasMany,
    ManyToMany,
    Embedded,
}

impl RelationStrategy {
    pub fn for_kind(kind: RelationKind) -> Self {
        match kind {
            RelationKind::BelongsTo => Self::BelongsTo,
            RelationKind::RefersTo => Self::RefersTo,
            RelationKind::HasOne => Self::HasOne,
            RelationKind::HasMany => Self::HasMany,
            RelationKind::ManyToMany => Self::ManyToMany,
            RelationKind::Embedded => Self::Embedded,
        }
    }

    /// Load the relation for all `parents` at once and attach it.
    /// Returns every related entity that was loaded.
    pub(crate) fn load_batch(
        self,
        loader: &mut Loader<'_>,
        rel: &RelationRef<'_>,
        parents: &[EntityRef],
    ) -> Result<Vec<EntityRef>> {
        match self {
            Self::BelongsTo | Self::RefersTo => belongs_to::load_batch(loader, rel, parents),
            Self::HasOne | Self::HasMany => has::load_batch(loader, rel, parents),
            Self::ManyToMany => many_to_many::load_batch(loader, rel, parents),
            Self::Embedded => Ok(Vec::new()),
        }
    }

    /// Attach a deferred reference to `parent`.
    pub(crate) fn defer(
        self,
        loader: &mut Loader<'_>,
        rel: &RelationRef<'_>,
        parent: &EntityRef,
    ) -> Result<()> {
        match self {
            Self::BelongsTo | Self::RefersTo => belongs_to::defer(loader, rel, parent),
            Self::HasOne | Self::HasMany => has::defer(loader, rel, parent),
            Self::ManyToMany => many_to_many::defer(loader, rel, parent),
            Self::Embedded => Ok(()),
        }
    }

    /// Load what a deferred reference of this relation points to.
    pub(crate) fn resolve(
        self,
        loader: &mut Loader<'_>,
        rel: &RelationRef<'_>,
        reference: &Reference,
    ) -> Result<Resolved> {
        match self {
            Self::ManyToMany => many_to_many::resolve(loader, rel, reference),
            _ => resolve_by_scope(loader, rel.target, reference),
        }
    }

    /// Queue the writes implied by this relation when `entity` is persisted.
    pub(crate) fn queue(
        self,
        planner: &mut Planner<'_>,
        rel: &RelationRef<'_>,
        entity: &EntityRef,
        command: usize,
    ) -> Result<()> {
        match self {
            Self::BelongsTo | Self::RefersTo => belongs_to::queue(planner, rel, entity, command),
            Self::HasOne | Self::HasMany => has::queue(planner, rel, entity, command),
            Self::ManyToMany => many_to_many::queue(planner, rel, entity, command),
            Self::Embedded => embedded::queue(rel, entity),
        }
    }

    /// Queue the writes implied by this relation when `entity` is deleted.
    pub(crate) fn queue_delete(
        self,
        planner: &mut Planner<'_>,
        rel: &RelationRef<'_>,
        entity: &EntityRef,
        command: usize,
    ) -> Result<()> {
        match self {
            Self::HasOne | Self::HasMany => has::queue_delete(planner, rel, entity, command),
            Self::ManyToMany => many_to_many::queue_delete(planner, rel, entity, command),
            Self::BelongsTo | Self::RefersTo | Self::Embedded => Ok(()),
        }
    }
}

/// One batched read joining `parents` to targets on
/// `parent_fields == target_fields`, attaching the matches to each parent.
fn keyed_batch(
    loader: &mut Loader<'_>,
    rel: &RelationRef<'_>,
    parents: &[EntityRef],
    parent_fields: &[String],
    target_fields: &[String],
    cardinality: Cardinality,
) -> Result<Vec<EntityRef>> {
    let mut tuples: Vec<Vec<Value>> = Vec::new();
    for parent in parents {
        if let Some(t) = mapper::field_tuple(parent, parent_fields) {
            if !tuples.contains(&t) {
                tuples.push(t);
            }
        }
    }

    let targets = if tuples.is_empty() {
        Vec::new()
    } else {
        let columns = mapper::columns_for(rel.target, target_fields);
        let query = base_query(loader.registry, rel.target)?
            .filter(mapper::tuple_clause(&columns, &tuples));
        loader.fetch(&rel.target.role, &query)?
    };

    for parent in parents {
        let matches: Vec<EntityRef> = match mapper::field_tuple(parent, parent_fields) {
            Some(key) => targets
                .iter()
                .filter(|t| mapper::field_tuple(t, target_fields).as_ref() == Some(&key))
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        let related = match cardinality {
            Cardinality::One => matches
                .first()
                .map_or(Related::Null, Related::one),
            Cardinality::Many => Related::many(&matches),
        };
        parent.set_related(rel.name, related);
        loader.record_baseline(parent, rel.name, &matches);
    }
    Ok(targets)
}

/// Attach a deferred reference selecting targets whose `target_fields`
/// equal the parent's `parent_fields`.
fn keyed_defer(
    loader: &mut Loader<'_>,
    rel: &RelationRef<'_>,
    parent: &EntityRef,
    parent_fields: &[String],
    target_fields: &[String],
    cardinality: Cardinality,
) -> Result<()> {
    let scope: BTreeMap<String, Value> = target_fields
        .iter()
        .zip(parent_fields)
        .map(|(t, p)| (t.clone(), parent.get(p)))
        .collect();
    let reference = resolver::create(
        loader.heap,
        loader.registry,
        &rel.target.role,
        scope,
        cardinality,
        Some(route(rel, parent)),
    )?;
    attach_deferred(loader, rel, parent, reference);
    Ok(())
}

fn route(rel: &RelationRef<'_>, parent: &EntityRef) -> Route {
    Route {
        source_role: rel.owner.role.clone(),
        relation: rel.name.to_string(),
        source_key: rel
            .owner
            .primary_key
            .iter()
            .map(|f| parent.get(f))
            .collect(),
    }
}

fn attach_deferred(
    loader: &mut Loader<'_>,
    rel: &RelationRef<'_>,
    parent: &EntityRef,
    reference: Reference,
) {
    match reference.get() {
        Some(resolved) => loader.record_baseline(parent, rel.name, &resolved.entities()),
        None => loader
            .heap
            .set_relation_state(parent, rel.name, RelationState::Pending),
    }
    tracing::trace!(relation = %rel.qualified(), resolved = reference.is_resolved(), "Deferred relation");
    parent.set_related(rel.name, Related::Deferred(reference));
}

/// Resolve a reference by selecting its target role filtered by its scope.
pub(crate) fn resolve_by_scope(
    loader: &mut Loader<'_>,
    target: &SchemaEntry,
    reference: &Reference,
) -> Result<Resolved> {
    let cardinality = reference.cardinality();
    if reference.scope().values().any(Value::is_null) {
        return Ok(empty(cardinality));
    }
    let mut query = base_query(loader.registry, target)?;
    query
        .filters
        .extend(mapper::field_clauses(target, reference.scope()));
    if cardinality == Cardinality::One {
        query.limit = Some(1);
    }
    let found = loader.fetch(&target.role, &query)?;
    Ok(match cardinality {
        Cardinality::One => Resolved::One(found.into_iter().next()),
        Cardinality::Many => Resolved::Many(found),
    })
}

fn empty(cardinality: Cardinality) -> Resolved {
    match cardinality {
        Cardinality::One => Resolved::One(None),
        Cardinality::Many => Resolved::Many(Vec::new()),
    }
}

/// Current members of a relation on `entity`: `None` when the relation was
/// never set or is an unresolved deferred reference.
fn current_members(entity: &EntityRef, name: &str) -> Option<Vec<EntityRef>> {
    entity
        .related(name)
        .and_then(|r| r.current())
        .map(|resolved| resolved.entities())
}

/// Identities helper shared by the persistence side.
fn identities_of(planner: &Planner<'_>, entities: &[EntityRef]) -> Vec<crate::heap::IdentityKey> {
    identities(planner.loader.registry, entities)
}
