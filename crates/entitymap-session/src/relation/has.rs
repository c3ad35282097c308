//! Target holds the key: `has_one` and `has_many`.
//!
//! Persisting the owner writes the owner's key into every related entity.
//! Members that disappeared since the last known baseline are orphans:
//! their key is nulled when the relation is nullable, otherwise they are
//! deleted when the relation cascades.

use super::{current_members, identities_of, keyed_batch, keyed_defer, RelationRef};
use crate::graph::{Command, CommandKind, KeyLink};
use crate::heap::{IdentityKey, RelationState};
use crate::loader::{base_query, Loader};
use crate::mapper;
use crate::unit_of_work::Planner;
use entitymap_core::{
    Cardinality, ConsistencyErrorKind, EntityRef, Error, Related, Result, Value,
};
use entitymap_schema::RelationKind;
use std::collections::BTreeMap;

fn cardinality(rel: &RelationRef<'_>) -> Cardinality {
    if rel.def.kind == RelationKind::HasMany {
        Cardinality::Many
    } else {
        Cardinality::One
    }
}

pub(super) fn load_batch(
    loader: &mut Loader<'_>,
    rel: &RelationRef<'_>,
    parents: &[EntityRef],
) -> Result<Vec<EntityRef>> {
    keyed_batch(
        loader,
        rel,
        parents,
        &rel.def.inner_key,
        &rel.def.outer_key,
        cardinality(rel),
    )
}

pub(super) fn defer(loader: &mut Loader<'_>, rel: &RelationRef<'_>, parent: &EntityRef) -> Result<()> {
    keyed_defer(
        loader,
        rel,
        parent,
        &rel.def.inner_key,
        &rel.def.outer_key,
        cardinality(rel),
    )
}

pub(super) fn queue(
    planner: &mut Planner<'_>,
    rel: &RelationRef<'_>,
    entity: &EntityRef,
    command: usize,
) -> Result<()> {
    let Some(members) = current_members(entity, rel.name) else {
        return Ok(());
    };
    let parent_inserted = planner.is_insert(command);

    for child in &members {
        let link = planner.graph.add_link(KeyLink {
            holder: child.clone(),
            holder_fields: rel.def.outer_key.clone(),
            provider: entity.clone(),
            provider_fields: rel.def.inner_key.clone(),
            relation: rel.qualified(),
            deferrable: false,
            deferred: false,
        });
        if !rel.def.cascade {
            // Members are written only by their own persist; the key is
            // copied if they are.
            planner.require_persisted(rel, child);
            if parent_inserted {
                planner.depend_late(entity, child, link);
            }
            continue;
        }
        let child_command = planner.visit_persist(child)?;
        if parent_inserted {
            planner.graph.depend(command, child_command, Some(link));
        }
    }

    if planner.is_persisted(entity) {
        if let Some(RelationState::Known(baseline)) = planner.relation_state(entity, rel.name) {
            let current = identities_of(planner, &members);
            for identity in baseline.iter().filter(|id| !current.contains(id)) {
                orphan(planner, rel, entity, identity)?;
            }
        }
    }
    planner.record_baseline(entity, rel.name, members);
    Ok(())
}

/// Handle a member removed from the relation since the last baseline.
fn orphan(
    planner: &mut Planner<'_>,
    rel: &RelationRef<'_>,
    parent: &EntityRef,
    identity: &IdentityKey,
) -> Result<()> {
    let target = rel.target;
    let live = planner.loader.heap.find(identity);

    // Re-pointed to another owner directly on the child: nothing to detach.
    if let Some(child) = &live {
        let child_key = mapper::field_tuple(child, &rel.def.outer_key);
        if child_key.is_some() && child_key != mapper::field_tuple(parent, &rel.def.inner_key) {
            return Ok(());
        }
    }

    tracing::debug!(relation = %rel.qualified(), orphan = %identity, "Detaching orphan");
    if rel.def.nullable {
        match live {
            Some(child) => {
                for field in &rel.def.outer_key {
                    planner.journal.assign(&child, field, Value::Null);
                }
                clear_inverse(planner, rel, parent, &child);
                planner.visit_persist(&child)?;
            }
            None => {
                let values = mapper::columns_for(target, &rel.def.outer_key)
                    .into_iter()
                    .map(|c| (c, Value::Null))
                    .collect();
                planner.graph.add(Command::raw(
                    CommandKind::Update,
                    &target.role,
                    target.table_ref(),
                    values,
                    mapper::pk_filter(target, identity),
                ));
            }
        }
        return Ok(());
    }

    if !rel.def.cascade {
        return Err(Error::consistency(
            ConsistencyErrorKind::NullReference,
            &rel.owner.role,
            Some(rel.name),
            format!("cannot detach {identity} from '{}': key is not nullable", rel.qualified()),
        ));
    }
    match live {
        Some(child) => {
            planner.visit_delete(&child)?;
        }
        None => {
            planner.graph.add(Command::raw(
                CommandKind::Delete,
                &target.role,
                target.table_ref(),
                BTreeMap::new(),
                mapper::pk_filter(target, identity),
            ));
        }
    }
    Ok(())
}

/// Null the child's own pointer back to `parent`, if it has one on the
/// same key.
fn clear_inverse(planner: &mut Planner<'_>, rel: &RelationRef<'_>, parent: &EntityRef, child: &EntityRef) {
    let inverse: Vec<String> = rel
        .target
        .relations
        .iter()
        .filter(|(_, def)| def.kind.holds_key() && def.inner_key == rel.def.outer_key)
        .map(|(name, _)| name.clone())
        .collect();
    for name in inverse {
        if child.related(&name).is_some_and(|r| r.points_to(parent)) {
            planner.journal.relate(child, &name, Related::Null);
        }
    }
}

pub(super) fn queue_delete(
    planner: &mut Planner<'_>,
    rel: &RelationRef<'_>,
    entity: &EntityRef,
    command: usize,
) -> Result<()> {
    let target = rel.target;
    let Some(key) = mapper::field_tuple(entity, &rel.def.inner_key) else {
        return Ok(());
    };
    let outer_columns = mapper::columns_for(target, &rel.def.outer_key);

    if rel.def.cascade {
        let children = match current_members(entity, rel.name) {
            Some(members) => members,
            None => {
                let query = base_query(planner.loader.registry, target)?
                    .filter(mapper::tuple_clause(&outer_columns, &[key]));
                planner.loader.fetch(&target.role, &query)?
            }
        };
        for child in &children {
            if let Some(child_command) = planner.visit_delete(child)? {
                planner.graph.depend(child_command, command, None);
            }
        }
    } else if rel.def.nullable {
        let values = outer_columns.iter().map(|c| (c.clone(), Value::Null)).collect();
        let filter = outer_columns.into_iter().zip(key).collect();
        let detach = planner.graph.add(Command::raw(
            CommandKind::Update,
            &target.role,
            target.table_ref(),
            values,
            filter,
        ));
        planner.graph.depend(detach, command, None);
    }
    Ok(())
}
