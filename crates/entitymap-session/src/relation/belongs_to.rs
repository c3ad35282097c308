//! Owner holds the key: `belongs_to` and `refers_to`.
//!
//! Both copy the target's key into the owner before the owner is written.
//! They differ only in cycle handling: a nullable `refers_to` link may be
//! cut, writing the owner with a null key and patching it afterwards.

use super::{keyed_batch, keyed_defer, RelationRef};
use crate::graph::KeyLink;
use crate::loader::Loader;
use crate::unit_of_work::Planner;
use entitymap_core::{
    Cardinality, ConsistencyErrorKind, EntityRef, Error, Resolved, Result, TypeError, Value,
};

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
        Cardinality::One,
    )
}

pub(super) fn defer(loader: &mut Loader<'_>, rel: &RelationRef<'_>, parent: &EntityRef) -> Result<()> {
    keyed_defer(
        loader,
        rel,
        parent,
        &rel.def.inner_key,
        &rel.def.outer_key,
        Cardinality::One,
    )
}

pub(super) fn queue(
    planner: &mut Planner<'_>,
    rel: &RelationRef<'_>,
    entity: &EntityRef,
    command: usize,
) -> Result<()> {
    // Unset or still deferred: the key fields on the owner are authoritative.
    let Some(current) = entity.related(rel.name).and_then(|r| r.current()) else {
        return Ok(());
    };
    let target = match current {
        Resolved::One(target) => target,
        Resolved::Many(_) => {
            return Err(Error::Type(
                TypeError::new("single related entity", "collection").field(rel.qualified()),
            ));
        }
    };

    let Some(target) = target else {
        if !rel.def.nullable {
            return Err(Error::consistency(
                ConsistencyErrorKind::NullReference,
                &rel.owner.role,
                Some(rel.name),
                format!("'{}' is required but was set to null", rel.qualified()),
            ));
        }
        for field in &rel.def.inner_key {
            planner.journal.assign(entity, field, Value::Null);
        }
        return Ok(());
    };

    let provider = if rel.def.cascade {
        Some(planner.visit_persist(&target)?)
    } else {
        planner.require_persisted(rel, &target);
        None
    };
    let link = planner.graph.add_link(KeyLink {
        holder: entity.clone(),
        holder_fields: rel.def.inner_key.clone(),
        provider: target.clone(),
        provider_fields: rel.def.outer_key.clone(),
        relation: rel.qualified(),
        deferrable: rel.def.is_deferrable(),
        deferred: false,
    });
    match provider {
        Some(provider) if planner.is_insert(provider) => {
            planner.graph.depend(provider, command, Some(link));
        }
        Some(_) => {}
        None => planner.depend_late(&target, entity, link),
    }
    Ok(())
}
