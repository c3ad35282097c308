//! Embedded value objects live in their owner's row; the mapper reads and
//! writes their columns, so persistence only checks the value's role.

use super::RelationRef;
use entitymap_core::{EntityRef, Error, Result, TypeError};

pub(super) fn queue(rel: &RelationRef<'_>, entity: &EntityRef) -> Result<()> {
    let Some(value) = entity.related(rel.name).and_then(|r| r.as_one()) else {
        return Ok(());
    };
    let role = value.role();
    if role != rel.target.role {
        return Err(Error::Type(
            TypeError::new("embedded value of the declared role", format!("'{role}'"))
                .field(rel.qualified()),
        ));
    }
    Ok(())
}
