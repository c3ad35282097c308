//! Construction of deferred references.
//!
//! A reference that can be settled without a read is handed out already
//! resolved: a to-one reference whose scope is exactly the target's
//! primary key and whose target is in the heap, and any reference whose
//! scope contains a null (nothing can match it).

use crate::heap::{Heap, IdentityKey};
use entitymap_core::{Cardinality, Reference, Resolved, Result, Route, Value};
use entitymap_schema::SchemaRegistry;
use std::collections::BTreeMap;

/// Build a reference to `target` rows matching `scope` (target field to value).
#[tracing::instrument(level = "trace", skip(heap, registry, scope, route))]
pub fn create(
    heap: &Heap,
    registry: &SchemaRegistry,
    target: &str,
    scope: BTreeMap<String, Value>,
    cardinality: Cardinality,
    route: Option<Route>,
) -> Result<Reference> {
    let entry = registry.entry(target)?;

    if scope.values().any(Value::is_null) {
        let empty = match cardinality {
            Cardinality::One => Resolved::One(None),
            Cardinality::Many => Resolved::Many(Vec::new()),
        };
        return Ok(Reference::ready(target, scope, empty));
    }

    if cardinality == Cardinality::One
        && scope.len() == entry.primary_key.len()
        && entry.primary_key.iter().all(|f| scope.contains_key(f))
    {
        let values = entry
            .primary_key
            .iter()
            .filter_map(|f| scope.get(f).cloned())
            .collect();
        let identity = IdentityKey::new(entry.root_role(), values);
        if let Some(found) = heap.find(&identity) {
            if registry.descends_from(&found.role(), target) {
                tracing::trace!(identity = %identity, "Reference resolved from heap");
                return Ok(Reference::ready(target, scope, Resolved::One(Some(found))));
            }
        }
    }

    Ok(match route {
        Some(route) => Reference::routed(target, scope, cardinality, route),
        None => Reference::new(target, scope, cardinality),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Status;
    use entitymap_core::{Entity, EntityRef};
    use entitymap_schema::SchemaEntry;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new([SchemaEntry::new("user", "users")
            .primary_key(["id"])
            .field("id")
            .field("email")])
        .unwrap()
    }

    fn scope(field: &str, value: Value) -> BTreeMap<String, Value> {
        BTreeMap::from([(field.to_string(), value)])
    }

    #[test]
    fn primary_key_scope_resolves_from_heap() {
        let registry = registry();
        let mut heap = Heap::new();
        let user = EntityRef::new(Entity::new("user").with("id", 4_i64));
        heap.register(
            &user,
            "user",
            Some(IdentityKey::new("user", vec![Value::BigInt(4)])),
            Status::Managed,
        );

        let reference = create(&heap, &registry, "user", scope("id", Value::Int(4)), Cardinality::One, None).unwrap();
        assert!(reference.is_resolved());
        assert!(reference.points_to(&user));
    }

    #[test]
    fn other_scopes_stay_deferred() {
        let registry = registry();
        let heap = Heap::new();
        let by_email = create(
            &heap,
            &registry,
            "user",
            scope("email", Value::Text("a@b".into())),
            Cardinality::One,
            None,
        )
        .unwrap();
        assert!(!by_email.is_resolved());

        let missing = create(&heap, &registry, "user", scope("id", Value::BigInt(1)), Cardinality::One, None).unwrap();
        assert!(!missing.is_resolved());
    }

    #[test]
    fn null_scope_resolves_empty() {
        let registry = registry();
        let heap = Heap::new();
        let one = create(&heap, &registry, "user", scope("id", Value::Null), Cardinality::One, None).unwrap();
        assert!(matches!(one.get(), Some(Resolved::One(None))));
        let many = create(&heap, &registry, "user", scope("id", Value::Null), Cardinality::Many, None).unwrap();
        assert!(matches!(many.get(), Some(Resolved::Many(v)) if v.is_empty()));
    }

    #[test]
    fn undefined_target_is_a_schema_error() {
        let registry = registry();
        let heap = Heap::new();
        let err = create(&heap, &registry, "ghost", BTreeMap::new(), Cardinality::One, None).unwrap_err();
        assert!(err.is_schema());
    }
}
