use entitymap::prelude::*;
use entitymap::{ConsistencyErrorKind, StatementKind, TableRef};
use std::sync::Arc;

fn nodes() -> Arc<SchemaRegistry> {
    Arc::new(
        SchemaRegistry::new([SchemaEntry::new("node", "nodes")
            .primary_key(["id"])
            .field("id")
            .field("name")
            .field("parent_id")
            .relation("parent", RelationDef::refers_to("node"))])
        .expect("valid schema"),
    )
}

fn session(registry: Arc<SchemaRegistry>) -> Session<MemoryStore> {
    let store = MemoryStore::from_registry(&registry);
    Session::new(registry, store)
}

fn node(name: &str) -> EntityRef {
    EntityRef::new(Entity::new("node").with("name", name))
}

#[test]
fn self_reference_is_inserted_then_patched() {
    let mut session = session(nodes());
    let root = node("root");
    root.set_related("parent", Related::one(&root));

    session.persist(&root).unwrap();
    let result = session.run().unwrap();
    assert_eq!(result.inserted, 1);
    assert_eq!(result.updated, 1);

    let id = root.get("id");
    assert!(!id.is_null());
    assert_eq!(root.get("parent_id"), id);

    let writes: Vec<_> = session
        .backend()
        .statements()
        .into_iter()
        .filter(|s| s.kind.is_write())
        .collect();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0].kind, StatementKind::Insert);
    assert_eq!(writes[1].kind, StatementKind::Update);
    assert_eq!(writes[1].columns, vec!["parent_id".to_string()]);

    let rows = session.backend().rows(&TableRef::new("default", "nodes"));
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("parent_id"), Some(&id));

    // The patched key is part of the snapshot.
    assert!(session.changes(&root).unwrap().is_empty());

    // Reloaded, the node refers to its own identity.
    session.clear();
    let loaded = session.get("node", [id]).unwrap().unwrap();
    let parent = session.resolve_relation(&loaded, "parent").unwrap().entities();
    assert_eq!(parent.len(), 1);
    assert!(parent[0].ptr_eq(&loaded));
}

#[test]
fn mutual_references_take_two_inserts_and_one_patch() {
    let mut session = session(nodes());
    let a = node("a");
    let b = node("b");
    a.set_related("parent", Related::one(&b));
    b.set_related("parent", Related::one(&a));

    session.persist(&a).unwrap();
    let result = session.run().unwrap();
    assert_eq!(result.inserted, 2);
    assert_eq!(result.updated, 1);
    assert_eq!(a.get("parent_id"), b.get("id"));
    assert_eq!(b.get("parent_id"), a.get("id"));

    let rows = session.backend().rows(&TableRef::new("default", "nodes"));
    assert_eq!(rows.len(), 2);
    for row in &rows {
        assert!(!row.get("parent_id").is_none_or(Value::is_null));
    }

    session.backend().clear_log();
    session.persist(&b).unwrap();
    assert_eq!(session.run().unwrap().total(), 0);
    assert_eq!(session.backend().writes(), 0);

    // Reloaded, each node resolves to the other one.
    let (a_id, b_id) = (a.get("id"), b.get("id"));
    session.clear();
    let loaded_a = session.get("node", [a_id]).unwrap().unwrap();
    let loaded_b = session.get("node", [b_id]).unwrap().unwrap();
    let of_a = session.resolve_relation(&loaded_a, "parent").unwrap().entities();
    let of_b = session.resolve_relation(&loaded_b, "parent").unwrap().entities();
    assert!(of_a[0].ptr_eq(&loaded_b));
    assert!(of_b[0].ptr_eq(&loaded_a));
}

#[test]
fn chain_into_existing_parent_needs_no_patch() {
    let mut session = session(nodes());
    let parent = node("parent");
    session.persist(&parent).unwrap();
    session.run().unwrap();

    let child = node("child");
    child.set_related("parent", Related::one(&parent));
    session.persist(&child).unwrap();
    let result = session.run().unwrap();
    assert_eq!(result.inserted, 1);
    assert_eq!(result.updated, 0);
    assert_eq!(child.get("parent_id"), parent.get("id"));
}

#[test]
fn cycle_of_required_keys_is_rejected_before_writing() {
    let registry = Arc::new(
        SchemaRegistry::new([
            SchemaEntry::new("left", "lefts")
                .primary_key(["id"])
                .field("id")
                .field("right_id")
                .relation("right", RelationDef::belongs_to("right")),
            SchemaEntry::new("right", "rights")
                .primary_key(["id"])
                .field("id")
                .field("left_id")
                .relation("left", RelationDef::belongs_to("left")),
        ])
        .unwrap(),
    );
    let mut session = session(registry);
    let l = EntityRef::new(Entity::new("left"));
    let r = EntityRef::new(Entity::new("right"));
    l.set_related("right", Related::one(&r));
    r.set_related("left", Related::one(&l));

    session.persist(&l).unwrap();
    let err = session.run().unwrap_err();
    assert_eq!(
        err.consistency_kind(),
        Some(ConsistencyErrorKind::UnresolvableCycle)
    );
    assert_eq!(session.backend().count(StatementKind::Begin), 0);
    assert_eq!(session.backend().writes(), 0);
    assert_eq!(session.status(&l), Some(Status::New));
    assert_eq!(session.status(&r), Some(Status::New));
}
