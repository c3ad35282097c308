use entitymap::prelude::*;
use entitymap::{StatementKind, TableRef};
use std::collections::BTreeMap;
use std::sync::Arc;

fn registry() -> Arc<SchemaRegistry> {
    Arc::new(
        SchemaRegistry::new([
            SchemaEntry::new("user", "users")
                .primary_key(["id"])
                .field("id")
                .field("name")
                .relation("posts", RelationDef::has_many("post")),
            SchemaEntry::new("post", "posts")
                .primary_key(["id"])
                .field("id")
                .field("title")
                .field("user_id")
                .relation("author", RelationDef::belongs_to("user").inner_key(["user_id"])),
        ])
        .expect("valid schema"),
    )
}

fn row(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

fn seeded_session() -> Session<MemoryStore> {
    let registry = registry();
    let store = MemoryStore::from_registry(&registry);
    store
        .seed(
            &TableRef::new("default", "users"),
            row(&[("id", Value::BigInt(1)), ("name", Value::Text("ann".into()))]),
        )
        .expect("seed user");
    Session::new(registry, store)
}

#[test]
fn loading_a_row_twice_yields_one_instance() {
    let mut session = seeded_session();

    let first = session
        .select(&Select::new("user").where_pk([1_i64]))
        .expect("first select");
    let second = session
        .select(&Select::new("user").where_eq("name", "ann"))
        .expect("second select");
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert!(first[0].ptr_eq(&second[0]));
    assert_eq!(session.status(&first[0]), Some(Status::Managed));

    // Integer width does not split identities.
    let reads = session.backend().reads();
    let by_key = session
        .get("user", [Value::Int(1)])
        .expect("get")
        .expect("tracked user");
    assert!(by_key.ptr_eq(&first[0]));
    assert_eq!(session.backend().reads(), reads);
}

#[test]
fn detached_entities_are_loaded_fresh() {
    let mut session = seeded_session();
    let user = session.get("user", [1_i64]).unwrap().unwrap();

    assert!(session.detach(&user));
    assert_eq!(session.status(&user), None);

    let again = session.get("user", [1_i64]).unwrap().unwrap();
    assert!(!again.ptr_eq(&user));
    assert_eq!(again.get("name"), Value::Text("ann".into()));
}

#[test]
fn unknown_key_returns_none() {
    let mut session = seeded_session();
    assert!(session.get("user", [42_i64]).unwrap().is_none());
}

#[test]
fn resaving_unchanged_graph_writes_nothing() {
    let registry = registry();
    let mut session = Session::new(registry.clone(), MemoryStore::from_registry(&registry));

    let user = EntityRef::new(Entity::new("user").with("name", "ann"));
    let post = EntityRef::new(Entity::new("post").with("title", "hello"));
    user.set_related("posts", Related::many([&post]));
    session.persist(&user).unwrap();
    let result = session.run().unwrap();
    assert_eq!(result.inserted, 2);
    assert_eq!(post.get("user_id"), user.get("id"));

    session.backend().clear_log();
    session.persist(&user).unwrap();
    let result = session.run().unwrap();
    assert_eq!(result.total(), 0);
    assert_eq!(session.backend().writes(), 0);
    assert_eq!(session.backend().count(StatementKind::Fetch), 0);
    assert_eq!(session.status(&post), Some(Status::Managed));
}

#[test]
fn persisted_entity_is_found_by_its_generated_key() {
    let registry = registry();
    let mut session = Session::new(registry.clone(), MemoryStore::from_registry(&registry));

    let user = EntityRef::new(Entity::new("user").with("name", "bea"));
    session.persist(&user).unwrap();
    session.run().unwrap();

    let loaded = session
        .select(&Select::new("user").where_eq("name", "bea"))
        .unwrap();
    assert_eq!(loaded.len(), 1);
    assert!(loaded[0].ptr_eq(&user));
}
