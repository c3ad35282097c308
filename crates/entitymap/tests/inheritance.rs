use entitymap::prelude::*;
use entitymap::TableRef;
use std::sync::Arc;

fn registry() -> Arc<SchemaRegistry> {
    Arc::new(
        SchemaRegistry::new([
            SchemaEntry::new("person", "people")
                .primary_key(["id"])
                .field("id")
                .field("kind")
                .field("name")
                .discriminator("kind", [("person", "person"), ("admin", "admin")]),
            SchemaEntry::child("admin", "person").field("level"),
        ])
        .expect("valid schema"),
    )
}

fn populated() -> (Session<MemoryStore>, EntityRef, EntityRef) {
    let registry = registry();
    let store = MemoryStore::from_registry(&registry);
    let mut session = Session::new(registry, store);
    let bob = EntityRef::new(Entity::new("person").with("name", "bob"));
    let root = EntityRef::new(Entity::new("admin").with("name", "root").with("level", 3_i64));
    session.persist(&bob).unwrap();
    session.persist(&root).unwrap();
    session.run().unwrap();
    (session, bob, root)
}

#[test]
fn child_rows_share_the_parent_table() {
    let (session, _, _) = populated();
    let rows = session.backend().rows(&TableRef::new("default", "people"));
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get("kind"), Some(&Value::Text("person".into())));
    assert_eq!(rows[1].get("kind"), Some(&Value::Text("admin".into())));
    assert_eq!(rows[1].get("level"), Some(&Value::BigInt(3)));
}

#[test]
fn rows_hydrate_as_their_discriminated_role() {
    let (mut session, _, _) = populated();
    session.clear();

    let people = session
        .select(&Select::new("person").order_by("id", Order::Asc))
        .unwrap();
    let roles: Vec<String> = people.iter().map(EntityRef::role).collect();
    assert_eq!(roles, vec!["person".to_string(), "admin".to_string()]);
    assert_eq!(people[1].get("level"), Value::BigInt(3));

    let admins = session.select(&Select::new("admin")).unwrap();
    assert_eq!(admins.len(), 1);
    assert!(admins[0].ptr_eq(&people[1]));
}

#[test]
fn identities_span_the_hierarchy() {
    let (mut session, bob, root) = populated();
    let root_id = root.get("id");
    let bob_id = bob.get("id");

    let as_person = session.get("person", [root_id]).unwrap().unwrap();
    assert!(as_person.ptr_eq(&root));

    // A plain person is not an admin, even when asked by its key.
    assert!(session.get("admin", [bob_id]).unwrap().is_none());
}

#[test]
fn discriminator_is_kept_on_update() {
    let (mut session, _, root) = populated();
    root.set("level", 4_i64);
    session.persist(&root).unwrap();
    session.run().unwrap();

    let rows = session.backend().rows(&TableRef::new("default", "people"));
    assert_eq!(rows[1].get("kind"), Some(&Value::Text("admin".into())));
    assert_eq!(rows[1].get("level"), Some(&Value::BigInt(4)));
}
