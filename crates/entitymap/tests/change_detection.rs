use entitymap::prelude::*;
use entitymap::{Cast, StatementKind, TableRef};
use serde_json::json;
use std::sync::Arc;

fn registry() -> Arc<SchemaRegistry> {
    Arc::new(
        SchemaRegistry::new([
            SchemaEntry::new("customer", "customers")
                .primary_key(["id"])
                .field("id")
                .field("name")
                .field("prefs")
                .cast("prefs", Cast::Json)
                .relation("address", RelationDef::embedded("address")),
            SchemaEntry::embeddable("address").field("city").field("zip"),
        ])
        .expect("valid schema"),
    )
}

fn session() -> Session<MemoryStore> {
    let registry = registry();
    let store = MemoryStore::from_registry(&registry);
    Session::new(registry, store)
}

fn address(city: &str, zip: &str) -> Related {
    Related::One(EntityRef::new(
        Entity::new("address").with("city", city).with("zip", zip),
    ))
}

fn updates(session: &Session<MemoryStore>) -> Vec<Vec<String>> {
    session
        .backend()
        .statements()
        .into_iter()
        .filter(|s| s.kind == StatementKind::Update)
        .map(|s| s.columns)
        .collect()
}

#[test]
fn json_value_object_compares_structurally() {
    let mut session = session();
    let ann = EntityRef::new(
        Entity::new("customer")
            .with("name", "ann")
            .with("prefs", json!({"theme": "dark", "langs": ["en", "nb"]})),
    );
    session.persist(&ann).unwrap();
    session.run().unwrap();
    session.backend().clear_log();

    // Same document, different key order and representation.
    ann.set("prefs", json!({"langs": ["en", "nb"], "theme": "dark"}));
    assert!(session.changes(&ann).unwrap().is_empty());
    ann.set("prefs", r#"{"theme":"dark","langs":["en","nb"]}"#);
    session.persist(&ann).unwrap();
    assert_eq!(session.run().unwrap().total(), 0);
    assert_eq!(session.backend().writes(), 0);

    ann.set("prefs", json!({"theme": "dark", "langs": ["en"]}));
    session.persist(&ann).unwrap();
    let result = session.run().unwrap();
    assert_eq!(result.updated, 1);
    assert_eq!(updates(&session), vec![vec!["prefs".to_string()]]);
}

#[test]
fn embedded_value_object_writes_only_changed_columns() {
    let mut session = session();
    let ann = EntityRef::new(Entity::new("customer").with("name", "ann"));
    ann.set_related("address", address("Oslo", "0150"));
    session.persist(&ann).unwrap();
    session.run().unwrap();

    let rows = session.backend().rows(&TableRef::new("default", "customers"));
    assert_eq!(rows[0].get("city"), Some(&Value::Text("Oslo".into())));
    assert_eq!(rows[0].get("zip"), Some(&Value::Text("0150".into())));

    // A fresh but equal value object is not a change.
    session.backend().clear_log();
    ann.set_related("address", address("Oslo", "0150"));
    session.persist(&ann).unwrap();
    session.run().unwrap();
    assert_eq!(session.backend().writes(), 0);

    ann.set_related("address", address("Bergen", "0150"));
    session.persist(&ann).unwrap();
    session.run().unwrap();
    assert_eq!(updates(&session), vec![vec!["city".to_string()]]);

    session.clear();
    let loaded = session.get("customer", ann.get("id").as_i64()).unwrap().unwrap();
    let home = loaded.related("address").unwrap().as_one().unwrap();
    assert_eq!(home.role(), "address");
    assert_eq!(home.get("city"), Value::Text("Bergen".into()));
}

#[test]
fn unchanged_columns_are_left_out_of_updates() {
    let mut session = session();
    let ann = EntityRef::new(Entity::new("customer").with("name", "ann"));
    session.persist(&ann).unwrap();
    session.run().unwrap();

    ann.set("name", "anna");
    assert_eq!(session.changes(&ann).unwrap().column_names(), vec!["name"]);
    session.backend().clear_log();
    session.persist(&ann).unwrap();
    session.run().unwrap();
    assert_eq!(updates(&session), vec![vec!["name".to_string()]]);
    assert!(session.changes(&ann).unwrap().is_empty());
}

#[test]
fn embedded_value_of_wrong_role_is_rejected() {
    let mut session = session();
    let ann = EntityRef::new(Entity::new("customer").with("name", "ann"));
    ann.set_related("address", Related::One(EntityRef::new(Entity::new("customer"))));
    session.persist(&ann).unwrap();
    assert!(matches!(session.run().unwrap_err(), Error::Type(_)));
    assert_eq!(session.backend().writes(), 0);
}
