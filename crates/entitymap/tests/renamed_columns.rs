use entitymap::prelude::*;
use entitymap::{Cast, StatementKind, TableRef};
use std::sync::Arc;

fn registry() -> Arc<SchemaRegistry> {
    Arc::new(
        SchemaRegistry::new([SchemaEntry::new("account", "accounts")
            .primary_key(["id"])
            .column("id", "account_id")
            .column("name", "account_name")
            .column("age", "account_age")
            .cast("age", Cast::Int)])
        .expect("valid schema"),
    )
}

fn accounts() -> TableRef {
    TableRef::new("default", "accounts")
}

#[test]
fn fields_are_stored_under_their_columns() {
    let registry = registry();
    let mut session = Session::new(registry.clone(), MemoryStore::from_registry(&registry));

    let ann = EntityRef::new(Entity::new("account").with("name", "ann").with("age", "41"));
    session.persist(&ann).unwrap();
    session.run().unwrap();
    assert_eq!(ann.get("id"), Value::BigInt(1));

    let rows = session.backend().rows(&accounts());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("account_id"), Some(&Value::BigInt(1)));
    assert_eq!(rows[0].get("account_name"), Some(&Value::Text("ann".into())));
    assert_eq!(rows[0].get("account_age"), Some(&Value::BigInt(41)));
    assert!(!rows[0].contains_key("name"));

    // The text age casts to the stored integer, so nothing is dirty.
    assert!(session.changes(&ann).unwrap().is_empty());
    session.backend().clear_log();
    session.persist(&ann).unwrap();
    session.run().unwrap();
    assert_eq!(session.backend().writes(), 0);

    ann.set("name", "anna");
    let changes = session.changes(&ann).unwrap();
    assert_eq!(changes.column_names(), vec!["account_name"]);
}

#[test]
fn filters_and_rows_use_column_names() {
    let registry = registry();
    let mut session = Session::new(registry.clone(), MemoryStore::from_registry(&registry));
    let ann = EntityRef::new(Entity::new("account").with("name", "ann").with("age", 41_i64));
    session.persist(&ann).unwrap();
    session.run().unwrap();

    session.backend().clear_log();
    let found = session
        .select(&Select::new("account").where_eq("name", "ann"))
        .unwrap();
    assert!(found[0].ptr_eq(&ann));
    let fetches: Vec<_> = session
        .backend()
        .statements()
        .into_iter()
        .filter(|s| s.kind == StatementKind::Fetch)
        .collect();
    assert_eq!(fetches.len(), 1);
    assert_eq!(fetches[0].table, "default.accounts");
    assert_eq!(fetches[0].columns, vec!["account_name".to_string()]);

    let rows = session
        .fetch_rows(&Select::new("account").order_by("age", Order::Desc))
        .unwrap();
    assert_eq!(rows[0].get_by_name("account_id"), Some(&Value::BigInt(1)));

    let err = session
        .select(&Select::new("account").where_eq("nickname", "x"))
        .unwrap_err();
    assert!(err.is_schema());
}

#[test]
fn hydration_maps_columns_back_to_fields() {
    let registry = registry();
    let mut session = Session::new(registry.clone(), MemoryStore::from_registry(&registry));
    let ann = EntityRef::new(Entity::new("account").with("name", "ann").with("age", 7_i32));
    session.persist(&ann).unwrap();
    session.run().unwrap();

    session.clear();
    let loaded = session.get("account", [1_i64]).unwrap().unwrap();
    assert!(!loaded.ptr_eq(&ann));
    assert_eq!(loaded.get("name"), Value::Text("ann".into()));
    assert_eq!(loaded.get("age"), Value::BigInt(7));
    assert_eq!(loaded.get("account_name"), Value::Null);
}
