//! Field/column mapping between entities and rows.

use crate::heap::IdentityKey;
use entitymap_core::{Clause, Entity, EntityRef, Related, Result, Row, Value};
use entitymap_schema::{RelationKind, SchemaEntry, SchemaRegistry};
use std::collections::BTreeMap;

/// Column values for `entity` as stored under `entry`.
///
/// Fields are cast and renamed; embedded relations contribute their own
/// columns; discriminator and scope columns are filled in when the entity
/// leaves them unset.
pub fn to_columns(
    registry: &SchemaRegistry,
    entry: &SchemaEntry,
    entity: &EntityRef,
) -> Result<BTreeMap<String, Value>> {
    let data = entity.read().clone();
    let mut columns = BTreeMap::new();
    for (field, column) in &entry.columns {
        let value = data.get(field).cloned().unwrap_or(Value::Null);
        columns.insert(column.clone(), entry.cast_field(field, &value)?);
    }
    if let Some((field, value)) = entry.discriminator_value() {
        fill_if_null(&mut columns, entry.column_of(field), value);
    }
    for (field, value) in &entry.scope {
        fill_if_null(&mut columns, entry.column_of(field), value);
    }
    for (name, def) in &entry.relations {
        if def.kind != RelationKind::Embedded {
            continue;
        }
        let target = registry.entry(&def.target)?;
        let embedded = data.relation(name).and_then(Related::as_one);
        for (field, column) in &target.columns {
            let value = embedded
                .as_ref()
                .map_or(Value::Null, |e| e.get(field));
            columns.insert(column.clone(), target.cast_field(field, &value)?);
        }
    }
    Ok(columns)
}

fn fill_if_null(columns: &mut BTreeMap<String, Value>, column: Option<&str>, value: &Value) {
    if let Some(column) = column {
        let slot = columns.entry(column.to_string()).or_insert(Value::Null);
        if slot.is_null() {
            *slot = value.clone();
        }
    }
}

/// Build a fresh entity of `entry`'s role from a row.
pub fn hydrate(registry: &SchemaRegistry, entry: &SchemaEntry, row: &Row) -> Result<Entity> {
    let mut entity = Entity::new(entry.role.clone());
    for (field, column) in &entry.columns {
        if let Some(value) = row.get_by_name(column) {
            entity.set(field.clone(), entry.cast_field(field, value)?);
        }
    }
    for (name, def) in &entry.relations {
        if def.kind != RelationKind::Embedded {
            continue;
        }
        let target = registry.entry(&def.target)?;
        let mut embedded = Entity::new(target.role.clone());
        let mut any = false;
        for (field, column) in &target.columns {
            if let Some(value) = row.get_by_name(column) {
                any |= !value.is_null();
                embedded.set(field.clone(), target.cast_field(field, value)?);
            }
        }
        let related = if any {
            Related::One(EntityRef::new(embedded))
        } else {
            Related::Null
        };
        entity.set_relation(name.clone(), related);
    }
    Ok(entity)
}

/// Values of `fields` on `entity`, in key form, or `None` if any is null.
pub fn field_tuple(entity: &EntityRef, fields: &[String]) -> Option<Vec<Value>> {
    let data = entity.read();
    fields
        .iter()
        .map(|f| {
            data.get(f)
                .filter(|v| !v.is_null())
                .map(Value::key_form)
        })
        .collect()
}

/// Identity of `entity` under `entry`, if its primary key is complete.
pub fn identity_of(entry: &SchemaEntry, entity: &EntityRef) -> Option<IdentityKey> {
    field_tuple(entity, &entry.primary_key)
        .map(|values| IdentityKey::new(entry.root_role(), values))
}

/// Identity read from a column map (row or snapshot).
pub fn identity_from_columns(
    entry: &SchemaEntry,
    columns: &BTreeMap<String, Value>,
) -> Option<IdentityKey> {
    entry
        .pk_columns()
        .iter()
        .map(|c| columns.get(c).filter(|v| !v.is_null()).cloned())
        .collect::<Option<Vec<_>>>()
        .map(|values| IdentityKey::new(entry.root_role(), values))
}

/// Primary-key column filter for an identity.
pub fn pk_filter(entry: &SchemaEntry, identity: &IdentityKey) -> BTreeMap<String, Value> {
    entry
        .pk_columns()
        .into_iter()
        .zip(identity.values().iter().cloned())
        .collect()
}

/// Equality clauses for field values, translated to columns.
pub fn field_clauses(entry: &SchemaEntry, fields: &BTreeMap<String, Value>) -> Vec<Clause> {
    fields
        .iter()
        .map(|(field, value)| {
            let column = entry.column_of(field).unwrap_or(field).to_string();
            if value.is_null() {
                Clause::IsNull(column)
            } else {
                Clause::Eq(column, value.clone())
            }
        })
        .collect()
}

/// Clause matching any of the given key tuples on `columns`.
pub fn tuple_clause(columns: &[String], tuples: &[Vec<Value>]) -> Clause {
    if let [column] = columns {
        return Clause::In(
            column.clone(),
            tuples.iter().filter_map(|t| t.first().cloned()).collect(),
        );
    }
    Clause::AnyOf(
        tuples
            .iter()
            .map(|t| {
                columns
                    .iter()
                    .zip(t)
                    .map(|(c, v)| Clause::Eq(c.clone(), v.clone()))
                    .collect()
            })
            .collect(),
    )
}

/// Columns for `fields` under `entry`.
pub fn columns_for(entry: &SchemaEntry, fields: &[String]) -> Vec<String> {
    fields
        .iter()
        .map(|f| entry.column_of(f).unwrap_or(f).to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use entitymap_schema::{Cast, RelationDef};

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new([
            SchemaEntry::new("user", "users")
                .primary_key(["id"])
                .column("id", "user_id")
                .column("name", "user_name")
                .cast("age", Cast::Int)
                .field("age")
                .relation("address", RelationDef::embedded("address")),
            SchemaEntry::embeddable("address")
                .column("city", "address_city")
                .column("zip", "address_zip"),
        ])
        .unwrap()
    }

    #[test]
    fn columns_are_renamed_cast_and_embedded() {
        let registry = registry();
        let entry = registry.entry("user").unwrap();
        let user = EntityRef::new(
            Entity::new("user")
                .with("id", 1_i64)
                .with("name", "ann")
                .with("age", "42"),
        );
        let address = EntityRef::new(Entity::new("address").with("city", "Oslo"));
        user.set_related("address", Related::one(&address));

        let cols = to_columns(&registry, entry, &user).unwrap();
        assert_eq!(cols.get("user_id"), Some(&Value::BigInt(1)));
        assert_eq!(cols.get("user_name"), Some(&Value::Text("ann".into())));
        assert_eq!(cols.get("age"), Some(&Value::BigInt(42)));
        assert_eq!(cols.get("address_city"), Some(&Value::Text("Oslo".into())));
        assert_eq!(cols.get("address_zip"), Some(&Value::Null));
    }

    #[test]
    fn hydrate_then_columns_is_stable() {
        let registry = registry();
        let entry = registry.entry("user").unwrap();
        let row = Row::from_pairs([
            ("user_id", Value::Int(5)),
            ("user_name", Value::Text("bo".into())),
            ("age", Value::Int(30)),
            ("address_city", Value::Text("Rome".into())),
            ("address_zip", Value::Null),
        ]);
        let entity = EntityRef::new(hydrate(&registry, entry, &row).unwrap());
        assert_eq!(entity.get("id"), Value::Int(5));
        assert_eq!(
            entity
                .related("address")
                .and_then(|r| r.as_one())
                .map(|a| a.get("city")),
            Some(Value::Text("Rome".into()))
        );
        let identity = identity_of(entry, &entity).unwrap();
        assert_eq!(identity, IdentityKey::new("user", vec![Value::BigInt(5)]));
        let cols = to_columns(&registry, entry, &entity).unwrap();
        assert_eq!(identity_from_columns(entry, &cols), Some(identity.clone()));
        assert_eq!(
            pk_filter(entry, &identity),
            BTreeMap::from([("user_id".to_string(), Value::BigInt(5))])
        );
    }

    #[test]
    fn tuple_clauses() {
        let single = tuple_clause(&["id".into()], &[vec![Value::BigInt(1)], vec![Value::BigInt(2)]]);
        assert_eq!(
            single,
            Clause::In("id".into(), vec![Value::BigInt(1), Value::BigInt(2)])
        );
        let composite = tuple_clause(
            &["a".into(), "b".into()],
            &[vec![Value::BigInt(1), Value::BigInt(2)]],
        );
        assert!(matches!(composite, Clause::AnyOf(groups) if groups[0].len() == 2));
    }
}
