//! Per-role schema entries.

use crate::relation::RelationDef;
use crate::typecast::Cast;
use entitymap_core::{Result, TableRef, Value};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;

pub const DEFAULT_DATABASE: &str = "default";

/// Single-table inheritance: a discriminator field on the root role and the
/// roles each of its values selects.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Discriminator {
    pub field: String,
    /// Discriminator label -> role.
    pub variants: BTreeMap<String, String>,
}

/// Mapping metadata for one role.
///
/// `columns` maps every persisted field to its column; renaming is just a
/// different column name. Child roles in an inheritance hierarchy inherit
/// storage, key, columns, casts and relations from their parent when the
/// registry is built.
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaEntry {
    /// Filled from the map key when loaded from JSON.
    #[serde(default)]
    pub role: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub primary_key: Vec<String>,
    /// Field -> column.
    #[serde(default)]
    pub columns: BTreeMap<String, String>,
    #[serde(default)]
    pub casts: BTreeMap<String, Cast>,
    #[serde(default)]
    pub relations: BTreeMap<String, RelationDef>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub discriminator: Option<Discriminator>,
    /// Constant field filter applied to every read and written on insert.
    #[serde(default, deserialize_with = "scope_from_json")]
    pub scope: BTreeMap<String, Value>,
    /// Whether storage generates the (single-column) primary key.
    #[serde(default = "default_generated")]
    pub generated_key: bool,
    /// Embeddable roles have no table of their own.
    #[serde(default)]
    pub embeddable: bool,

    #[serde(skip)]
    pub(crate) root: String,
    #[serde(skip)]
    pub(crate) discriminator_value: Option<(String, Value)>,
}

fn default_database() -> String {
    DEFAULT_DATABASE.to_string()
}

fn default_generated() -> bool {
    true
}

fn scope_from_json<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
    Ok(raw
        .iter()
        .map(|(k, v)| (k.clone(), Value::from_json_scalar(v)))
        .collect())
}

impl SchemaEntry {
    /// New entry stored in `table` of the default database.
    pub fn new(role: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            database: default_database(),
            table: table.into(),
            primary_key: Vec::new(),
            columns: BTreeMap::new(),
            casts: BTreeMap::new(),
            relations: BTreeMap::new(),
            parent: None,
            discriminator: None,
            scope: BTreeMap::new(),
            generated_key: true,
            embeddable: false,
            root: String::new(),
            discriminator_value: None,
        }
    }

    /// New embeddable entry; its columns are merged into the owner's row.
    pub fn embeddable(role: impl Into<String>) -> Self {
        let mut entry = Self::new(role, "");
        entry.embeddable = true;
        entry.generated_key = false;
        entry
    }

    /// New child role of `parent`, sharing its table.
    pub fn child(role: impl Into<String>, parent: impl Into<String>) -> Self {
        let mut entry = Self::new(role, "");
        entry.parent = Some(parent.into());
        entry
    }

    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set the primary key fields, in key order.
    #[must_use]
    pub fn primary_key<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Map a field to a column of the same name.
    #[must_use]
    pub fn field(self, field: &str) -> Self {
        self.column(field, field)
    }

    /// Map a field to a differently named column.
    #[must_use]
    pub fn column(mut self, field: impl Into<String>, column: impl Into<String>) -> Self {
        self.columns.insert(field.into(), column.into());
        self
    }

    #[must_use]
    pub fn cast(mut self, field: impl Into<String>, cast: Cast) -> Self {
        self.casts.insert(field.into(), cast);
        self
    }

    #[must_use]
    pub fn relation(mut self, name: impl Into<String>, def: RelationDef) -> Self {
        self.relations.insert(name.into(), def);
        self
    }

    #[must_use]
    pub fn discriminator<I, L, R>(mut self, field: impl Into<String>, variants: I) -> Self
    where
        I: IntoIterator<Item = (L, R)>,
        L: Into<String>,
        R: Into<String>,
    {
        self.discriminator = Some(Discriminator {
            field: field.into(),
            variants: variants
                .into_iter()
                .map(|(l, r)| (l.into(), r.into()))
                .collect(),
        });
        self
    }

    #[must_use]
    pub fn scope(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.scope.insert(field.into(), value.into());
        self
    }

    #[must_use]
    pub fn generated_key(mut self, generated: bool) -> Self {
        self.generated_key = generated;
        self
    }

    /// Root role of the inheritance hierarchy; the role itself when it has
    /// no parent. Identity keys are namespaced by this role.
    pub fn root_role(&self) -> &str {
        if self.root.is_empty() {
            &self.role
        } else {
            &self.root
        }
    }

    /// Discriminator field and the value this role writes, for child roles
    /// and for roots that list themselves as a variant.
    pub fn discriminator_value(&self) -> Option<(&str, &Value)> {
        self.discriminator_value
            .as_ref()
            .map(|(field, value)| (field.as_str(), value))
    }

    pub fn table_ref(&self) -> TableRef {
        TableRef::new(self.database.clone(), self.table.clone())
    }

    /// Column for a field.
    pub fn column_of(&self, field: &str) -> Option<&str> {
        self.columns.get(field).map(String::as_str)
    }

    /// Field for a column.
    pub fn field_of(&self, column: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|(_, c)| c.as_str() == column)
            .map(|(f, _)| f.as_str())
    }

    /// Primary key columns in key order.
    pub fn pk_columns(&self) -> Vec<String> {
        self.primary_key
            .iter()
            .map(|f| self.column_of(f).unwrap_or(f).to_string())
            .collect()
    }

    /// True when storage fills in a single-field primary key.
    pub fn has_generated_key(&self) -> bool {
        self.generated_key && self.primary_key.len() == 1
    }

    /// Cast a field value according to the entry's rules.
    pub fn cast_field(&self, field: &str, value: &Value) -> Result<Value> {
        match self.casts.get(field) {
            Some(cast) => cast.apply(value).map_err(|e| match e {
                entitymap_core::Error::Type(te) => entitymap_core::Error::Type(te.field(field)),
                other => other,
            }),
            None => Ok(value.clone()),
        }
    }

    /// Relation by name.
    pub fn relation_def(&self, name: &str) -> Option<&RelationDef> {
        self.relations.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renamed_columns_lookup() {
        let entry = SchemaEntry::new("user", "users")
            .primary_key(["id"])
            .column("id", "user_id")
            .column("name", "user_name");
        assert_eq!(entry.column_of("name"), Some("user_name"));
        assert_eq!(entry.field_of("user_id"), Some("id"));
        assert_eq!(entry.pk_columns(), vec!["user_id".to_string()]);
        assert!(entry.has_generated_key());
        assert_eq!(entry.root_role(), "user");
        assert_eq!(entry.table_ref(), TableRef::new("default", "users"));
    }

    #[test]
    fn cast_errors_name_the_field() {
        let entry = SchemaEntry::new("user", "users").cast("age", Cast::Int);
        let err = entry
            .cast_field("age", &Value::Text("old".into()))
            .unwrap_err();
        assert!(err.to_string().contains("'age'"));
        assert_eq!(
            entry.cast_field("name", &Value::Text("x".into())).unwrap(),
            Value::Text("x".into())
        );
    }

    #[test]
    fn scope_deserializes_plain_json() {
        let entry: SchemaEntry = serde_json::from_str(
            r#"{"table":"posts","primary_key":["id"],"columns":{"id":"id"},"scope":{"published":true,"lang":"en"}}"#,
        )
        .unwrap();
        assert_eq!(entry.scope.get("published"), Some(&Value::Bool(true)));
        assert_eq!(entry.scope.get("lang"), Some(&Value::Text("en".into())));
        assert_eq!(entry.database, DEFAULT_DATABASE);
    }
}
