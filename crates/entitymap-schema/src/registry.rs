//! Schema registry construction and lookup.

use crate::entry::{DEFAULT_DATABASE, SchemaEntry};
use crate::relation::{RelationDef, RelationKind};
use entitymap_core::{ConfigError, Error, Result, SchemaErrorKind, Value};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Read-only source of per-role mapping metadata.
pub trait SchemaProvider {
    /// Metadata for `role`, or a schema error when it is not registered.
    fn describe(&self, role: &str) -> Result<&SchemaEntry>;
}

/// Validated, immutable set of schema entries.
///
/// Build once, wrap in `Arc` and hand to every session that needs it.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    entries: BTreeMap<String, SchemaEntry>,
}

fn identifier_regex() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok())
        .as_ref()
}

fn is_identifier(name: &str) -> bool {
    identifier_regex().is_some_and(|re| re.is_match(name))
}

fn check_identifier(role: &str, what: &str, name: &str) -> Result<()> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(Error::schema(
            SchemaErrorKind::Invalid,
            Some(role),
            format!("{what} '{name}' is not a valid identifier"),
        ))
    }
}

fn missing_field(role: &str, context: &str, field: &str) -> Error {
    Error::schema(
        SchemaErrorKind::MissingField,
        Some(role),
        format!("{context} names unmapped field '{field}' on role '{role}'"),
    )
}

fn invalid(role: &str, message: impl Into<String>) -> Error {
    Error::schema(SchemaErrorKind::Invalid, Some(role), message)
}

impl SchemaRegistry {
    /// Build a registry, failing fast on the first invalid definition.
    ///
    /// Besides validation this:
    /// - merges child roles with their parent (table, key, columns, casts,
    ///   relations, scope)
    /// - fills in missing relation keys: `has_*` and `many_to_many` use the
    ///   declaring role's primary key as inner key; `has_*` outer keys
    ///   default to `{role}_{pk}`; `belongs_to`/`refers_to` outer keys
    ///   default to the target primary key and inner keys to
    ///   `{relation}_{pk}`; pivot keys default to `{role}_{pk}` and
    ///   `{target}_{pk}`
    /// - rewrites through-entity pivots into table and column names
    #[tracing::instrument(level = "debug", skip(entries))]
    pub fn new<I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = SchemaEntry>,
    {
        let mut raw = BTreeMap::new();
        for entry in entries {
            if raw.contains_key(&entry.role) {
                return Err(Error::schema(
                    SchemaErrorKind::DuplicateRole,
                    Some(&entry.role),
                    format!("role '{}' is registered twice", entry.role),
                ));
            }
            check_identifier(&entry.role, "role", &entry.role)?;
            raw.insert(entry.role.clone(), entry);
        }

        let mut merged = BTreeMap::new();
        let roles: Vec<String> = raw.keys().cloned().collect();
        for role in &roles {
            merge_entry(role, &raw, &mut merged, &mut Vec::new())?;
        }

        for entry in merged.values() {
            validate_entry(entry)?;
        }

        let mut registry = Self { entries: merged };
        for role in &roles {
            registry.finalize_relations(role)?;
        }
        registry.assign_discriminators()?;

        tracing::debug!(roles = registry.entries.len(), "Schema registry built");
        Ok(registry)
    }

    /// Load from a JSON object mapping role names to entries.
    pub fn from_json(json: &str) -> Result<Self> {
        let parsed: BTreeMap<String, SchemaEntry> =
            serde_json::from_str(json).map_err(|e| {
                Error::Config(ConfigError {
                    message: format!("invalid schema document: {e}"),
                    source: Some(Box::new(e)),
                })
            })?;
        Self::new(parsed.into_iter().map(|(role, mut entry)| {
            entry.role = role;
            entry
        }))
    }

    /// Entry for a role.
    pub fn entry(&self, role: &str) -> Result<&SchemaEntry> {
        self.entries
            .get(role)
            .ok_or_else(|| Error::undefined_role(role))
    }

    /// Relation `name` declared on (or inherited by) `role`.
    pub fn relation(&self, role: &str, name: &str) -> Result<&RelationDef> {
        self.entry(role)?
            .relation_def(name)
            .ok_or_else(|| Error::undefined_relation(role, name))
    }

    /// Registered role names.
    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Role a row belongs to, given the role it was read through and the
    /// row's discriminator value. Falls back to `role` when there is no
    /// discriminator or the value is unknown.
    pub fn variant_for<'a>(&'a self, role: &'a str, value: Option<&Value>) -> &'a str {
        let Ok(entry) = self.entry(role) else {
            return role;
        };
        let Ok(root) = self.entry(entry.root_role()) else {
            return role;
        };
        let (Some(disc), Some(label)) = (&root.discriminator, value.and_then(Value::label)) else {
            return role;
        };
        match disc.variants.get(&label) {
            Some(variant) if self.descends_from(variant, role) => variant,
            _ => role,
        }
    }

    /// Whether `role` is `ancestor` or inherits from it.
    pub fn descends_from(&self, role: &str, ancestor: &str) -> bool {
        let mut current = Some(role);
        while let Some(r) = current {
            if r == ancestor {
                return true;
            }
            current = self.entries.get(r).and_then(|e| e.parent.as_deref());
        }
        false
    }

    fn finalize_relations(&mut self, role: &str) -> Result<()> {
        let entry = self.entry(role)?.clone();
        let mut relations = entry.relations.clone();
        for (name, def) in &mut relations {
            check_identifier(role, "relation", name)?;
            let target = self.entries.get(&def.target).ok_or_else(|| {
                Error::schema(
                    SchemaErrorKind::UndefinedRole,
                    Some(role),
                    format!("relation '{name}' targets undefined role '{}'", def.target),
                )
            })?;

            if def.kind == RelationKind::Embedded {
                if !target.embeddable {
                    return Err(invalid(
                        role,
                        format!("embedded relation '{name}' targets non-embeddable role '{}'", def.target),
                    ));
                }
                if let Some(column) = target
                    .columns
                    .values()
                    .find(|c| entry.columns.values().any(|own| own == *c))
                {
                    return Err(invalid(
                        role,
                        format!("embedded relation '{name}' reuses column '{column}'"),
                    ));
                }
                continue;
            }
            if target.embeddable {
                return Err(invalid(
                    role,
                    format!("relation '{name}' targets embeddable role '{}'", def.target),
                ));
            }

            default_keys(name, def, &entry, target);
            let context = format!("relation '{name}'");
            if def.inner_key.is_empty() || def.inner_key.len() != def.outer_key.len() {
                return Err(invalid(
                    role,
                    format!("{context} has mismatched inner/outer keys"),
                ));
            }
            for field in &def.inner_key {
                if entry.column_of(field).is_none() {
                    return Err(missing_field(role, &context, field));
                }
            }
            for field in &def.outer_key {
                if target.column_of(field).is_none() {
                    return Err(missing_field(&def.target, &context, field));
                }
            }

            if def.kind == RelationKind::ManyToMany {
                self.finalize_through(role, name, def, &entry)?;
            }
        }

        if let Some(e) = self.entries.get_mut(role) {
            e.relations = relations;
        }
        Ok(())
    }

    fn finalize_through(
        &self,
        role: &str,
        name: &str,
        def: &mut RelationDef,
        entry: &SchemaEntry,
    ) -> Result<()> {
        let Some(through) = def.through.as_mut() else {
            return Err(invalid(
                role,
                format!("many-to-many relation '{name}' has no pivot"),
            ));
        };
        if through.inner_key.is_empty() {
            through.inner_key = def
                .inner_key
                .iter()
                .map(|f| format!("{}_{f}", entry.role))
                .collect();
        }
        if through.outer_key.is_empty() {
            through.outer_key = def
                .outer_key
                .iter()
                .map(|f| format!("{}_{f}", def.target))
                .collect();
        }
        if through.inner_key.len() != def.inner_key.len()
            || through.outer_key.len() != def.outer_key.len()
        {
            return Err(invalid(
                role,
                format!("pivot keys of relation '{name}' do not match the related keys"),
            ));
        }

        if let Some(pivot_role) = through.role.clone() {
            let pivot = self.entry(&pivot_role)?;
            let to_columns = |fields: &[String]| -> Result<Vec<String>> {
                fields
                    .iter()
                    .map(|f| {
                        pivot
                            .column_of(f)
                            .map(str::to_string)
                            .ok_or_else(|| missing_field(&pivot_role, "pivot key", f))
                    })
                    .collect()
            };
            through.inner_key = to_columns(&through.inner_key)?;
            through.outer_key = to_columns(&through.outer_key)?;
            through.table = Some(pivot.table.clone());
            through.database = Some(pivot.database.clone());
        }

        let Some(table) = through.table.as_deref() else {
            return Err(invalid(
                role,
                format!("pivot of relation '{name}' names neither a table nor a role"),
            ));
        };
        check_identifier(role, "pivot table", table)?;
        for column in through.inner_key.iter().chain(&through.outer_key) {
            check_identifier(role, "pivot column", column)?;
        }
        if through.database.is_none() {
            through.database = Some(entry.database.clone());
        }
        Ok(())
    }

    fn assign_discriminators(&mut self) -> Result<()> {
        let mut assignments = Vec::new();
        for (role, entry) in &self.entries {
            let Some(disc) = &entry.discriminator else {
                continue;
            };
            if entry.parent.is_some() {
                return Err(invalid(
                    role,
                    "only the root role of a hierarchy may declare a discriminator",
                ));
            }
            if entry.column_of(&disc.field).is_none() {
                return Err(missing_field(role, "discriminator", &disc.field));
            }
            for (label, variant) in &disc.variants {
                if !self.descends_from(variant, role) {
                    return Err(invalid(
                        role,
                        format!("discriminator variant '{label}' names '{variant}', which does not inherit from '{role}'"),
                    ));
                }
                let value = entry.cast_field(&disc.field, &Value::Text(label.clone()))?;
                assignments.push((variant.clone(), disc.field.clone(), value));
            }
        }
        for (variant, field, value) in assignments {
            if let Some(e) = self.entries.get_mut(&variant) {
                e.discriminator_value = Some((field, value));
            }
        }
        Ok(())
    }
}

impl SchemaProvider for SchemaRegistry {
    fn describe(&self, role: &str) -> Result<&SchemaEntry> {
        self.entry(role)
    }
}

fn merge_entry(
    role: &str,
    raw: &BTreeMap<String, SchemaEntry>,
    done: &mut BTreeMap<String, SchemaEntry>,
    stack: &mut Vec<String>,
) -> Result<()> {
    if done.contains_key(role) {
        return Ok(());
    }
    if stack.iter().any(|r| r == role) {
        return Err(invalid(role, "inheritance cycle"));
    }
    let entry = raw.get(role).ok_or_else(|| Error::undefined_role(role))?;
    let mut merged = entry.clone();

    match &entry.parent {
        None => merged.root = role.to_string(),
        Some(parent) => {
            if !raw.contains_key(parent) {
                return Err(Error::schema(
                    SchemaErrorKind::UndefinedRole,
                    Some(role),
                    format!("parent role '{parent}' is not registered"),
                ));
            }
            stack.push(role.to_string());
            merge_entry(parent, raw, done, stack)?;
            stack.pop();
            let p = done.get(parent).ok_or_else(|| Error::undefined_role(parent))?;

            if !merged.table.is_empty() && merged.table != p.table {
                return Err(invalid(role, "child roles share their parent's table"));
            }
            if !merged.primary_key.is_empty() && merged.primary_key != p.primary_key {
                return Err(invalid(role, "child roles share their parent's primary key"));
            }
            merged.root.clone_from(&p.root);
            merged.table.clone_from(&p.table);
            merged.database.clone_from(&p.database);
            merged.primary_key.clone_from(&p.primary_key);
            merged.generated_key = p.generated_key;
            merged.embeddable = p.embeddable;
            for (field, column) in &p.columns {
                merged.columns.entry(field.clone()).or_insert_with(|| column.clone());
            }
            for (field, cast) in &p.casts {
                merged.casts.entry(field.clone()).or_insert(*cast);
            }
            for (field, value) in &p.scope {
                merged.scope.entry(field.clone()).or_insert_with(|| value.clone());
            }
            for (name, def) in &p.relations {
                merged.relations.entry(name.clone()).or_insert_with(|| def.clone());
            }
        }
    }

    // keys that only depend on the declaring role are filled here so that
    // children inherit them unchanged
    let pk = merged.primary_key.clone();
    for (name, def) in &mut merged.relations {
        if entry.relations.contains_key(name) && !matches!(def.kind, RelationKind::BelongsTo | RelationKind::RefersTo | RelationKind::Embedded) {
            if def.inner_key.is_empty() {
                def.inner_key.clone_from(&pk);
            }
            if def.outer_key.is_empty() && matches!(def.kind, RelationKind::HasOne | RelationKind::HasMany) {
                def.outer_key = def.inner_key.iter().map(|f| format!("{role}_{f}")).collect();
            }
            if let Some(through) = def.through.as_mut() {
                if through.inner_key.is_empty() {
                    through.inner_key = def.inner_key.iter().map(|f| format!("{role}_{f}")).collect();
                }
            }
        }
    }

    done.insert(role.to_string(), merged);
    Ok(())
}

fn default_keys(name: &str, def: &mut RelationDef, entry: &SchemaEntry, target: &SchemaEntry) {
    match def.kind {
        RelationKind::BelongsTo | RelationKind::RefersTo => {
            if def.outer_key.is_empty() {
                def.outer_key.clone_from(&target.primary_key);
            }
            if def.inner_key.is_empty() {
                def.inner_key = def.outer_key.iter().map(|f| format!("{name}_{f}")).collect();
            }
        }
        RelationKind::HasOne | RelationKind::HasMany => {
            if def.inner_key.is_empty() {
                def.inner_key.clone_from(&entry.primary_key);
            }
            if def.outer_key.is_empty() {
                def.outer_key = def
                    .inner_key
                    .iter()
                    .map(|f| format!("{}_{f}", entry.role))
                    .collect();
            }
        }
        RelationKind::ManyToMany => {
            if def.inner_key.is_empty() {
                def.inner_key.clone_from(&entry.primary_key);
            }
            if def.outer_key.is_empty() {
                def.outer_key.clone_from(&target.primary_key);
            }
        }
        RelationKind::Embedded => {}
    }
}

fn validate_entry(entry: &SchemaEntry) -> Result<()> {
    let role = entry.role.as_str();
    for (field, column) in &entry.columns {
        check_identifier(role, "field", field)?;
        check_identifier(role, "column", column)?;
    }
    if entry.embeddable {
        return Ok(());
    }
    check_identifier(role, "table", &entry.table)?;
    if entry.database != DEFAULT_DATABASE {
        check_identifier(role, "database", &entry.database)?;
    }
    if entry.primary_key.is_empty() {
        return Err(invalid(role, format!("role '{role}' has no primary key")));
    }
    for field in &entry.primary_key {
        if entry.column_of(field).is_none() {
            return Err(missing_field(role, "primary key", field));
        }
    }
    for field in entry.casts.keys() {
        if entry.column_of(field).is_none() {
            return Err(missing_field(role, "cast", field));
        }
    }
    for field in entry.scope.keys() {
        if entry.column_of(field).is_none() {
            return Err(missing_field(role, "scope", field));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relation::Through;

    fn blog() -> Vec<SchemaEntry> {
        vec![
            SchemaEntry::new("user", "users")
                .primary_key(["id"])
                .field("id")
                .field("name")
                .relation("posts", RelationDef::has_many("post"))
                .relation(
                    "tags",
                    RelationDef::many_to_many("tag", Through::table("user_tags")),
                ),
            SchemaEntry::new("post", "posts")
                .primary_key(["id"])
                .field("id")
                .field("title")
                .field("user_id")
                .field("author_id")
                .relation("author", RelationDef::belongs_to("user")),
            SchemaEntry::new("tag", "tags").primary_key(["id"]).field("id"),
        ]
    }

    #[test]
    fn relation_keys_are_defaulted() {
        let registry = SchemaRegistry::new(blog()).unwrap();

        let posts = registry.relation("user", "posts").unwrap();
        assert_eq!(posts.inner_key, vec!["id"]);
        assert_eq!(posts.outer_key, vec!["user_id"]);

        let author = registry.relation("post", "author").unwrap();
        assert_eq!(author.inner_key, vec!["author_id"]);
        assert_eq!(author.outer_key, vec!["id"]);

        let tags = registry.relation("user", "tags").unwrap();
        let through = tags.through.as_ref().unwrap();
        assert_eq!(through.inner_key, vec!["user_id"]);
        assert_eq!(through.outer_key, vec!["tag_id"]);
        assert_eq!(through.database.as_deref(), Some(DEFAULT_DATABASE));
    }

    #[test]
    fn missing_key_field_fails_fast() {
        let mut entries = blog();
        entries[1].columns.remove("author_id");
        let err = SchemaRegistry::new(entries).unwrap_err();
        match err {
            Error::Schema(e) => assert_eq!(e.kind, SchemaErrorKind::MissingField),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn undefined_target_and_duplicates() {
        let entries = vec![
            SchemaEntry::new("a", "a")
                .primary_key(["id"])
                .field("id")
                .relation("b", RelationDef::belongs_to("missing")),
        ];
        assert!(SchemaRegistry::new(entries).unwrap_err().is_schema());

        let entries = vec![
            SchemaEntry::new("a", "a").primary_key(["id"]).field("id"),
            SchemaEntry::new("a", "a").primary_key(["id"]).field("id"),
        ];
        match SchemaRegistry::new(entries).unwrap_err() {
            Error::Schema(e) => assert_eq!(e.kind, SchemaErrorKind::DuplicateRole),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn invalid_identifiers_are_rejected() {
        let entries = vec![SchemaEntry::new("user", "users; drop")
            .primary_key(["id"])
            .field("id")];
        assert!(SchemaRegistry::new(entries).is_err());
    }

    #[test]
    fn inheritance_merges_parent() {
        let entries = vec![
            SchemaEntry::new("person", "people")
                .primary_key(["id"])
                .field("id")
                .field("kind")
                .field("name")
                .discriminator("kind", [("person", "person"), ("admin", "admin")]),
            SchemaEntry::child("admin", "person").field("level"),
        ];
        let registry = SchemaRegistry::new(entries).unwrap();
        let admin = registry.entry("admin").unwrap();
        assert_eq!(admin.table, "people");
        assert_eq!(admin.root_role(), "person");
        assert_eq!(admin.column_of("name"), Some("name"));
        assert_eq!(
            admin.discriminator_value(),
            Some(("kind", &Value::Text("admin".into())))
        );
        assert_eq!(
            registry.variant_for("person", Some(&Value::Text("admin".into()))),
            "admin"
        );
        assert_eq!(registry.variant_for("person", None), "person");
        assert!(registry.descends_from("admin", "person"));
    }

    #[test]
    fn from_json_sets_roles() {
        let json = r#"{
            "user": {"table": "users", "primary_key": ["id"], "columns": {"id": "user_id"},
                     "relations": {"posts": {"kind": "has_many", "target": "post", "load": "eager"}}},
            "post": {"table": "posts", "primary_key": ["id"], "columns": {"id": "id", "user_id": "uid"}}
        }"#;
        let registry = SchemaRegistry::from_json(json).unwrap();
        assert_eq!(registry.describe("user").unwrap().role, "user");
        assert_eq!(registry.roles().count(), 2);
        assert!(matches!(
            SchemaRegistry::from_json("{not json").unwrap_err(),
            Error::Config(_)
        ));
    }
}
