//! Relation definitions.
//!
//! Keys are always expressed as entity field names:
//!
//! - `inner_key`: fields on the role that declares the relation
//! - `outer_key`: fields on the target role
//!
//! For `belongs_to`/`refers_to` the declaring role holds the foreign key in
//! `inner_key`; for `has_one`/`has_many` the target holds it in `outer_key`.
//! Missing keys are filled in by the registry (see
//! [`SchemaRegistry::new`](crate::SchemaRegistry::new)).

use serde::Deserialize;

/// The shape of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    /// One-to-one, key on the target.
    HasOne,
    /// One-to-many, key on the target.
    HasMany,
    /// Many-to-one, key on the declaring role.
    BelongsTo,
    /// Like `BelongsTo`, but the write may be deferred to break a cycle.
    RefersTo,
    /// Many-to-many through a pivot table or through-entity.
    ManyToMany,
    /// Target fields live in the declaring role's row.
    Embedded,
}

impl RelationKind {
    /// Relations whose value is a collection.
    pub fn is_to_many(self) -> bool {
        matches!(self, RelationKind::HasMany | RelationKind::ManyToMany)
    }

    /// Relations where the declaring role holds the foreign key.
    pub fn holds_key(self) -> bool {
        matches!(self, RelationKind::BelongsTo | RelationKind::RefersTo)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RelationKind::HasOne => "has_one",
            RelationKind::HasMany => "has_many",
            RelationKind::BelongsTo => "belongs_to",
            RelationKind::RefersTo => "refers_to",
            RelationKind::ManyToMany => "many_to_many",
            RelationKind::Embedded => "embedded",
        }
    }
}

/// When related data is read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStrategy {
    /// Loaded together with the owning rows by a batched follow-up read.
    Eager,
    /// Handed out as a deferred reference.
    #[default]
    #[serde(alias = "deferred")]
    Lazy,
}

/// Pivot description for many-to-many relations.
///
/// Either `table` or `role` is given. With `role`, keys name fields of that
/// role; the registry rewrites them into column names and fills in the
/// table, so consumers only ever read `database`, `table` and the columns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Through {
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    /// Through-entity role backing the pivot.
    #[serde(default)]
    pub role: Option<String>,
    /// Pivot columns referencing the declaring role's key.
    #[serde(default)]
    pub inner_key: Vec<String>,
    /// Pivot columns referencing the target's key.
    #[serde(default)]
    pub outer_key: Vec<String>,
}

impl Through {
    /// Pivot backed by a plain table.
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: Some(table.into()),
            ..Self::default()
        }
    }

    /// Pivot backed by a through-entity role.
    pub fn role(role: impl Into<String>) -> Self {
        Self {
            role: Some(role.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn keys<I, O, S, T>(mut self, inner: I, outer: O) -> Self
    where
        I: IntoIterator<Item = S>,
        O: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        self.inner_key = inner.into_iter().map(Into::into).collect();
        self.outer_key = outer.into_iter().map(Into::into).collect();
        self
    }
}

/// A relation declared on a role.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RelationDef {
    pub kind: RelationKind,
    pub target: String,
    #[serde(default)]
    pub inner_key: Vec<String>,
    #[serde(default)]
    pub outer_key: Vec<String>,
    #[serde(default = "default_cascade")]
    pub cascade: bool,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub load: LoadStrategy,
    #[serde(default)]
    pub through: Option<Through>,
}

fn default_cascade() -> bool {
    true
}

impl RelationDef {
    /// New relation with cascade on, not nullable, lazy.
    pub fn new(kind: RelationKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            inner_key: Vec::new(),
            outer_key: Vec::new(),
            cascade: true,
            nullable: false,
            load: LoadStrategy::Lazy,
            through: None,
        }
    }

    pub fn has_one(target: impl Into<String>) -> Self {
        Self::new(RelationKind::HasOne, target)
    }

    pub fn has_many(target: impl Into<String>) -> Self {
        Self::new(RelationKind::HasMany, target)
    }

    pub fn belongs_to(target: impl Into<String>) -> Self {
        Self::new(RelationKind::BelongsTo, target)
    }

    /// Refers-to relations are nullable unless told otherwise.
    pub fn refers_to(target: impl Into<String>) -> Self {
        Self::new(RelationKind::RefersTo, target).nullable(true)
    }

    pub fn many_to_many(target: impl Into<String>, through: Through) -> Self {
        let mut def = Self::new(RelationKind::ManyToMany, target);
        def.through = Some(through);
        def
    }

    pub fn embedded(target: impl Into<String>) -> Self {
        Self::new(RelationKind::Embedded, target)
    }

    #[must_use]
    pub fn inner_key<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner_key = fields.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn outer_key<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outer_key = fields.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn cascade(mut self, cascade: bool) -> Self {
        self.cascade = cascade;
        self
    }

    #[must_use]
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    #[must_use]
    pub fn eager(mut self) -> Self {
        self.load = LoadStrategy::Eager;
        self
    }

    #[must_use]
    pub fn lazy(mut self) -> Self {
        self.load = LoadStrategy::Lazy;
        self
    }

    /// Whether a cycle through this relation can be broken by writing a
    /// null key first and patching it afterwards.
    pub fn is_deferrable(&self) -> bool {
        self.kind == RelationKind::RefersTo && self.nullable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let rel = RelationDef::belongs_to("user");
        assert!(rel.cascade);
        assert!(!rel.nullable);
        assert_eq!(rel.load, LoadStrategy::Lazy);
        assert!(!rel.is_deferrable());

        let rel = RelationDef::refers_to("node").eager();
        assert!(rel.is_deferrable());
        assert_eq!(rel.load, LoadStrategy::Eager);
    }

    #[test]
    fn deferred_is_an_alias_of_lazy() {
        let rel: RelationDef =
            serde_json::from_str(r#"{"kind":"has_many","target":"post","load":"deferred"}"#)
                .unwrap();
        assert_eq!(rel.load, LoadStrategy::Lazy);
        assert_eq!(rel.kind, RelationKind::HasMany);
        assert!(rel.cascade);
    }

    #[test]
    fn kind_predicates() {
        assert!(RelationKind::ManyToMany.is_to_many());
        assert!(!RelationKind::HasOne.is_to_many());
        assert!(RelationKind::RefersTo.holds_key());
        assert!(!RelationKind::HasMany.holds_key());
        assert_eq!(RelationKind::Embedded.as_str(), "embedded");
    }
}
