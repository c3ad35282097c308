//! Select pipeline: turns a [`Select`] into row fetches and hydrates the
//! rows through the heap, then attaches relations eagerly or as deferred
//! references.

use crate::heap::{Heap, IdentityKey, RelationState, Status};
use crate::mapper;
use crate::relation::{RelationRef, RelationStrategy};
use entitymap_core::{
    Clause, ConsistencyErrorKind, EntityRef, Error, FetchQuery, Order, Reference,
    ReferenceLoader, Related, Resolved, Result, Row, RowSource, SchemaErrorKind, Value,
};
use entitymap_schema::{LoadStrategy, RelationKind, SchemaEntry, SchemaRegistry};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
enum FieldFilter {
    Eq(String, Value),
    In(String, Vec<Value>),
    IsNull(String),
}

/// A load request for one root role.
///
/// Filters and ordering name entity fields; they are translated to columns
/// when the request runs. Relation directives take dotted paths
/// (`"posts.comments"`); relations without a directive use their declared
/// load strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    role: String,
    pk: Option<Vec<Value>>,
    filters: Vec<FieldFilter>,
    order_by: Vec<(String, Order)>,
    limit: Option<usize>,
    offset: Option<usize>,
    directives: BTreeMap<String, LoadStrategy>,
}

impl Select {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            pk: None,
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            directives: BTreeMap::new(),
        }
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    /// Match a full primary key, components in key order.
    #[must_use]
    pub fn where_pk<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.pk = Some(values.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        let value = value.into();
        let field = field.into();
        self.filters.push(if value.is_null() {
            FieldFilter::IsNull(field)
        } else {
            FieldFilter::Eq(field, value)
        });
        self
    }

    #[must_use]
    pub fn where_in<I, V>(mut self, field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.filters.push(FieldFilter::In(
            field.into(),
            values.into_iter().map(Into::into).collect(),
        ));
        self
    }

    #[must_use]
    pub fn order_by(mut self, field: impl Into<String>, order: Order) -> Self {
        self.order_by.push((field.into(), order));
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Load a relation path eagerly; parents on the path are eager too.
    #[must_use]
    pub fn load(mut self, path: impl Into<String>) -> Self {
        self.directives.insert(path.into(), LoadStrategy::Eager);
        self
    }

    /// Hand a relation path out as deferred references.
    #[must_use]
    pub fn load_lazy(mut self, path: impl Into<String>) -> Self {
        self.directives.insert(path.into(), LoadStrategy::Lazy);
        self
    }

    /// Directive for a relation path, explicit or implied by a deeper eager path.
    pub fn directive(&self, path: &str) -> Option<LoadStrategy> {
        if let Some(strategy) = self.directives.get(path) {
            return Some(*strategy);
        }
        let nested = format!("{path}.");
        self.directives
            .iter()
            .any(|(p, s)| *s == LoadStrategy::Eager && p.starts_with(&nested))
            .then_some(LoadStrategy::Eager)
    }

    /// Translate into a storage query.
    pub fn to_query(&self, registry: &SchemaRegistry) -> Result<FetchQuery> {
        let entry = registry.entry(&self.role)?;
        let mut query = base_query(registry, entry)?;
        let column = |field: &str| -> Result<String> {
            entry.column_of(field).map(str::to_string).ok_or_else(|| {
                Error::schema(
                    SchemaErrorKind::MissingField,
                    Some(&self.role),
                    format!("role '{}' has no field '{field}'", self.role),
                )
            })
        };

        if let Some(values) = &self.pk {
            if values.len() != entry.primary_key.len() {
                return Err(Error::schema(
                    SchemaErrorKind::Invalid,
                    Some(&self.role),
                    format!(
                        "primary key of '{}' has {} components, got {}",
                        self.role,
                        entry.primary_key.len(),
                        values.len()
                    ),
                ));
            }
            for (col, value) in entry.pk_columns().into_iter().zip(values) {
                query.filters.push(Clause::Eq(col, value.clone()));
            }
        }
        for filter in &self.filters {
            query.filters.push(match filter {
                FieldFilter::Eq(f, v) => Clause::Eq(column(f)?, v.clone()),
                FieldFilter::In(f, vs) => Clause::In(column(f)?, vs.clone()),
                FieldFilter::IsNull(f) => Clause::IsNull(column(f)?),
            });
        }
        for (field, order) in &self.order_by {
            query.order_by.push((column(field)?, *order));
        }
        query.limit = self.limit;
        query.offset = self.offset;
        Ok(query)
    }
}

/// Table, scope and inheritance filters every read of a role carries.
pub(crate) fn base_query(registry: &SchemaRegistry, entry: &SchemaEntry) -> Result<FetchQuery> {
    let mut query = FetchQuery::new(entry.table_ref());
    query
        .filters
        .extend(mapper::field_clauses(entry, &entry.scope));
    if entry.parent.is_some() {
        let root = registry.entry(entry.root_role())?;
        if let Some(disc) = &root.discriminator {
            let labels: Vec<Value> = disc
                .variants
                .iter()
                .filter(|(_, variant)| registry.descends_from(variant, &entry.role))
                .map(|(label, _)| root.cast_field(&disc.field, &Value::Text(label.clone())))
                .collect::<Result<_>>()?;
            let column = root.column_of(&disc.field).unwrap_or(&disc.field).to_string();
            query.filters.push(Clause::In(column, labels));
        }
    }
    Ok(query)
}

/// Reads rows and hydrates them through a heap.
pub struct Loader<'s> {
    pub(crate) registry: &'s SchemaRegistry,
    pub(crate) heap: &'s mut Heap,
    pub(crate) source: &'s dyn RowSource,
    max_eager_depth: usize,
}

impl<'s> Loader<'s> {
    pub fn new(
        registry: &'s SchemaRegistry,
        heap: &'s mut Heap,
        source: &'s dyn RowSource,
        max_eager_depth: usize,
    ) -> Self {
        Self {
            registry,
            heap,
            source,
            max_eager_depth,
        }
    }

    /// Run a select: fetch, hydrate, attach relations.
    #[tracing::instrument(level = "debug", skip(self, select), fields(role = %select.role()))]
    pub fn select(&mut self, select: &Select) -> Result<Vec<EntityRef>> {
        let query = select.to_query(self.registry)?;
        let entities = self.fetch(select.role(), &query)?;
        self.populate(&entities, "", 0, Some(select))?;
        tracing::debug!(count = entities.len(), "Select complete");
        Ok(entities)
    }

    /// Fetch rows without hydration.
    pub fn rows(&self, select: &Select) -> Result<Vec<Row>> {
        let query = select.to_query(self.registry)?;
        self.source.fetch(&query)
    }

    /// Fetch `query` and hydrate each row as `role` (or the inheritance
    /// variant its discriminator selects). Relations are not touched.
    pub(crate) fn fetch(&mut self, role: &str, query: &FetchQuery) -> Result<Vec<EntityRef>> {
        let rows = self.source.fetch(query)?;
        tracing::debug!(role, table = %query.table, rows = rows.len(), "Fetched rows");
        rows.iter().map(|row| self.hydrate_row(role, row)).collect()
    }

    fn hydrate_row(&mut self, role: &str, row: &Row) -> Result<EntityRef> {
        let registry = self.registry;
        let entry = registry.entry(role)?;
        let root = registry.entry(entry.root_role())?;
        let discriminator = root
            .discriminator
            .as_ref()
            .and_then(|d| root.column_of(&d.field))
            .and_then(|column| row.get_by_name(column));
        let actual = registry.variant_for(role, discriminator);
        let entry = registry.entry(actual)?;

        let columns = row.to_map();
        let Some(identity) = mapper::identity_from_columns(entry, &columns) else {
            return Err(Error::consistency(
                ConsistencyErrorKind::MissingKey,
                actual,
                None,
                format!("row from '{}' has no primary key value", entry.table),
            ));
        };
        if let Some(existing) = self.heap.find(&identity) {
            tracing::trace!(identity = %identity, "Row resolved from heap");
            return Ok(existing);
        }

        let entity = EntityRef::new(mapper::hydrate(registry, entry, row)?);
        self.heap
            .register(&entity, actual, Some(identity), Status::Managed);
        let snapshot = mapper::to_columns(registry, entry, &entity)?;
        self.heap.sync(&entity, snapshot, Status::Managed);
        Ok(entity)
    }

    /// Attach relations to `entities` that do not have them yet.
    ///
    /// Eager relations are loaded with one batched read per relation and
    /// recurse with `prefix.relation` as the new path; everything else
    /// becomes a deferred reference. Declared eager relations stop at the
    /// configured depth so self-referential graphs terminate.
    pub(crate) fn populate(
        &mut self,
        entities: &[EntityRef],
        prefix: &str,
        depth: usize,
        select: Option<&Select>,
    ) -> Result<()> {
        let registry = self.registry;
        let mut by_role: BTreeMap<String, Vec<EntityRef>> = BTreeMap::new();
        for entity in entities {
            let group = by_role.entry(entity.role()).or_default();
            if !group.iter().any(|e| e.ptr_eq(entity)) {
                group.push(entity.clone());
            }
        }

        for (role, group) in by_role {
            let entry = registry.entry(&role)?;
            for (name, def) in &entry.relations {
                if def.kind == RelationKind::Embedded {
                    continue;
                }
                let path = if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{prefix}.{name}")
                };
                let eager = match select.and_then(|s| s.directive(&path)) {
                    Some(strategy) => strategy == LoadStrategy::Eager,
                    None => def.load == LoadStrategy::Eager && depth < self.max_eager_depth,
                };
                let pending: Vec<EntityRef> = group
                    .iter()
                    .filter(|e| needs_population(e, name, eager))
                    .cloned()
                    .collect();
                if pending.is_empty() {
                    continue;
                }

                let rel = RelationRef {
                    owner: entry,
                    name,
                    def,
                    target: registry.entry(&def.target)?,
                };
                let strategy = RelationStrategy::for_kind(def.kind);
                if eager {
                    let loaded = strategy.load_batch(self, &rel, &pending)?;
                    tracing::debug!(relation = %path, parents = pending.len(), loaded = loaded.len(), "Eager relation loaded");
                    if !loaded.is_empty() {
                        self.populate(&loaded, &path, depth + 1, select)?;
                    }
                } else {
                    for parent in &pending {
                        strategy.defer(self, &rel, parent)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Record the persisted baseline of a relation.
    pub(crate) fn record_baseline(&mut self, parent: &EntityRef, relation: &str, related: &[EntityRef]) {
        let ids = identities(self.registry, related);
        self.heap
            .set_relation_state(parent, relation, RelationState::Known(ids));
    }
}

fn needs_population(entity: &EntityRef, name: &str, eager: bool) -> bool {
    match entity.related(name) {
        None => true,
        Some(Related::Deferred(r)) => eager && !r.is_resolved(),
        Some(_) => false,
    }
}

/// Identities of tracked entities; entities without a complete key are skipped.
pub(crate) fn identities(registry: &SchemaRegistry, entities: &[EntityRef]) -> Vec<IdentityKey> {
    entities
        .iter()
        .filter_map(|e| {
            let entry = registry.entry(&e.role()).ok()?;
            mapper::identity_of(entry, e)
        })
        .collect()
}

impl ReferenceLoader for Loader<'_> {
    #[tracing::instrument(level = "debug", skip(self, reference), fields(target = %reference.target()))]
    fn load_reference(&mut self, reference: &Reference) -> Result<Resolved> {
        let registry = self.registry;
        let resolved = if let Some(route) = reference.route() {
            let owner = registry.entry(&route.source_role)?;
            let def = registry.relation(&route.source_role, &route.relation)?;
            let rel = RelationRef {
                owner,
                name: &route.relation,
                def,
                target: registry.entry(&def.target)?,
            };
            let resolved = RelationStrategy::for_kind(def.kind).resolve(self, &rel, reference)?;
            let source = IdentityKey::new(owner.root_role(), route.source_key.clone());
            if let Some(parent) = self.heap.find(&source) {
                self.record_baseline(&parent, &route.relation, &resolved.entities());
            }
            resolved
        } else {
            let target = registry.entry(reference.target())?;
            crate::relation::resolve_by_scope(self, target, reference)?
        };

        self.populate(&resolved.entities(), "", 0, None)?;
        tracing::debug!(found = resolved.entities().len(), "Reference resolved");
        Ok(resolved)
    }
}
