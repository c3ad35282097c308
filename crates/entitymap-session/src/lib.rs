//! Session and unit of work for entitymap.
//!
//! `entitymap-session` is the **persistence engine**. A [`Session`] owns one
//! identity map ([`Heap`]), reads rows through a [`RowSource`] and writes
//! through a [`WriteExecutor`], using the mapping metadata of a shared
//! [`SchemaRegistry`].
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one in-memory instance per persisted identity.
//! - **Change tracking**: column snapshots diffed at write time.
//! - **Unit of work**: persist/delete requests become a dependency-ordered
//!   command graph; cycles through nullable references are broken with a
//!   deferred key update.
//! - **Loading**: [`Select`] requests hydrate rows through the heap and
//!   attach relations eagerly or as deferred references.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(registry, store);
//!
//! let user = EntityRef::new(Entity::new("user").with("name", "ann"));
//! session.persist(&user)?;
//! let result = session.run()?;
//!
//! let again = session.get("user", [user.get("id")])?;
//! assert!(again.is_some_and(|u| u.ptr_eq(&user)));
//! ```

pub mod changes;
pub mod flush;
pub mod graph;
pub mod heap;
pub mod loader;
pub mod mapper;
pub mod relation;
pub mod resolver;
pub mod unit_of_work;

pub use changes::{diff, values_equal, ChangeSet};
pub use flush::FlushResult;
pub use graph::{Command, CommandGraph, CommandKind, KeyLink, PivotLink};
pub use heap::{Heap, IdentityKey, Node, RelationState, Status};
pub use loader::{Loader, Select};
pub use relation::RelationStrategy;
pub use unit_of_work::{UnitOfWork, UowState};

use entitymap_core::{
    ConfigError, EntityRef, Error, Reference, ReferenceLoader, Related, Resolved, Result, Row,
    RowSource, SchemaErrorKind, Value, WriteExecutor,
};
use entitymap_schema::{SchemaProvider, SchemaRegistry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Session behavior switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Wrap each run in `begin`/`commit` on the write executor.
    pub transactional: bool,
    /// Depth up to which relations declared eager are loaded eagerly.
    /// Explicit `load` directives are not limited.
    pub max_eager_depth: usize,
    /// Drop heap nodes of dropped entities before each run.
    pub prune_on_run: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            transactional: true,
            max_eager_depth: 3,
            prune_on_run: true,
        }
    }
}

impl SessionConfig {
    /// Parse a JSON document; missing keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            Error::Config(ConfigError {
                message: format!("invalid session config: {e}"),
                source: Some(Box::new(e)),
            })
        })
    }
}

/// A unit-of-work scope over one storage backend.
pub struct Session<B> {
    registry: Arc<SchemaRegistry>,
    backend: B,
    heap: Heap,
    uow: UnitOfWork,
    config: SessionConfig,
}

impl<B: RowSource + WriteExecutor> Session<B> {
    pub fn new(registry: Arc<SchemaRegistry>, backend: B) -> Self {
        Self::with_config(registry, backend, SessionConfig::default())
    }

    pub fn with_config(registry: Arc<SchemaRegistry>, backend: B, config: SessionConfig) -> Self {
        Self {
            registry,
            backend,
            heap: Heap::new(),
            uow: UnitOfWork::new(),
            config,
        }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn loader(&mut self) -> Loader<'_> {
        Loader::new(
            &self.registry,
            &mut self.heap,
            &self.backend,
            self.config.max_eager_depth,
        )
    }

    fn check_role(&self, entity: &EntityRef) -> Result<()> {
        let entry = self.registry.describe(&entity.role())?;
        if entry.embeddable {
            return Err(Error::schema(
                SchemaErrorKind::Invalid,
                Some(&entry.role),
                format!("'{}' is embeddable and cannot be written on its own", entry.role),
            ));
        }
        Ok(())
    }

    // ========================================================================
    // Unit of work
    // ========================================================================

    /// Queue `entity` for insert or update on the next [`run`](Self::run).
    pub fn persist(&mut self, entity: &EntityRef) -> Result<()> {
        self.check_role(entity)?;
        self.uow.persist(entity)
    }

    /// Queue `entity` for deletion on the next [`run`](Self::run).
    pub fn delete(&mut self, entity: &EntityRef) -> Result<()> {
        self.check_role(entity)?;
        self.uow.delete(entity)
    }

    /// Queued (persist, delete) request counts.
    pub fn pending(&self) -> (usize, usize) {
        self.uow.pending()
    }

    /// Write all queued changes.
    ///
    /// The queue is consumed whether or not the run succeeds. On failure the
    /// transaction is rolled back and entities are restored to their state
    /// before the run.
    pub fn run(&mut self) -> Result<FlushResult> {
        if self.config.prune_on_run {
            self.heap.prune();
        }
        let mut uow = std::mem::take(&mut self.uow);
        if uow.is_empty() {
            return Ok(FlushResult::default());
        }
        let transactional = self.config.transactional;
        let loader = Loader::new(
            &self.registry,
            &mut self.heap,
            &self.backend,
            self.config.max_eager_depth,
        );
        uow.run(loader, &self.backend, transactional)
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Run a select and hydrate its rows through the heap.
    pub fn select(&mut self, select: &Select) -> Result<Vec<EntityRef>> {
        self.loader().select(select)
    }

    /// Alias of [`select`](Self::select).
    pub fn fetch_all(&mut self, select: &Select) -> Result<Vec<EntityRef>> {
        self.select(select)
    }

    /// First entity of a select, if any.
    pub fn fetch_one(&mut self, select: &Select) -> Result<Option<EntityRef>> {
        let limited = select.clone().limit(1);
        Ok(self.select(&limited)?.into_iter().next())
    }

    /// Rows of a select, without hydration.
    pub fn fetch_rows(&mut self, select: &Select) -> Result<Vec<Row>> {
        self.loader().rows(select)
    }

    /// Entity by primary key. Answers from the heap without a read when the
    /// identity is tracked.
    pub fn get<I, V>(&mut self, role: &str, key: I) -> Result<Option<EntityRef>>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let key: Vec<Value> = key.into_iter().map(Into::into).collect();
        let entry = self.registry.describe(role)?;
        if key.len() == entry.primary_key.len() {
            let identity = IdentityKey::new(entry.root_role(), key.clone());
            if let Some(found) = self.heap.find(&identity) {
                if self.registry.descends_from(&found.role(), role) {
                    tracing::trace!(identity = %identity, "Heap hit");
                    return Ok(Some(found));
                }
            }
        }
        self.fetch_one(&Select::new(role).where_pk(key))
    }

    /// Resolve a deferred reference, reading at most once per reference.
    pub fn resolve(&mut self, reference: &Reference) -> Result<Resolved> {
        let mut loader = self.loader();
        reference.resolve(&mut loader).cloned()
    }

    /// Settle a relation of `entity` in place and return its content.
    ///
    /// Deferred references are resolved; a relation that was never
    /// populated is loaded. Either way the loaded identities become the
    /// relation's persisted baseline.
    pub fn resolve_relation(&mut self, entity: &EntityRef, name: &str) -> Result<Resolved> {
        let role = entity.role();
        self.registry.relation(&role, name)?;
        match entity.related(name) {
            Some(Related::Deferred(reference)) => self.resolve(&reference),
            Some(related) => related
                .current()
                .ok_or_else(|| Error::Custom(format!("relation '{role}.{name}' has no content"))),
            None => {
                let select = Select::new(role.as_str()).load(name);
                self.loader()
                    .populate(std::slice::from_ref(entity), "", 0, Some(&select))?;
                entity
                    .related(name)
                    .and_then(|r| r.current())
                    .ok_or_else(|| Error::Custom(format!("relation '{role}.{name}' was not loaded")))
            }
        }
    }

    // ========================================================================
    // Tracking
    // ========================================================================

    /// Stop tracking `entity`; storage is not touched.
    pub fn detach(&mut self, entity: &EntityRef) -> bool {
        self.heap.detach(entity).is_some()
    }

    /// Forget every tracked entity.
    pub fn clear(&mut self) {
        self.heap.clear();
    }

    pub fn status(&self, entity: &EntityRef) -> Option<Status> {
        self.heap.get(entity).map(Node::status)
    }

    /// Columns of `entity` that differ from its last stored snapshot.
    pub fn changes(&self, entity: &EntityRef) -> Result<ChangeSet> {
        let entry = self.registry.describe(&entity.role())?;
        let current = mapper::to_columns(&self.registry, entry, entity)?;
        let empty = BTreeMap::new();
        let snapshot = self.heap.get(entity).map_or(&empty, Node::snapshot);
        Ok(changes::diff(&current, snapshot))
    }
}

impl<B: RowSource + WriteExecutor> ReferenceLoader for Session<B> {
    fn load_reference(&mut self, reference: &Reference) -> Result<Resolved> {
        self.loader().load_reference(reference)
    }
}
