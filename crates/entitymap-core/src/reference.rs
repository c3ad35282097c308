//! Deferred references to related entities.
//!
//! A [`Reference`] names what a relation points at (target role plus a
//! field scope) without loading it. The first successful [`Reference::resolve`]
//! stores the outcome; later calls return the stored value without touching
//! storage.

use crate::entity::EntityRef;
use crate::value::Value;
use crate::Result;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// How many entities a reference resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cardinality {
    /// Zero or one entity.
    One,
    /// An ordered collection.
    Many,
}

/// The outcome of resolving a reference.
#[derive(Debug, Clone)]
pub enum Resolved {
    /// A single entity, or none.
    One(Option<EntityRef>),
    /// A collection, possibly empty.
    Many(Vec<EntityRef>),
}

impl Resolved {
    /// Entities contained in the outcome, in order.
    pub fn entities(&self) -> Vec<EntityRef> {
        match self {
            Resolved::One(e) => e.iter().cloned().collect(),
            Resolved::Many(items) => items.clone(),
        }
    }
}

/// Where a reference came from: the owning entity and relation.
///
/// Needed to resolve many-to-many references through their pivot, and lets
/// the loader record what it found as the relation's persisted baseline.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    /// Role owning the relation.
    pub source_role: String,
    /// Relation name on the source role.
    pub relation: String,
    /// Primary-key values of the owning entity, in key order.
    pub source_key: Vec<Value>,
}

/// Loads the entities a [`Reference`] points at.
///
/// Implemented by the session; tests may provide a counting stub.
pub trait ReferenceLoader {
    /// Load the target(s) of `reference`. Must not call `resolve` on the
    /// same reference.
    fn load_reference(&mut self, reference: &Reference) -> Result<Resolved>;
}

struct Inner {
    target: String,
    scope: BTreeMap<String, Value>,
    cardinality: Cardinality,
    route: Option<Route>,
    resolved: OnceLock<Resolved>,
}

/// A lazily resolved, memoized handle to related entities.
///
/// Clones share the memoized result.
#[derive(Clone)]
pub struct Reference(Arc<Inner>);

impl Reference {
    /// Create an unresolved reference.
    pub fn new(
        target: impl Into<String>,
        scope: BTreeMap<String, Value>,
        cardinality: Cardinality,
    ) -> Self {
        Self(Arc::new(Inner {
            target: target.into(),
            scope,
            cardinality,
            route: None,
            resolved: OnceLock::new(),
        }))
    }

    /// Create an unresolved reference that remembers its owning relation.
    pub fn routed(
        target: impl Into<String>,
        scope: BTreeMap<String, Value>,
        cardinality: Cardinality,
        route: Route,
    ) -> Self {
        Self(Arc::new(Inner {
            target: target.into(),
            scope,
            cardinality,
            route: Some(route),
            resolved: OnceLock::new(),
        }))
    }

    /// Create a reference that is already resolved.
    pub fn ready(
        target: impl Into<String>,
        scope: BTreeMap<String, Value>,
        resolved: Resolved,
    ) -> Self {
        let cardinality = match resolved {
            Resolved::One(_) => Cardinality::One,
            Resolved::Many(_) => Cardinality::Many,
        };
        let reference = Self::new(target, scope, cardinality);
        let _ = reference.0.resolved.set(resolved);
        reference
    }

    /// Target role.
    pub fn target(&self) -> &str {
        &self.0.target
    }

    /// Field scope identifying the target(s); available without a read.
    pub fn scope(&self) -> &BTreeMap<String, Value> {
        &self.0.scope
    }

    /// Cardinality of the relation.
    pub fn cardinality(&self) -> Cardinality {
        self.0.cardinality
    }

    /// Owning relation, when known.
    pub fn route(&self) -> Option<&Route> {
        self.0.route.as_ref()
    }

    /// Whether the reference has been resolved.
    pub fn is_resolved(&self) -> bool {
        self.0.resolved.get().is_some()
    }

    /// The memoized outcome, if resolved.
    pub fn get(&self) -> Option<&Resolved> {
        self.0.resolved.get()
    }

    /// Resolve through `loader` at most once.
    ///
    /// A failed load leaves the reference unresolved so it can be retried.
    pub fn resolve<L>(&self, loader: &mut L) -> Result<&Resolved>
    where
        L: ReferenceLoader + ?Sized,
    {
        if let Some(done) = self.0.resolved.get() {
            tracing::trace!(target_role = %self.0.target, "reference already resolved");
            return Ok(done);
        }
        let loaded = loader.load_reference(self)?;
        Ok(self.0.resolved.get_or_init(|| loaded))
    }

    /// Record an outcome obtained elsewhere. Returns false if already resolved.
    pub fn bind(&self, resolved: Resolved) -> bool {
        self.0.resolved.set(resolved).is_ok()
    }

    /// Whether the resolved single target is `entity`.
    pub fn points_to(&self, entity: &EntityRef) -> bool {
        matches!(self.get(), Some(Resolved::One(Some(e))) if e.ptr_eq(entity))
    }
}

impl PartialEq for Reference {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.0, &other.0) {
            return true;
        }
        match (self.get(), other.get()) {
            (Some(Resolved::One(Some(a))), Some(Resolved::One(Some(b)))) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reference")
            .field("target", &self.0.target)
            .field("scope", &self.0.scope)
            .field("cardinality", &self.0.cardinality)
            .field("resolved", &self.0.resolved.get())
            .finish()
    }
}
