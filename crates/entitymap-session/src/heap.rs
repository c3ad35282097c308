//! Identity map ("heap") for tracked entity instances.
//!
//! The heap keeps one [`Node`] per entity instance a session knows about,
//! and maps each persisted identity to at most one live instance. This is
//! what makes two reads of the same row hand back the same [`EntityRef`].
//!
//! # Design
//!
//! Nodes hold a [`WeakEntity`], so the heap never keeps an entity alive on
//! its own. Nodes are keyed by the address of the entity allocation; every
//! lookup re-checks the weak handle, so an address reused after the entity
//! was dropped is never mistaken for the old instance.

use entitymap_core::{EntityRef, Value, WeakEntity};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identity of a persisted entity: root role plus primary-key tuple.
///
/// Values are stored in key form, so `Int(1)` and `BigInt(1)` name the same
/// identity. Composite keys compare component by component.
#[derive(Debug, Clone)]
pub struct IdentityKey {
    root: String,
    values: Vec<Value>,
}

impl IdentityKey {
    pub fn new(root: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            root: root.into(),
            values: values.iter().map(Value::key_form).collect(),
        }
    }

    /// Root role of the hierarchy the identity belongs to.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Primary-key values in key order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

impl PartialEq for IdentityKey {
    fn eq(&self, other: &Self) -> bool {
        self.root == other.root && self.values == other.values
    }
}

impl Eq for IdentityKey {}

impl Hash for IdentityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.root.hash(state);
        for v in &self.values {
            v.hash_into(state);
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.root)?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ")")
    }
}

/// Lifecycle status of a tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Not yet persisted.
    New,
    /// Queued for insert in the running unit of work.
    ScheduledInsert,
    /// Persisted; snapshot is current.
    Managed,
    /// Persisted and queued for update.
    ScheduledUpdate,
    /// Persisted and queued for delete.
    ScheduledDelete,
}

impl Status {
    /// Whether a row for the entity exists in storage.
    pub fn is_persisted(self) -> bool {
        matches!(
            self,
            Status::Managed | Status::ScheduledUpdate | Status::ScheduledDelete
        )
    }
}

/// Persisted baseline of a relation, used to find removed members.
#[derive(Debug, Clone, PartialEq)]
pub enum RelationState {
    /// Identities last known to be related in storage.
    Known(Vec<IdentityKey>),
    /// Handed out as an unresolved deferred reference; baseline unknown.
    Pending,
}

/// Tracking record for one entity instance.
#[derive(Debug, Clone)]
pub struct Node {
    entity: WeakEntity,
    role: String,
    identity: Option<IdentityKey>,
    status: Status,
    snapshot: BTreeMap<String, Value>,
    relations: BTreeMap<String, RelationState>,
}

impl Node {
    /// The tracked entity, if still alive.
    pub fn entity(&self) -> Option<EntityRef> {
        self.entity.upgrade()
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn identity(&self) -> Option<&IdentityKey> {
        self.identity.as_ref()
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Column values last read from or written to storage.
    pub fn snapshot(&self) -> &BTreeMap<String, Value> {
        &self.snapshot
    }

    pub fn relation_state(&self, name: &str) -> Option<&RelationState> {
        self.relations.get(name)
    }
}

/// The identity map of one session.
#[derive(Debug, Default)]
pub struct Heap {
    nodes: HashMap<usize, Node>,
    identities: HashMap<IdentityKey, usize>,
}

impl Heap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `entity`.
    ///
    /// Idempotent by identity: when a live instance is already registered
    /// under `identity`, that instance is returned and `entity` is ignored.
    /// Otherwise `entity` itself is returned.
    #[tracing::instrument(level = "trace", skip(self, entity))]
    pub fn register(
        &mut self,
        entity: &EntityRef,
        role: &str,
        identity: Option<IdentityKey>,
        status: Status,
    ) -> EntityRef {
        if let Some(id) = &identity {
            if let Some(existing) = self.find(id) {
                tracing::trace!(identity = %id, "Identity already tracked");
                return existing;
            }
        }
        let addr = entity.addr();
        if let Some(id) = &identity {
            self.identities.insert(id.clone(), addr);
        }
        self.nodes.insert(
            addr,
            Node {
                entity: entity.downgrade(),
                role: role.to_string(),
                identity,
                status,
                snapshot: BTreeMap::new(),
                relations: BTreeMap::new(),
            },
        );
        entity.clone()
    }

    /// Whether `entity` is tracked.
    pub fn has(&self, entity: &EntityRef) -> bool {
        self.get(entity).is_some()
    }

    /// Node for `entity`.
    pub fn get(&self, entity: &EntityRef) -> Option<&Node> {
        self.nodes
            .get(&entity.addr())
            .filter(|node| node.entity().is_some_and(|e| e.ptr_eq(entity)))
    }

    fn get_mut(&mut self, entity: &EntityRef) -> Option<&mut Node> {
        self.nodes
            .get_mut(&entity.addr())
            .filter(|node| node.entity().is_some_and(|e| e.ptr_eq(entity)))
    }

    /// Live instance registered under `identity`.
    pub fn find(&self, identity: &IdentityKey) -> Option<EntityRef> {
        let addr = self.identities.get(identity)?;
        let node = self.nodes.get(addr)?;
        if node.identity.as_ref() != Some(identity) {
            return None;
        }
        node.entity()
    }

    /// Stop tracking `entity`. Storage is not touched.
    pub fn detach(&mut self, entity: &EntityRef) -> Option<Node> {
        self.get(entity)?;
        let node = self.nodes.remove(&entity.addr())?;
        if let Some(id) = &node.identity {
            if self.identities.get(id) == Some(&entity.addr()) {
                self.identities.remove(id);
            }
        }
        Some(node)
    }

    /// Whether `entity` has a row in storage.
    pub fn is_persisted(&self, entity: &EntityRef) -> bool {
        self.get(entity).is_some_and(|n| n.status.is_persisted())
    }

    /// Record the identity of a tracked entity, e.g. after its key was generated.
    pub fn set_identity(&mut self, entity: &EntityRef, identity: IdentityKey) {
        let addr = entity.addr();
        let Some(node) = self.get_mut(entity) else {
            return;
        };
        let previous = node.identity.replace(identity.clone());
        if let Some(old) = previous {
            if old != identity && self.identities.get(&old) == Some(&addr) {
                self.identities.remove(&old);
            }
        }
        self.identities.insert(identity, addr);
    }

    pub fn set_status(&mut self, entity: &EntityRef, status: Status) {
        if let Some(node) = self.get_mut(entity) {
            node.status = status;
        }
    }

    /// Replace snapshot and status together, after a successful read or commit.
    pub fn sync(&mut self, entity: &EntityRef, snapshot: BTreeMap<String, Value>, status: Status) {
        if let Some(node) = self.get_mut(entity) {
            node.snapshot = snapshot;
            node.status = status;
        }
    }

    pub fn set_relation_state(&mut self, entity: &EntityRef, name: &str, state: RelationState) {
        if let Some(node) = self.get_mut(entity) {
            node.relations.insert(name.to_string(), state);
        }
    }

    /// Drop nodes whose entity no longer exists. Returns how many were removed.
    pub fn prune(&mut self) -> usize {
        let before = self.nodes.len();
        self.nodes.retain(|_, node| !node.entity.is_dead());
        let nodes = &self.nodes;
        self.identities.retain(|_, addr| nodes.contains_key(addr));
        let removed = before - self.nodes.len();
        if removed > 0 {
            tracing::debug!(removed, "Pruned dead heap nodes");
        }
        removed
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.identities.clear();
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entitymap_core::Entity;

    fn user(id: i64) -> EntityRef {
        EntityRef::new(Entity::new("user").with("id", id))
    }

    fn key(id: i64) -> IdentityKey {
        IdentityKey::new("user", vec![Value::BigInt(id)])
    }

    #[test]
    fn register_is_idempotent_by_identity() {
        let mut heap = Heap::new();
        let first = user(1);
        let got = heap.register(&first, "user", Some(key(1)), Status::Managed);
        assert!(got.ptr_eq(&first));

        let second = user(1);
        let got = heap.register(&second, "user", Some(key(1)), Status::Managed);
        assert!(got.ptr_eq(&first));
        assert!(!heap.has(&second));
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn key_form_makes_integer_widths_equal() {
        let mut heap = Heap::new();
        let e = user(7);
        heap.register(&e, "user", Some(key(7)), Status::Managed);
        let narrow = IdentityKey::new("user", vec![Value::Int(7)]);
        assert!(heap.find(&narrow).unwrap().ptr_eq(&e));
    }

    #[test]
    fn composite_keys_need_every_component() {
        let a = IdentityKey::new("m", vec![Value::BigInt(1), Value::BigInt(2)]);
        let b = IdentityKey::new("m", vec![Value::BigInt(1), Value::BigInt(3)]);
        let c = IdentityKey::new("m", vec![Value::Int(1), Value::Int(2)]);
        assert_ne!(a, b);
        assert_eq!(a, c);
        assert_eq!(a.to_string(), "m(1, 2)");
    }

    #[test]
    fn detach_and_prune() {
        let mut heap = Heap::new();
        let kept = user(1);
        heap.register(&kept, "user", Some(key(1)), Status::Managed);
        {
            let dropped = user(2);
            heap.register(&dropped, "user", Some(key(2)), Status::Managed);
        }
        assert_eq!(heap.len(), 2);
        assert!(heap.find(&key(2)).is_none());
        assert_eq!(heap.prune(), 1);

        let node = heap.detach(&kept).unwrap();
        assert_eq!(node.role(), "user");
        assert!(heap.find(&key(1)).is_none());
        assert!(heap.is_empty());
    }

    #[test]
    fn set_identity_and_sync() {
        let mut heap = Heap::new();
        let e = EntityRef::new(Entity::new("user"));
        heap.register(&e, "user", None, Status::New);
        assert!(!heap.is_persisted(&e));

        heap.set_identity(&e, key(9));
        let snapshot = BTreeMap::from([("id".to_string(), Value::BigInt(9))]);
        heap.sync(&e, snapshot.clone(), Status::Managed);
        heap.set_relation_state(&e, "posts", RelationState::Pending);

        let node = heap.get(&e).unwrap();
        assert_eq!(node.snapshot(), &snapshot);
        assert_eq!(node.status(), Status::Managed);
        assert_eq!(node.relation_state("posts"), Some(&RelationState::Pending));
        assert!(heap.find(&key(9)).unwrap().ptr_eq(&e));
    }
}
