//! Dynamic entities and shared entity handles.
//!
//! An [`Entity`] is a role name plus named field values and named relation
//! values. Entities are always handled through [`EntityRef`], a shared
//! handle whose pointer identity is the "same instance" notion the identity
//! map guarantees: loading the same row twice yields two `EntityRef`s for
//! which [`EntityRef::ptr_eq`] holds.

use crate::reference::{Reference, Resolved};
use crate::value::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

/// The value held by a relation field.
#[derive(Debug, Clone)]
pub enum Related {
    /// Explicitly no related entity.
    Null,
    /// A single related entity.
    One(EntityRef),
    /// An ordered collection of related entities.
    Many(Vec<EntityRef>),
    /// A not-yet-loaded reference; see [`Reference`].
    Deferred(Reference),
}

impl Related {
    /// Build a `One` from a handle.
    pub fn one(entity: &EntityRef) -> Self {
        Related::One(entity.clone())
    }

    /// Build a `Many` from handles.
    pub fn many<'a, I>(entities: I) -> Self
    where
        I: IntoIterator<Item = &'a EntityRef>,
    {
        Related::Many(entities.into_iter().cloned().collect())
    }

    /// Check for an explicit null.
    pub fn is_null(&self) -> bool {
        matches!(self, Related::Null)
    }

    /// True unless this is an unresolved deferred reference.
    pub fn is_resolved(&self) -> bool {
        match self {
            Related::Deferred(r) => r.is_resolved(),
            _ => true,
        }
    }

    /// The settled content, or `None` while a deferred reference is pending.
    pub fn current(&self) -> Option<Resolved> {
        match self {
            Related::Null => Some(Resolved::One(None)),
            Related::One(e) => Some(Resolved::One(Some(e.clone()))),
            Related::Many(items) => Some(Resolved::Many(items.clone())),
            Related::Deferred(r) => r.get().cloned(),
        }
    }

    /// The single related entity, looking through resolved references.
    pub fn as_one(&self) -> Option<EntityRef> {
        match self.current()? {
            Resolved::One(e) => e,
            Resolved::Many(_) => None,
        }
    }

    /// The related collection, looking through resolved references.
    pub fn as_many(&self) -> Option<Vec<EntityRef>> {
        match self.current()? {
            Resolved::Many(items) => Some(items),
            Resolved::One(_) => None,
        }
    }

    /// The deferred reference, if this relation holds one.
    pub fn reference(&self) -> Option<&Reference> {
        match self {
            Related::Deferred(r) => Some(r),
            _ => None,
        }
    }

    /// Identity comparison against an entity, delegated through references.
    pub fn points_to(&self, entity: &EntityRef) -> bool {
        self.as_one().is_some_and(|e| e.ptr_eq(entity))
    }
}

/// An application object: a role plus field and relation values.
#[derive(Debug, Clone)]
pub struct Entity {
    role: String,
    values: BTreeMap<String, Value>,
    relations: BTreeMap<String, Related>,
    /// Through-entities of many-to-many members, as (member, pivot) pairs.
    pivots: BTreeMap<String, Vec<(EntityRef, EntityRef)>>,
}

impl Entity {
    /// Create an empty entity of the given role.
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            values: BTreeMap::new(),
            relations: BTreeMap::new(),
            pivots: BTreeMap::new(),
        }
    }

    /// Builder-style field assignment.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(field.into(), value.into());
        self
    }

    /// The declared role.
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Change the role; used when inheritance picks a child role on hydration.
    pub fn set_role(&mut self, role: impl Into<String>) {
        self.role = role.into();
    }

    /// Get a field value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    /// Set a field value.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(field.into(), value.into());
    }

    /// All field values.
    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// Get a relation value.
    pub fn relation(&self, name: &str) -> Option<&Related> {
        self.relations.get(name)
    }

    /// Set a relation value.
    pub fn set_relation(&mut self, name: impl Into<String>, related: Related) {
        self.relations.insert(name.into(), related);
    }

    /// Remove a relation value, returning the field to "never loaded".
    pub fn clear_relation(&mut self, name: &str) -> Option<Related> {
        self.relations.remove(name)
    }

    /// All relation values.
    pub fn relations(&self) -> &BTreeMap<String, Related> {
        &self.relations
    }

    /// Through-entity linking this entity to `member` over `relation`.
    pub fn pivot(&self, relation: &str, member: &EntityRef) -> Option<&EntityRef> {
        self.pivots
            .get(relation)?
            .iter()
            .find(|(m, _)| m.ptr_eq(member))
            .map(|(_, pivot)| pivot)
    }

    /// Attach the through-entity for `member`, replacing any previous one.
    pub fn set_pivot(&mut self, relation: impl Into<String>, member: &EntityRef, pivot: EntityRef) {
        let pairs = self.pivots.entry(relation.into()).or_default();
        pairs.retain(|(m, _)| !m.ptr_eq(member));
        pairs.push((member.clone(), pivot));
    }

    /// All (member, through-entity) pairs of `relation`.
    pub fn pivots(&self, relation: &str) -> &[(EntityRef, EntityRef)] {
        self.pivots.get(relation).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Shared handle to an [`Entity`].
///
/// Equality and hashing are by pointer: two handles are equal only when
/// they refer to the same instance.
#[derive(Clone)]
pub struct EntityRef(Arc<RwLock<Entity>>);

impl EntityRef {
    /// Wrap a new entity.
    pub fn new(entity: Entity) -> Self {
        Self(Arc::new(RwLock::new(entity)))
    }

    /// Read guard. Do not hold it across calls into the session.
    pub fn read(&self) -> RwLockReadGuard<'_, Entity> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write guard. Do not hold it across calls into the session.
    pub fn write(&self) -> RwLockWriteGuard<'_, Entity> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// The entity's role.
    pub fn role(&self) -> String {
        self.read().role().to_string()
    }

    /// Field value, `Null` when unset.
    pub fn get(&self, field: &str) -> Value {
        self.read().get(field).cloned().unwrap_or(Value::Null)
    }

    /// Set a field value.
    pub fn set(&self, field: impl Into<String>, value: impl Into<Value>) {
        self.write().set(field, value);
    }

    /// Relation value, `None` when the relation was never populated.
    pub fn related(&self, name: &str) -> Option<Related> {
        self.read().relation(name).cloned()
    }

    /// Set a relation value.
    pub fn set_related(&self, name: impl Into<String>, related: Related) {
        self.write().set_relation(name, related);
    }

    /// Append to a to-many relation, materializing resolved references.
    pub fn push_related(&self, name: &str, item: &EntityRef) {
        let mut items = self
            .related(name)
            .and_then(|r| r.as_many())
            .unwrap_or_default();
        items.push(item.clone());
        self.set_related(name, Related::Many(items));
    }

    /// Remove an entity from a to-many relation.
    pub fn remove_related(&self, name: &str, item: &EntityRef) {
        if let Some(mut items) = self.related(name).and_then(|r| r.as_many()) {
            items.retain(|e| !e.ptr_eq(item));
            self.set_related(name, Related::Many(items));
        }
    }

    /// Through-entity linking this entity to `member`.
    pub fn pivot(&self, relation: &str, member: &EntityRef) -> Option<EntityRef> {
        self.read().pivot(relation, member).cloned()
    }

    /// Attach a through-entity carrying the pivot row's own fields.
    pub fn set_pivot(&self, relation: impl Into<String>, member: &EntityRef, pivot: &EntityRef) {
        self.write().set_pivot(relation, member, pivot.clone());
    }

    /// Pointer identity.
    pub fn ptr_eq(&self, other: &EntityRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Stable address of the shared allocation, used as a tracking key.
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    /// Non-owning handle.
    pub fn downgrade(&self) -> WeakEntity {
        WeakEntity(Arc::downgrade(&self.0))
    }
}

impl PartialEq for EntityRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for EntityRef {}

impl std::hash::Hash for EntityRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for EntityRef {
    // Shallow on purpose: entity graphs may be cyclic.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_read() {
            Ok(entity) => write!(f, "EntityRef({}@{:#x})", entity.role(), self.addr()),
            Err(_) => write!(f, "EntityRef(<locked>@{:#x})", self.addr()),
        }
    }
}

impl From<Entity> for EntityRef {
    fn from(entity: Entity) -> Self {
        EntityRef::new(entity)
    }
}

/// Non-owning entity handle held by the identity map.
#[derive(Clone, Default)]
pub struct WeakEntity(Weak<RwLock<Entity>>);

impl WeakEntity {
    /// Upgrade to a strong handle if the entity is still alive.
    pub fn upgrade(&self) -> Option<EntityRef> {
        self.0.upgrade().map(EntityRef)
    }

    /// Whether the entity has been dropped.
    pub fn is_dead(&self) -> bool {
        self.0.strong_count() == 0
    }
}

impl fmt::Debug for WeakEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(e) => write!(f, "Weak({e:?})"),
            None => write!(f, "Weak(<dropped>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_compare_by_pointer() {
        let a = EntityRef::new(Entity::new("user").with("name", "ann"));
        let b = EntityRef::new(Entity::new("user").with("name", "ann"));
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn field_access_and_relations() {
        let user = EntityRef::new(Entity::new("user").with("id", 1_i64));
        assert_eq!(user.get("id"), Value::BigInt(1));
        assert_eq!(user.get("missing"), Value::Null);
        assert!(user.related("posts").is_none());

        let post = EntityRef::new(Entity::new("post"));
        user.push_related("posts", &post);
        let posts = user.related("posts").and_then(|r| r.as_many()).unwrap();
        assert_eq!(posts.len(), 1);
        assert!(posts[0].ptr_eq(&post));

        user.remove_related("posts", &post);
        let posts = user.related("posts").and_then(|r| r.as_many()).unwrap();
        assert!(posts.is_empty());
    }

    #[test]
    fn self_reference_debug_does_not_recurse() {
        let node = EntityRef::new(Entity::new("node"));
        node.set_related("parent", Related::one(&node));
        let rendered = format!("{:?}", node.read().relation("parent"));
        assert!(rendered.contains("EntityRef(node@"));
        assert!(node.related("parent").unwrap().points_to(&node));
    }

    #[test]
    fn pivots_are_kept_per_member() {
        let user = EntityRef::new(Entity::new("user"));
        let tag = EntityRef::new(Entity::new("tag"));
        let first = EntityRef::new(Entity::new("user_tag").with("since", 2020_i64));
        let second = EntityRef::new(Entity::new("user_tag").with("since", 2024_i64));
        assert!(user.pivot("tags", &tag).is_none());

        user.set_pivot("tags", &tag, &first);
        user.set_pivot("tags", &tag, &second);
        assert!(user.pivot("tags", &tag).unwrap().ptr_eq(&second));
        assert_eq!(user.read().pivots("tags").len(), 1);
        assert!(user.read().pivots("other").is_empty());
    }

    #[test]
    fn weak_handle_dies_with_entity() {
        let weak = {
            let e = EntityRef::new(Entity::new("tmp"));
            let w = e.downgrade();
            assert!(w.upgrade().is_some());
            w
        };
        assert!(weak.is_dead());
        assert!(weak.upgrade().is_none());
    }
}
