//! entitymap - an identity map and unit-of-work persistence engine.
//!
//! entitymap maps application entities onto table rows and back:
//!
//! - One in-memory instance per persisted identity
//! - Column-level change detection against load-time snapshots
//! - Dependency-ordered writes, including self-referential and mutually
//!   cyclic graphs (broken through nullable references)
//! - Deferred, memoized relation references
//! - Composite keys, renamed columns, embedded value objects and
//!   single-table inheritance
//!
//! Storage is reached through two narrow traits, [`RowSource`] and
//! [`WriteExecutor`]; [`MemoryStore`] implements both.
//!
//! # Quick Start
//!
//! ```ignore
//! use entitymap::prelude::*;
//! use std::sync::Arc;
//!
//! let registry = Arc::new(SchemaRegistry::new([
//!     SchemaEntry::new("user", "users")
//!         .primary_key(["id"])
//!         .field("id")
//!         .field("name")
//!         .relation("posts", RelationDef::has_many("post")),
//!     SchemaEntry::new("post", "posts")
//!         .primary_key(["id"])
//!         .field("id")
//!         .field("user_id")
//!         .field("title"),
//! ])?);
//! let store = MemoryStore::from_registry(&registry);
//! let mut session = Session::new(registry, store);
//!
//! let user = EntityRef::new(Entity::new("user").with("name", "ann"));
//! let post = EntityRef::new(Entity::new("post").with("title", "hello"));
//! user.set_related("posts", Related::many([&post]));
//! session.persist(&user)?;
//! session.run()?;
//!
//! let users = session.select(&Select::new("user").load("posts"))?;
//! ```

pub use entitymap_core::{
    Cardinality, Clause, ConsistencyError, ConsistencyErrorKind, Entity, EntityRef, Error,
    FetchQuery, Order, Reference, ReferenceLoader, Related, Resolved, Result, Row, RowSource,
    SchemaError, SchemaErrorKind, TableRef, TypeError, Value, WriteError, WriteErrorKind,
    WriteExecutor,
};
pub use entitymap_memory::{MemoryStore, Statement, StatementKind};
pub use entitymap_schema::{
    Cast, Discriminator, LoadStrategy, RelationDef, RelationKind, SchemaEntry, SchemaProvider,
    SchemaRegistry, Through,
};
pub use entitymap_session::{
    ChangeSet, FlushResult, Heap, IdentityKey, RelationState, Select, Session, SessionConfig,
    Status, UnitOfWork, UowState,
};

/// Everything needed to declare a schema, open a session and work with entities.
pub mod prelude {
    pub use crate::{
        // Entities
        Entity,
        EntityRef,
        Error,
        // Storage
        MemoryStore,
        Order,
        Reference,
        Related,
        // Schema
        RelationDef,
        Resolved,
        Result,
        SchemaEntry,
        SchemaRegistry,
        // Session
        Select,
        Session,
        SessionConfig,
        Status,
        Through,
        Value,
    };
}
