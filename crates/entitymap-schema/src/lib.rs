//! Schema registry for entitymap.
//!
//! A [`SchemaRegistry`] is the read-only description of every role the
//! engine knows about: where it is stored, how fields map to columns, how
//! values are cast and how roles relate to each other. It is validated once
//! when built and then shared between sessions.
//!
//! ```ignore
//! let registry = SchemaRegistry::new([
//!     SchemaEntry::new("user", "users")
//!         .primary_key(["id"])
//!         .column("id", "user_id")
//!         .field("name")
//!         .relation("posts", RelationDef::has_many("post")),
//!     SchemaEntry::new("post", "posts")
//!         .primary_key(["id"])
//!         .field("id")
//!         .field("user_id"),
//! ])?;
//! ```

pub mod entry;
pub mod registry;
pub mod relation;
pub mod typecast;

pub use entry::{DEFAULT_DATABASE, Discriminator, SchemaEntry};
pub use registry::{SchemaProvider, SchemaRegistry};
pub use relation::{LoadStrategy, RelationDef, RelationKind, Through};
pub use typecast::Cast;
