//! In-memory storage backend for entitymap.
//!
//! [`MemoryStore`] implements both storage traits from `entitymap-core`
//! over plain row vectors. It is the backend the workspace tests run
//! against, and doubles as a reference for what a real driver must do.
//!
//! # Features
//!
//! - Tables derived from a [`SchemaRegistry`](entitymap_schema::SchemaRegistry),
//!   including pivot tables
//! - Unique primary keys (duplicates are write conflicts)
//! - Auto-increment for single-column generated keys
//! - Snapshot transactions with rollback
//! - A statement log for counting reads and writes
//!
//! # Thread Safety
//!
//! All state sits behind one `Mutex`, so a store can be shared between
//! sessions through `&MemoryStore` or `Arc<MemoryStore>`.

pub mod store;

pub use store::{MemoryStore, Statement, StatementKind};
