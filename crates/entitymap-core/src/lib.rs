//! Core types for entitymap.
//!
//! `entitymap-core` holds what every other crate in the workspace agrees on:
//!
//! - [`Value`] and [`Row`] for data exchanged with storage
//! - [`Entity`], [`EntityRef`] and [`Related`] for application objects
//! - [`Reference`] for deferred, memoized relation targets
//! - [`RowSource`] and [`WriteExecutor`], the storage collaborator traits
//! - the [`Error`] taxonomy and [`Result`] alias

pub mod entity;
pub mod error;
pub mod reference;
pub mod row;
pub mod storage;
pub mod value;

pub use entity::{Entity, EntityRef, Related, WeakEntity};
pub use error::{
    ConfigError, ConsistencyError, ConsistencyErrorKind, Error, FetchError, Result, SchemaError,
    SchemaErrorKind, StateError, TypeError, WriteError, WriteErrorKind,
};
pub use reference::{Cardinality, Reference, ReferenceLoader, Resolved, Route};
pub use row::{ColumnInfo, Row};
pub use storage::{Clause, FetchQuery, Order, RowSource, TableRef, WriteExecutor};
pub use value::Value;
