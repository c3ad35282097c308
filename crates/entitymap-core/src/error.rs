//! Error types for entitymap operations.

use std::fmt;

/// The primary error type for all entitymap operations.
#[derive(Debug)]
pub enum Error {
    /// Schema/mapping errors (undefined role, relation or field)
    Schema(SchemaError),
    /// Row source failures while reading
    Fetch(FetchError),
    /// Write executor failures, including duplicate identities
    Write(WriteError),
    /// Graph or reference consistency errors detected at run time
    Consistency(ConsistencyError),
    /// Type conversion / cast errors
    Type(TypeError),
    /// Unit-of-work lifecycle misuse
    State(StateError),
    /// Configuration errors
    Config(ConfigError),
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    pub role: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    /// Role is not registered
    UndefinedRole,
    /// Relation name is not defined on the role
    UndefinedRelation,
    /// A primary key, relation key or discriminator names an unmapped field
    MissingField,
    /// Role registered twice
    DuplicateRole,
    /// Any other invalid definition
    Invalid,
}

#[derive(Debug)]
pub struct FetchError {
    pub table: String,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct WriteError {
    pub kind: WriteErrorKind,
    pub table: String,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteErrorKind {
    /// Duplicate identity / unique key violation
    Conflict,
    /// Transaction control failed (begin/commit/rollback)
    Transaction,
    /// Any other executor failure
    Failed,
}

#[derive(Debug)]
pub struct ConsistencyError {
    pub kind: ConsistencyErrorKind,
    pub role: String,
    pub relation: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyErrorKind {
    /// A non-nullable relation has no target at write time
    NullReference,
    /// A dependency cycle contains no deferrable edge
    UnresolvableCycle,
    /// A related entity is not persisted and cascade is disabled
    NotPersisted,
    /// A key value needed for a write is missing
    MissingKey,
    /// The stored row disappeared or an update/delete touched nothing
    StaleEntity,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub field: Option<String>,
}

impl TypeError {
    /// Build a type error without field context.
    pub fn new(expected: &'static str, actual: impl Into<String>) -> Self {
        Self {
            expected,
            actual: actual.into(),
            field: None,
        }
    }

    /// Attach the field that failed to convert.
    #[must_use]
    pub fn field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

#[derive(Debug)]
pub struct StateError {
    pub message: String,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Shorthand for a schema error.
    pub fn schema(
        kind: SchemaErrorKind,
        role: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Error::Schema(SchemaError {
            kind,
            role: role.map(str::to_string),
            message: message.into(),
        })
    }

    /// Shorthand for an undefined-role schema error.
    pub fn undefined_role(role: &str) -> Self {
        Self::schema(
            SchemaErrorKind::UndefinedRole,
            Some(role),
            format!("undefined role '{role}'"),
        )
    }

    /// Shorthand for an undefined-relation schema error.
    pub fn undefined_relation(role: &str, relation: &str) -> Self {
        Self::schema(
            SchemaErrorKind::UndefinedRelation,
            Some(role),
            format!("role '{role}' has no relation '{relation}'"),
        )
    }

    /// Shorthand for a consistency error.
    pub fn consistency(
        kind: ConsistencyErrorKind,
        role: &str,
        relation: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Error::Consistency(ConsistencyError {
            kind,
            role: role.to_string(),
            relation: relation.map(str::to_string),
            message: message.into(),
        })
    }

    /// Shorthand for a write error without a source.
    pub fn write(kind: WriteErrorKind, table: &str, message: impl Into<String>) -> Self {
        Error::Write(WriteError {
            kind,
            table: table.to_string(),
            message: message.into(),
            source: None,
        })
    }

    /// Is this a duplicate-identity write conflict?
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Write(w) if w.kind == WriteErrorKind::Conflict)
    }

    /// Is this a schema error raised while resolving metadata?
    pub fn is_schema(&self) -> bool {
        matches!(self, Error::Schema(_))
    }

    /// Kind of consistency error, if this is one.
    pub fn consistency_kind(&self) -> Option<ConsistencyErrorKind> {
        match self {
            Error::Consistency(c) => Some(c.kind),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Schema(e) => write!(f, "Schema error: {e}"),
            Error::Fetch(e) => write!(f, "Fetch error on '{}': {}", e.table, e.message),
            Error::Write(e) => write!(f, "Write error on '{}': {}", e.table, e.message),
            Error::Consistency(e) => write!(f, "Consistency error: {e}"),
            Error::Type(e) => write!(f, "Type error: {e}"),
            Error::State(e) => write!(f, "State error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Serde(msg) => write!(f, "Serialization error: {msg}"),
            Error::Custom(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Fetch(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Write(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConsistencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.relation {
            Some(rel) => write!(f, "{}.{}: {}", self.role, rel, self.message),
            None => write!(f, "{}: {}", self.role, self.message),
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(field) = &self.field {
            write!(
                f,
                "expected {} for field '{}', found {}",
                self.expected, field, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl From<SchemaError> for Error {
    fn from(err: SchemaError) -> Self {
        Error::Schema(err)
    }
}

impl From<FetchError> for Error {
    fn from(err: FetchError) -> Self {
        Error::Fetch(err)
    }
}

impl From<WriteError> for Error {
    fn from(err: WriteError) -> Self {
        Error::Write(err)
    }
}

impl From<ConsistencyError> for Error {
    fn from(err: ConsistencyError) -> Self {
        Error::Consistency(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<StateError> for Error {
    fn from(err: StateError) -> Self {
        Error::State(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for entitymap operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_helper() {
        let err = Error::write(WriteErrorKind::Conflict, "users", "duplicate key (1)");
        assert!(err.is_conflict());
        assert!(!err.is_schema());
        assert_eq!(err.to_string(), "Write error on 'users': duplicate key (1)");
    }

    #[test]
    fn consistency_display_includes_relation() {
        let err = Error::consistency(
            ConsistencyErrorKind::NullReference,
            "post",
            Some("author"),
            "relation is not nullable",
        );
        assert_eq!(
            err.consistency_kind(),
            Some(ConsistencyErrorKind::NullReference)
        );
        assert_eq!(
            err.to_string(),
            "Consistency error: post.author: relation is not nullable"
        );
    }

    #[test]
    fn schema_helpers() {
        let err = Error::undefined_relation("user", "posts");
        match err {
            Error::Schema(e) => {
                assert_eq!(e.kind, SchemaErrorKind::UndefinedRelation);
                assert_eq!(e.role.as_deref(), Some("user"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
