//! Error types for the loading pipeline
//!
//! Build-time errors (mapping problems, runaway plans) are raised before any
//! statement is issued. Row-level errors abort the row or batch being
//! assembled. Cascade failures carry the path that led to the failing element.

use thiserror::Error;

use crate::cascade::CascadeAction;

/// Result type alias for loader operations
pub type LoadResult<T> = Result<T, LoadError>;

/// Error types for entity loading and assembly
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    /// The mapping cannot be turned into a fetch plan
    #[error("Mapping inconsistency in '{entity}': {message}")]
    MappingInconsistency { entity: String, message: String },

    /// A single-row load matched more than one logical row
    #[error("More than one row matched a unique load of '{entity}': {detail}")]
    NonUniqueResult { entity: String, detail: String },

    /// A required reference points at a row that does not exist
    #[error("No row of '{entity}' found for id {id}")]
    EntityNotFound { entity: String, id: String },

    /// Lock acquisition or version check failed
    #[error("Concurrency failure on '{entity}' (id {id}): {reason}")]
    ConcurrencyFailure {
        entity: String,
        id: String,
        reason: String,
    },

    /// Recursion or growth limit exceeded, usually a cyclic mapping
    #[error("Overflow guard tripped: {0}")]
    OverflowGuard(String),

    /// A different, fully initialized instance already owns this identity
    #[error("Identity conflict: {key} is already registered with different state")]
    IdentityConflict { key: String },

    /// Cascading an action to an associated element failed
    #[error("Cascade of {action} failed at {owner}.{association} -> {element} (path: {path}): {source}")]
    Cascade {
        action: CascadeAction,
        owner: String,
        association: String,
        element: String,
        path: String,
        #[source]
        source: Box<LoadError>,
    },

    /// Identifier columns could not be converted into a key
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Column access failed on a result row
    #[error("Column error: {0}")]
    Column(String),

    /// Loader configuration or request is invalid
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Error reported by the statement executor
    #[error("Database error: {0}")]
    Database(String),

    /// The entity handle does not belong to this unit of work
    #[error("Unknown entity instance: {0}")]
    UnknownInstance(String),
}

impl LoadError {
    pub(crate) fn mapping(entity: impl Into<String>, message: impl Into<String>) -> Self {
        LoadError::MappingInconsistency {
            entity: entity.into(),
            message: message.into(),
        }
    }

    pub(crate) fn concurrency(
        entity: impl Into<String>,
        id: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        LoadError::ConcurrencyFailure {
            entity: entity.into(),
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    /// Lock or serialization failure seen by a backend, before it is tied to
    /// the entity the statement was reading
    pub fn lock_unavailable(reason: impl Into<String>) -> Self {
        Self::concurrency(String::new(), String::new(), reason)
    }

    /// Tie a backend concurrency failure to the entity being read
    pub(crate) fn attributed(self, entity: &str, id: &str) -> Self {
        match self {
            LoadError::ConcurrencyFailure {
                entity: unknown,
                reason,
                ..
            } if unknown.is_empty() => Self::concurrency(entity, id, reason),
            other => other,
        }
    }

    /// Whether a higher layer may retry the whole unit of work
    pub fn is_retryable(&self) -> bool {
        match self {
            LoadError::ConcurrencyFailure { .. } => true,
            LoadError::Cascade { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Whether this error is raised while building a plan, before any I/O
    pub fn is_build_time(&self) -> bool {
        matches!(
            self,
            LoadError::MappingInconsistency { .. } | LoadError::OverflowGuard(_)
        )
    }

    /// The innermost error, looking through cascade wrappers
    pub fn root_cause(&self) -> &LoadError {
        match self {
            LoadError::Cascade { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for LoadError {
    fn from(err: serde_json::Error) -> Self {
        LoadError::Column(format!("JSON conversion failed: {}", err))
    }
}
