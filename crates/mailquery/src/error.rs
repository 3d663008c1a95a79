//! Error types for the mailquery crate.

use thiserror::Error;

use crate::materialize::MaterializationError;
use crate::service::{ItemError, TransportError};

/// Errors raised while building, compiling or executing a query.
///
/// Construction-time variants ([`InvalidLookup`](QueryError::InvalidLookup),
/// [`InvalidField`](QueryError::InvalidField)) are returned before any
/// request reaches the service.
#[derive(Debug, Error)]
pub enum QueryError {
    /// A lookup key or operand is malformed or incompatible with its field.
    #[error("invalid lookup '{key}': {reason}")]
    InvalidLookup { key: String, reason: String },

    /// A field path does not resolve against the schema.
    #[error("invalid field '{path}' in {context}")]
    InvalidField { path: String, context: String },

    /// The expression references something neither the server nor the
    /// client-side fallback can evaluate.
    #[error("unsupported filter on '{path}': {reason}")]
    UnsupportedFilter { path: String, reason: String },

    /// `get()` matched nothing.
    #[error("matching query does not exist")]
    DoesNotExist,

    /// `get()` matched more than one record.
    #[error("get() returned more than one item ({count})")]
    MultipleObjectsReturned { count: usize },

    /// A raw record could not be converted.
    #[error(transparent)]
    Materialization(#[from] MaterializationError),

    /// Propagated unmodified from the transport collaborator.
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The restriction could not be written as XML.
    #[error("failed to render restriction: {0}")]
    Render(String),

    /// Index past the end of the result set.
    #[error("index {index} out of range for {len} results")]
    IndexOutOfRange { index: isize, len: usize },

    /// A single record failed during a bulk fetch.
    #[error("item '{id}' failed: {source}")]
    Item {
        id: String,
        #[source]
        source: ItemError,
    },
}

impl QueryError {
    pub(crate) fn invalid_lookup(key: impl Into<String>, reason: impl Into<String>) -> Self {
        QueryError::InvalidLookup {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_field(path: impl Into<String>, context: impl Into<String>) -> Self {
        QueryError::InvalidField {
            path: path.into(),
            context: context.into(),
        }
    }

    pub(crate) fn unsupported(path: impl Into<String>, reason: impl Into<String>) -> Self {
        QueryError::UnsupportedFilter {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` for errors raised before any network activity.
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            QueryError::InvalidLookup { .. } | QueryError::InvalidField { .. }
        )
    }
}

/// Result type for query operations.
///
/// The error defaults to [`QueryError`]; per-record outcomes override it
/// with [`ItemError`].
pub type Result<T, E = QueryError> = std::result::Result<T, E>;
