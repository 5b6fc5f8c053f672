//! Error types for query parsing and evaluation.

use thiserror::Error;

use crate::Error;
use crate::store::StoreError;

/// Structured errors from the query engine.
///
/// Parse-shaped problems surface client-side before a script is sent;
/// the rest come back from evaluation inside the command loop.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueryError {
    /// The script text did not parse.
    #[error("query parse error: {detail}")]
    Parse { detail: String },

    /// A data-mapping key is not a usable variable name.
    #[error("invalid data mapping key {name:?}: not an identifier")]
    InvalidDataKey { name: String },

    /// A call names a method the store does not have.
    #[error("unknown store method {name:?}")]
    UnknownMethod { name: String },

    /// A store method was called with the wrong number of arguments.
    #[error("{method} expects {expected}, got {got} argument(s)")]
    Arity {
        method: &'static str,
        expected: &'static str,
        got: usize,
    },

    /// A store method argument had the wrong type.
    #[error("{method} argument {index} must be {expected}")]
    BadArgument {
        method: &'static str,
        index: usize,
        expected: &'static str,
    },

    /// An expression used a name nothing declared.
    #[error("unknown variable {name:?}")]
    UnknownVariable { name: String },

    /// Only the store argument can receive method calls.
    #[error("{name:?} is not the store argument and cannot receive calls")]
    NotTheStore { name: String },

    /// The store argument has no value of its own.
    #[error("the store argument {name:?} is only usable as a call receiver")]
    StoreNotAValue { name: String },

    /// A `let` tried to rebind the store argument.
    #[error("let {name:?} would shadow the store argument")]
    ReservedName { name: String },

    /// `%(...)` evaluation saw something other than a literal.
    #[error("only literal expressions can be evaluated here")]
    NotLiteral,

    /// A store operation failed during evaluation.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl QueryError {
    /// Check if this error means the script text itself was unusable.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            QueryError::Parse { .. }
                | QueryError::InvalidDataKey { .. }
                | QueryError::UnknownMethod { .. }
                | QueryError::NotLiteral
        )
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}
