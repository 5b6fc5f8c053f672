//! Error types for macro compilation.

use thiserror::Error;

use crate::Error;
use crate::query::QueryError;

/// Structured errors from the macro compiler.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MacroError {
    /// A sigil opened an invocation that never found its matching paren.
    #[error("unterminated {sigil}(...) macro")]
    Unterminated { sigil: char },

    /// The argument of a `%(...)` invocation was not a literal expression.
    #[error("macro evaluation failed: {0}")]
    Evaluate(#[from] QueryError),
}

impl MacroError {
    /// Check if this error is a validation problem with caller input.
    ///
    /// Every macro failure is: the compiler only sees caller-supplied text.
    pub fn is_validation(&self) -> bool {
        true
    }
}

impl From<MacroError> for Error {
    fn from(err: MacroError) -> Self {
        Error::Macro(err)
    }
}
