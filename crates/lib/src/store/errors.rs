//! Error types for tree operations.

use thiserror::Error;

use crate::Error;

/// Structured errors for [`Store`] operations.
///
/// Most operations are total over their inputs: reads on absent paths return
/// `None` and writes create what they need. The few remaining failure modes
/// live here.
///
/// [`Store`]: super::Store
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The root must stay a container; a scalar cannot be stored at the
    /// empty path.
    #[error("cannot set a scalar at the root; the root is always a container")]
    ScalarAtRoot,
}

impl StoreError {
    /// Check if this error is a validation problem with caller input.
    pub fn is_validation(&self) -> bool {
        matches!(self, StoreError::ScalarAtRoot)
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        Error::Store(err)
    }
}
