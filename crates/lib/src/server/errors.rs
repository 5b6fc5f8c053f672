//! Error types for the worker server.
//!
//! Per-command failures never become Rust errors: they are answered as
//! error strings on the request id and the connection stays open. This
//! module only covers the failures that stop the server itself.

use thiserror::Error;

use crate::Error;

/// Structured errors from the server lifecycle.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServerError {
    /// The listener could not bind its address.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The listener failed while accepting or inspecting connections.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Check if this error happened while binding the listen address.
    pub fn is_bind(&self) -> bool {
        matches!(self, ServerError::Bind { .. })
    }
}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Self {
        Error::Server(err)
    }
}
