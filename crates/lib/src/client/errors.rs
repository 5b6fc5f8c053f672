//! Error types for the client session.

use thiserror::Error;

use crate::Error;
use crate::query::QueryError;

/// Structured errors surfaced by client requests.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// No response arrived within the configured request timeout.
    #[error("the {action} request timed out")]
    Timeout { action: String },

    /// The connection dropped after the request was written but before its
    /// response arrived.
    #[error("the connection dropped with the {action} request in flight")]
    Disconnected { action: String },

    /// Every connection attempt failed and the session gave up.
    #[error("could not reach the worker after {attempts} attempts")]
    ConnectFailed { attempts: u32 },

    /// The session was ended with [`end`](crate::client::Client::end), or
    /// its background task is gone.
    #[error("the session has ended")]
    SessionEnded,

    /// The worker did not close its side of the socket in time after `end`.
    #[error("the worker did not close the connection in time")]
    DisconnectTimeout,

    /// The worker refused the `init` handshake. Terminal: the session will
    /// not retry with the same key.
    #[error("the worker rejected the init handshake: {reason}")]
    HandshakeRejected { reason: String },

    /// The worker answered the request with an error string.
    #[error("the {action} request failed: {message}")]
    Command { action: String, message: String },

    /// The worker acknowledged the request without the value it owes.
    #[error("the {action} response carried no value")]
    UnexpectedResponse { action: String },

    /// A query script failed local validation before it was sent.
    #[error(transparent)]
    Query(#[from] QueryError),
}

impl ClientError {
    /// Check if this request timed out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout { .. })
    }

    /// Check if the connection dropped out from under the request.
    pub fn is_disconnected(&self) -> bool {
        matches!(self, ClientError::Disconnected { .. })
    }

    /// Check if the session gave up connecting.
    pub fn is_connect_failed(&self) -> bool {
        matches!(self, ClientError::ConnectFailed { .. })
    }

    /// Check if the worker answered with a command error.
    pub fn is_command(&self) -> bool {
        matches!(self, ClientError::Command { .. })
    }

    /// Check if the session is over, either by `end` or by task loss.
    pub fn is_session_ended(&self) -> bool {
        matches!(self, ClientError::SessionEnded)
    }
}

impl From<ClientError> for Error {
    fn from(err: ClientError) -> Self {
        Error::Client(err)
    }
}
