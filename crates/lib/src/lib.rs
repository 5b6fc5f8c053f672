//!
//! Trove: an embeddable in-memory data store for sharing live state between
//! local processes, served over a private loopback channel.
//!
//! ## Core Concepts
//!
//! * **Store (`store::Store`)**: A hierarchical tree of JSON values addressed
//!   by dot-separated key paths. Containers are list-shaped or map-shaped
//!   depending on their keys, and materialize back to JSON accordingly.
//! * **Worker (`server::Server`)**: The TCP server owning one store. Clients
//!   speak newline-delimited JSON requests against a fixed action table.
//! * **Sessions (`client::Client`)**: A cloneable async handle that queues
//!   requests while the connection is down and replays them on reconnect.
//! * **Macros (`macros::Compiler`)**: Inline `$(...)`, `%(...)`, and `#(...)`
//!   forms in request strings, substituted against the store before dispatch.
//! * **Queries (`query`)**: A small script language run on the worker, giving
//!   a batch of store operations one round trip and one atomic turn.
//! * **Expiry (`expiry::ExpiryTracker`)**: Per-path time-to-live bookkeeping,
//!   swept periodically by the worker.

pub mod client;
pub mod constants;
pub mod expiry;
pub mod macros;
pub mod protocol;
pub mod query;
pub mod server;
pub mod store;

pub use client::{Client, ClientConfig, RunOptions, SessionState, Subscription};
pub use server::{Server, ServerConfig};
pub use store::Store;

/// Result type used throughout the Trove library.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for the Trove library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Structured storage errors from the store module
    #[error(transparent)]
    Store(store::StoreError),

    /// Structured macro compilation errors from the macros module
    #[error(transparent)]
    Macro(macros::MacroError),

    /// Structured query errors from the query module
    #[error(transparent)]
    Query(query::QueryError),

    /// Structured server lifecycle errors from the server module
    #[error(transparent)]
    Server(server::ServerError),

    /// Structured session errors from the client module
    #[error(transparent)]
    Client(client::ClientError),
}

impl Error {
    /// Get the originating module for this error.
    pub fn module(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Serialize(_) => "serialize",
            Error::Store(_) => "store",
            Error::Macro(_) => "macros",
            Error::Query(_) => "query",
            Error::Server(_) => "server",
            Error::Client(_) => "client",
        }
    }

    /// Check if this error came from rejecting malformed input.
    pub fn is_validation_error(&self) -> bool {
        match self {
            Error::Store(store_err) => store_err.is_validation(),
            Error::Macro(macro_err) => macro_err.is_validation(),
            Error::Query(query_err) => query_err.is_validation(),
            _ => false,
        }
    }

    /// Check if this error is I/O related.
    pub fn is_io_error(&self) -> bool {
        matches!(self, Error::Io(_))
    }

    /// Check if this error means a request ran out of time.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Client(client_err) => client_err.is_timeout(),
            _ => false,
        }
    }

    /// Check if this error is connection-related.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Server(server_err) => server_err.is_bind(),
            Error::Client(client_err) => {
                client_err.is_connect_failed() || client_err.is_session_ended()
            }
            Error::Io(_) => true,
            _ => false,
        }
    }
}
