use crate::config::ConfigError;
use crate::registry::RegistryError;
use thiserror::Error;

/// Categorizes errors for caller decision-making.
///
/// This is a lightweight, cloneable representation of the error type
/// that upstream accept code can match on without inspecting payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Registry failed its startup health check
    RegistryUnavailable,
    /// Identifier already registered in its shard
    DuplicateConnection,
    /// A write (including a pong) exceeded the configured deadline
    WriteTimeout,
    /// Operation against a closing or closed connection
    ConnectionClosed,
    /// Registry operation failed
    Registry,
    /// WebSocket protocol error
    WebSocket,
    /// Manager is shutting down
    ShuttingDown,
    /// Other error
    Other,
}

/// Errors that can occur in hubcore
#[derive(Error, Debug)]
pub enum Error {
    /// Registry health check failed at construction time
    #[error("Registry unavailable: {0}")]
    RegistryUnavailable(#[source] RegistryError),

    /// Identifier is already registered in its shard
    #[error("Connection {id} is already registered in shard {shard_id}")]
    DuplicateConnection { id: String, shard_id: usize },

    /// A write did not complete within the configured timeout
    #[error("Write to connection {id} timed out")]
    WriteTimeout { id: String },

    /// The connection is closing or closed
    #[error("Connection {id} is closed")]
    ConnectionClosed { id: String },

    /// A request with the same correlation id is already in flight
    #[error("Correlation id {correlation_id} already pending on connection {id}")]
    DuplicateCorrelation { id: String, correlation_id: String },

    /// Registry operation failed
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Envelope could not be encoded
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Manager is shutting down
    #[error("Manager is shutting down")]
    ShuttingDown,

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Get the kind of this error for decision-making.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::RegistryUnavailable(_) => ErrorKind::RegistryUnavailable,
            Error::DuplicateConnection { .. } => ErrorKind::DuplicateConnection,
            Error::WriteTimeout { .. } => ErrorKind::WriteTimeout,
            Error::ConnectionClosed { .. } => ErrorKind::ConnectionClosed,
            Error::Registry(_) => ErrorKind::Registry,
            Error::WebSocket(_) => ErrorKind::WebSocket,
            Error::ShuttingDown => ErrorKind::ShuttingDown,
            Error::DuplicateCorrelation { .. } | Error::Codec(_) | Error::Config(_) => {
                ErrorKind::Other
            }
        }
    }
}
