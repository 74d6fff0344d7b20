use crate::connection::Connection;
use crate::frame::Envelope;
use std::future::Future;
use tracing::info;

/// Error returned by a message handler.
///
/// Handler errors are logged and counted; they never close the connection.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Trait that application plugins implement to receive inbound frames.
///
/// The connection's read task calls [`handle_message`](Self::handle_message)
/// for every data frame that is not the response to a pending request.
/// Calls for one connection are sequential; calls for different connections
/// run concurrently.
///
/// `handle_message` runs on the read task itself: until it returns, no
/// further frames are read from that connection, so responses to pending
/// requests are not matched and pings are not answered. A handler may await
/// [`Connection::request`] on its own connection, but the response can only
/// arrive after the handler returns; such a request resolves once the
/// connection closes. Hand long work off to another task.
///
/// # Example
///
/// ```ignore
/// use hubcore::{Connection, Envelope, HandlerError, MessageHandler};
///
/// struct Indexer;
///
/// impl MessageHandler for Indexer {
///     async fn handle_message(&self, conn: &Connection, message: Envelope) -> Result<(), HandlerError> {
///         // index message.payload under conn.id()
///         Ok(())
///     }
/// }
/// ```
pub trait MessageHandler: Send + Sync + 'static {
    /// Called for each uncorrelated inbound frame.
    fn handle_message(
        &self,
        conn: &Connection,
        message: Envelope,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send;

    /// Called once while the connection is being torn down.
    fn on_close(&self, _conn: &Connection) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Handler that logs every inbound frame
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

impl MessageHandler for LoggingHandler {
    async fn handle_message(&self, conn: &Connection, message: Envelope) -> Result<(), HandlerError> {
        info!(
            "[CONN-{}] message (correlation id: {:?}): {}",
            conn.id(),
            message.id,
            message.payload
        );
        Ok(())
    }

    async fn on_close(&self, conn: &Connection) {
        info!("[CONN-{}] closed", conn.id());
    }
}
