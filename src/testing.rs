//! Test fixtures: in-memory WebSocket pairs, a recording handler and a
//! registry whose failures can be scripted.

use crate::connection::Connection;
use crate::error::ErrorKind;
use crate::frame::Envelope;
use crate::handler::{HandlerError, MessageHandler};
use crate::registry::{InMemoryRegistry, Presence, Registry, RegistryError};
use futures_util::{Sink, Stream};
use serde_json::Value;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

pub(crate) type TestSocket = WebSocketStream<DuplexStream>;

/// Server and client ends of an in-memory WebSocket
pub(crate) async fn ws_pair() -> (TestSocket, TestSocket) {
    ws_pair_with_capacity(64 * 1024).await
}

pub(crate) async fn ws_pair_with_capacity(capacity: usize) -> (TestSocket, TestSocket) {
    let (server_io, client_io) = tokio::io::duplex(capacity);
    let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
    let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
    (server, client)
}

/// Server socket whose reads work but whose writes never complete
pub(crate) struct StalledSink {
    inner: TestSocket,
}

impl StalledSink {
    pub(crate) fn new(inner: TestSocket) -> Self {
        Self { inner }
    }
}

impl Stream for StalledSink {
    type Item = Result<Message, tungstenite::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Sink<Message> for StalledSink {
    type Error = tungstenite::Error;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Pending
    }

    fn start_send(self: Pin<&mut Self>, _item: Message) -> Result<(), Self::Error> {
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Pending
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Pending
    }
}

/// Forwards every handled message to a channel.
///
/// Panics on the payload `"panic"`. On the payload `"request"` it issues a
/// request with correlation id `"nested"` from inside the handler and keeps
/// the outcome.
pub(crate) struct RecordingHandler {
    tx: mpsc::UnboundedSender<(String, Envelope)>,
    closed: AtomicUsize,
    nested: parking_lot::Mutex<Vec<Result<Value, ErrorKind>>>,
}

impl RecordingHandler {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(String, Envelope)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = Arc::new(Self {
            tx,
            closed: AtomicUsize::new(0),
            nested: parking_lot::Mutex::new(Vec::new()),
        });
        (handler, rx)
    }

    /// Number of `on_close` calls
    pub(crate) fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Outcomes of requests issued from inside the handler
    pub(crate) fn nested_outcomes(&self) -> Vec<Result<Value, ErrorKind>> {
        self.nested.lock().clone()
    }
}

impl MessageHandler for RecordingHandler {
    async fn handle_message(&self, conn: &Connection, message: Envelope) -> Result<(), HandlerError> {
        if message.payload == "panic" {
            panic!("handler asked to panic");
        }
        if message.payload == "request" {
            let outcome = conn.request("nested", Value::Null).await;
            self.nested.lock().push(outcome.map_err(|e| e.kind()));
            return Ok(());
        }
        self.tx
            .send((conn.id().to_string(), message))
            .map_err(|_| HandlerError::new("receiver dropped"))
    }

    async fn on_close(&self, _conn: &Connection) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// In-memory registry that counts calls and can be told to fail
#[derive(Default)]
pub(crate) struct ScriptedRegistry {
    pub(crate) store: InMemoryRegistry,
    pub(crate) fail_ping: AtomicBool,
    pub(crate) fail_update: AtomicBool,
    pub(crate) updates: AtomicUsize,
    pub(crate) deregisters: AtomicUsize,
    pub(crate) closes: AtomicUsize,
    /// Presence records still stored when `close` ran
    pub(crate) live_at_close: AtomicUsize,
    pub(crate) updates_tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<(String, Presence)>>>,
}

impl ScriptedRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Stream of successful updates
    pub(crate) fn watch_updates(&self) -> mpsc::UnboundedReceiver<(String, Presence)> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.updates_tx.lock() = Some(tx);
        rx
    }
}

impl Registry for ScriptedRegistry {
    async fn ping(&self) -> Result<(), RegistryError> {
        if self.fail_ping.load(Ordering::SeqCst) {
            return Err(RegistryError::Unreachable("scripted".to_string()));
        }
        self.store.ping().await
    }

    async fn update(&self, id: &str, presence: Presence) -> Result<(), RegistryError> {
        if self.fail_update.load(Ordering::SeqCst) {
            return Err(RegistryError::Backend("scripted".to_string()));
        }
        self.store.update(id, presence.clone()).await?;
        self.updates.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = self.updates_tx.lock().as_ref() {
            let _ = tx.send((id.to_string(), presence));
        }
        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<(), RegistryError> {
        self.store.deregister(id).await?;
        self.deregisters.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), RegistryError> {
        self.live_at_close.store(self.store.len(), Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.store.close().await
    }
}
