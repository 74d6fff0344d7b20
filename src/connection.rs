use crate::config::ConnectionConfig;
use crate::error::Error;
use crate::frame::Envelope;
use crate::handler::MessageHandler;
use crate::health::{IdleMonitor, PingClock};
use crate::metrics::Metrics;
use crate::registry::Presence;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Duration, Instant};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Opaque key/value attachment set when a connection is created
pub type Metadata = serde_json::Map<String, Value>;

/// Pongs waiting for the writer. Small: a peer that pings faster than we can
/// answer trips the write timeout anyway.
const CONTROL_CHANNEL_SIZE: usize = 4;

/// Bidirectional WebSocket message stream owned by a connection.
///
/// Implemented for every `tokio_tungstenite::WebSocketStream`.
pub trait Transport:
    Stream<Item = Result<Message, tungstenite::Error>>
    + Sink<Message, Error = tungstenite::Error>
    + Send
    + Unpin
    + 'static
{
}

impl<T> Transport for T where
    T: Stream<Item = Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Send
        + Unpin
        + 'static
{
}

/// Lifecycle of a connection. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Tasks spawned but not yet running
    Starting,
    /// Reading and writing
    Running,
    /// Close requested or a failure was detected; tasks are draining
    Closing,
    /// All tasks stopped and all resources released
    Closed,
}

/// Why a connection left the running state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called
    Requested,
    /// Peer sent a close frame
    PeerClosed,
    /// Inbound stream ended
    TransportEnded,
    /// Inbound stream failed
    TransportError,
    /// A write (or pong) exceeded the write timeout
    WriteTimeout,
    /// A write failed
    WriteFailed,
    /// Nothing was heard from the peer within the idle timeout
    Idle,
}

/// Receives liveness and teardown notifications from a connection's read task.
pub(crate) trait ConnectionObserver: Send + Sync + 'static {
    /// The peer pinged; `conn.last_pinged_at()` is already updated.
    fn pinged<'a>(&'a self, conn: &'a Connection) -> BoxFuture<'a, ()>;

    /// The connection stopped; runs before `Closed` is published.
    fn closed<'a>(&'a self, conn: &'a Connection) -> BoxFuture<'a, ()>;
}

type PendingSlot = (u64, oneshot::Sender<Value>);

/// Pong reply queued for the writer; must be on the wire by `deadline`,
/// which is counted from the ping that asked for it.
struct Pong {
    message: Message,
    deadline: Instant,
}

struct Inner {
    id: String,
    metadata: Metadata,
    created_at: DateTime<Utc>,
    ping_clock: PingClock,
    outbound_tx: mpsc::Sender<Message>,
    /// `None` once the connection has released its pending slots
    pending: Mutex<Option<HashMap<String, PendingSlot>>>,
    next_slot: AtomicU64,
    state_tx: watch::Sender<ConnectionState>,
    close_reason: Mutex<Option<CloseReason>>,
    shutdown: CancellationToken,
    metrics: Arc<Metrics>,
}

/// Handle to a single connection actor.
///
/// Cloning is cheap; all clones refer to the same connection. The transport
/// is owned by the connection's read and write tasks and is never touched
/// through this handle.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("created_at", &self.inner.created_at)
            .finish()
    }
}

impl Connection {
    /// Build a connection and start its read and write tasks.
    pub(crate) fn spawn<T, H>(
        id: String,
        transport: T,
        handler: Arc<H>,
        metadata: Metadata,
        config: &ConnectionConfig,
        observer: Option<Arc<dyn ConnectionObserver>>,
        metrics: Arc<Metrics>,
    ) -> Connection
    where
        T: Transport,
        H: MessageHandler,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.queue_capacity);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_SIZE);
        let (state_tx, _) = watch::channel(ConnectionState::Starting);
        let now = Utc::now();

        let conn = Connection {
            inner: Arc::new(Inner {
                id,
                metadata,
                created_at: now,
                ping_clock: PingClock::new(now),
                outbound_tx,
                pending: Mutex::new(Some(HashMap::new())),
                next_slot: AtomicU64::new(0),
                state_tx,
                close_reason: Mutex::new(None),
                shutdown: CancellationToken::new(),
                metrics,
            }),
        };

        let (sink, stream) = transport.split();

        let writer = Writer {
            conn: conn.clone(),
            sink,
            outbound_rx,
            control_rx,
            write_timeout: config.write_timeout,
            close_timeout: config.close_timeout,
        };
        let writer_handle = tokio::spawn(writer.run());

        let reader = Reader {
            conn: conn.clone(),
            stream,
            handler,
            control_tx,
            observer,
            idle: IdleMonitor::new(config.idle_timeout),
            write_timeout: config.write_timeout,
        };
        tokio::spawn(reader.run(writer_handle));

        conn
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn metadata(&self) -> &Metadata {
        &self.inner.metadata
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    /// Time of the last ping, or creation time if the peer never pinged
    pub fn last_pinged_at(&self) -> DateTime<Utc> {
        self.inner.ping_clock.last()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Why the connection is closing, if it is
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.inner.close_reason.lock()
    }

    /// Number of requests still waiting for a response
    pub fn pending_requests(&self) -> usize {
        self.inner
            .pending
            .lock()
            .as_ref()
            .map(|p| p.len())
            .unwrap_or(0)
    }

    /// Current presence record for the registry
    pub fn presence(&self) -> Presence {
        Presence {
            metadata: self.inner.metadata.clone(),
            created_at: self.inner.created_at,
            last_seen: self.last_pinged_at(),
        }
    }

    /// Whether two handles refer to the same connection
    pub fn same(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Wait until the connection has left `Starting`.
    ///
    /// Returns the state observed at that point.
    pub async fn ready(&self) -> ConnectionState {
        let mut rx = self.inner.state_tx.subscribe();
        let state = match rx.wait_for(|s| *s != ConnectionState::Starting).await {
            Ok(state) => *state,
            Err(_) => ConnectionState::Closed,
        };
        state
    }

    /// Queue a message without a correlation id.
    ///
    /// Waits for queue capacity; fails with `ConnectionClosed` once the
    /// connection is closing.
    pub async fn send(&self, payload: Value) -> Result<(), Error> {
        let message = Envelope::new(payload).to_message()?;
        self.enqueue(message).await
    }

    /// Send a request and wait for the response carrying the same correlation id.
    ///
    /// If the connection closes first, the call resolves with
    /// `ConnectionClosed` (or `WriteTimeout` when a stalled write closed it).
    /// Dropping the returned future releases the pending slot.
    pub async fn request(
        &self,
        correlation_id: impl Into<String>,
        payload: Value,
    ) -> Result<Value, Error> {
        let correlation_id = correlation_id.into();
        let message = Envelope::correlated(correlation_id.clone(), payload).to_message()?;

        let (slot, rx) = self.register_pending(&correlation_id)?;
        let guard = PendingGuard {
            conn: self,
            correlation_id: &correlation_id,
            slot,
        };

        self.enqueue(message).await?;

        // The read task may be the caller (a handler issuing a request), so
        // the close signal must unblock us before the table is released.
        let response = tokio::select! {
            biased;
            response = rx => response.map_err(|_| self.closed_error()),
            _ = self.inner.shutdown.cancelled() => Err(self.closed_error()),
        };
        drop(guard);
        response
    }

    /// Request the connection to close. Idempotent; returns immediately.
    pub fn close(&self) {
        self.begin_close(CloseReason::Requested);
    }

    /// Block until the connection is fully closed.
    pub async fn wait(&self) {
        let mut rx = self.inner.state_tx.subscribe();
        let _ = rx.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    /// `close()` followed by `wait()`
    pub async fn shutdown(&self) {
        self.close();
        self.wait().await;
    }

    fn begin_close(&self, reason: CloseReason) {
        {
            let mut current = self.inner.close_reason.lock();
            if current.is_none() {
                *current = Some(reason);
            }
        }
        self.inner.state_tx.send_if_modified(|s| {
            if *s < ConnectionState::Closing {
                *s = ConnectionState::Closing;
                true
            } else {
                false
            }
        });
        self.inner.shutdown.cancel();
    }

    fn closed_error(&self) -> Error {
        match self.close_reason() {
            Some(CloseReason::WriteTimeout) => Error::WriteTimeout {
                id: self.inner.id.clone(),
            },
            _ => Error::ConnectionClosed {
                id: self.inner.id.clone(),
            },
        }
    }

    async fn enqueue(&self, message: Message) -> Result<(), Error> {
        if self.state() >= ConnectionState::Closing {
            return Err(self.closed_error());
        }
        self.inner
            .outbound_tx
            .send(message)
            .await
            .map_err(|_| self.closed_error())
    }

    fn register_pending(
        &self,
        correlation_id: &str,
    ) -> Result<(u64, oneshot::Receiver<Value>), Error> {
        let mut pending = self.inner.pending.lock();
        let Some(table) = pending.as_mut() else {
            return Err(self.closed_error());
        };
        if table.contains_key(correlation_id) {
            return Err(Error::DuplicateCorrelation {
                id: self.inner.id.clone(),
                correlation_id: correlation_id.to_string(),
            });
        }
        let slot = self.inner.next_slot.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        table.insert(correlation_id.to_string(), (slot, tx));
        Ok((slot, rx))
    }

    fn take_pending(&self, correlation_id: &str) -> Option<oneshot::Sender<Value>> {
        self.inner
            .pending
            .lock()
            .as_mut()
            .and_then(|table| table.remove(correlation_id))
            .map(|(_, tx)| tx)
    }

    /// Drop every pending slot; waiters observe a closed channel.
    fn release_pending(&self) -> usize {
        self.inner
            .pending
            .lock()
            .take()
            .map(|table| table.len())
            .unwrap_or(0)
    }
}

/// Removes a request's pending slot when the request future goes away.
/// Only removes the slot it created, so a reused correlation id is safe.
struct PendingGuard<'a> {
    conn: &'a Connection,
    correlation_id: &'a str,
    slot: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut pending = self.conn.inner.pending.lock();
        if let Some(table) = pending.as_mut() {
            if table
                .get(self.correlation_id)
                .is_some_and(|(slot, _)| *slot == self.slot)
            {
                table.remove(self.correlation_id);
            }
        }
    }
}

/// Single writer: drains pongs and the outbound queue onto the transport.
struct Writer<T: Transport> {
    conn: Connection,
    sink: SplitSink<T, Message>,
    outbound_rx: mpsc::Receiver<Message>,
    control_rx: mpsc::Receiver<Pong>,
    write_timeout: Duration,
    close_timeout: Duration,
}

impl<T: Transport> Writer<T> {
    async fn run(mut self) {
        let id = self.conn.inner.id.clone();
        let metrics = self.conn.inner.metrics.clone();
        let shutdown = self.conn.inner.shutdown.clone();

        loop {
            let (message, deadline, is_pong) = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(pong) = self.control_rx.recv() => (pong.message, pong.deadline, true),
                Some(message) = self.outbound_rx.recv() => {
                    (message, Instant::now() + self.write_timeout, false)
                }
                else => break,
            };

            match timeout_at(deadline, self.sink.send(message)).await {
                Ok(Ok(())) => {
                    if is_pong {
                        metrics.record_pong();
                    } else {
                        metrics.record_message_sent();
                    }
                }
                Ok(Err(e)) => {
                    warn!("[CONN-{}] Write failed: {}", id, e);
                    metrics.record_write_error();
                    self.conn.begin_close(CloseReason::WriteFailed);
                    break;
                }
                Err(_) => {
                    warn!(
                        "[CONN-{}] Write timed out after {:?}, closing",
                        id, self.write_timeout
                    );
                    metrics.record_write_timeout();
                    self.conn.begin_close(CloseReason::WriteTimeout);
                    break;
                }
            }
        }

        // Best effort: a peer that stopped reading will not get these
        let _ = timeout(self.close_timeout, self.sink.send(Message::Close(None))).await;
        let _ = timeout(self.close_timeout, self.sink.close()).await;
        trace!("[CONN-{}] Writer stopped", id);
    }
}

/// Reads inbound frames, answers pings and tears the connection down.
struct Reader<T: Transport, H: MessageHandler> {
    conn: Connection,
    stream: SplitStream<T>,
    handler: Arc<H>,
    control_tx: mpsc::Sender<Pong>,
    observer: Option<Arc<dyn ConnectionObserver>>,
    idle: IdleMonitor,
    write_timeout: Duration,
}

impl<T: Transport, H: MessageHandler> Reader<T, H> {
    async fn run(mut self, writer: JoinHandle<()>) {
        let shutdown = self.conn.inner.shutdown.clone();

        self.conn.inner.state_tx.send_if_modified(|s| {
            if *s == ConnectionState::Starting {
                *s = ConnectionState::Running;
                true
            } else {
                false
            }
        });
        debug!("[CONN-{}] Running", self.conn.id());

        loop {
            let idle_deadline = self.idle.time_until_idle();

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                frame = self.stream.next() => {
                    match frame {
                        Some(Ok(message)) => {
                            if !self.on_frame(message).await {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            debug!("[CONN-{}] Transport error: {}", self.conn.id(), e);
                            self.conn.begin_close(CloseReason::TransportError);
                            break;
                        }
                        None => {
                            debug!("[CONN-{}] Transport ended", self.conn.id());
                            self.conn.begin_close(CloseReason::TransportEnded);
                            break;
                        }
                    }
                }
                _ = sleep_until_idle(idle_deadline) => {
                    if self.idle.is_idle() {
                        info!("[CONN-{}] Idle timeout, closing", self.conn.id());
                        self.conn.begin_close(CloseReason::Idle);
                        break;
                    }
                }
            }
        }

        // Covers loop exits that did not record a reason
        self.conn.begin_close(CloseReason::Requested);

        if let Err(e) = writer.await {
            error!("[CONN-{}] Writer task failed: {:?}", self.conn.id(), e);
        }

        self.finish().await;
    }

    /// Handle one inbound frame. Returns `false` when the connection must stop.
    async fn on_frame(&mut self, message: Message) -> bool {
        match message {
            Message::Ping(_) => {
                self.idle.record_activity();
                self.on_ping().await
            }
            Message::Pong(_) => {
                trace!("[CONN-{}] Received pong", self.conn.id());
                true
            }
            Message::Close(frame) => {
                debug!("[CONN-{}] Received close frame: {:?}", self.conn.id(), frame);
                self.conn.begin_close(CloseReason::PeerClosed);
                false
            }
            Message::Frame(_) => true,
            data => {
                self.idle.record_activity();
                self.conn.inner.metrics.record_message_received();
                match Envelope::from_message(&data) {
                    Some(envelope) => self.dispatch(envelope).await,
                    None => debug!(
                        "[CONN-{}] Dropping undecodable {} byte frame",
                        self.conn.id(),
                        data.len()
                    ),
                }
                true
            }
        }
    }

    async fn on_ping(&mut self) -> bool {
        let deadline = Instant::now() + self.write_timeout;
        let pinged_at = self.conn.inner.ping_clock.record(Utc::now());
        self.conn.inner.metrics.record_ping();
        debug!("[CONN-{}] Pinged at {}", self.conn.id(), pinged_at);

        if let Some(observer) = &self.observer {
            observer.pinged(&self.conn).await;
        }

        let now_ms = Utc::now().timestamp_millis().to_string();
        let pong = Pong {
            message: Message::Pong(now_ms.into_bytes().into()),
            deadline,
        };
        match timeout_at(deadline, self.control_tx.send(pong)).await {
            Ok(Ok(())) => true,
            _ => {
                warn!("[CONN-{}] Could not queue pong in time, closing", self.conn.id());
                self.conn.inner.metrics.record_write_timeout();
                self.conn.begin_close(CloseReason::WriteTimeout);
                false
            }
        }
    }

    /// Route a decoded frame to its pending request or to the handler.
    async fn dispatch(&self, envelope: Envelope) {
        if let Some(correlation_id) = envelope.id.as_deref() {
            if let Some(slot) = self.conn.take_pending(correlation_id) {
                trace!(
                    "[CONN-{}] Response for {} delivered",
                    self.conn.id(),
                    correlation_id
                );
                self.conn.inner.metrics.record_response_matched();
                // Requester may have given up; nothing to do then
                let _ = slot.send(envelope.payload);
                return;
            }
        }

        let result = AssertUnwindSafe(self.handler.handle_message(&self.conn, envelope))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("[CONN-{}] Handler error: {}", self.conn.id(), e);
                self.conn.inner.metrics.record_handler_error();
            }
            Err(_) => {
                error!("[CONN-{}] Handler panicked! Message dropped", self.conn.id());
                self.conn.inner.metrics.record_handler_error();
            }
        }
    }

    async fn finish(self) {
        let conn = self.conn;

        let released = conn.release_pending();
        if released > 0 {
            debug!("[CONN-{}] Cancelled {} pending requests", conn.id(), released);
        }

        if let Some(observer) = &self.observer {
            observer.closed(&conn).await;
        }

        if AssertUnwindSafe(self.handler.on_close(&conn))
            .catch_unwind()
            .await
            .is_err()
        {
            error!("[CONN-{}] Handler on_close panicked", conn.id());
            conn.inner.metrics.record_handler_error();
        }

        conn.inner.metrics.record_connection_closed();
        conn.inner.state_tx.send_replace(ConnectionState::Closed);
        info!("[CONN-{}] Closed ({:?})", conn.id(), conn.close_reason());
    }
}

async fn sleep_until_idle(deadline: Option<Duration>) {
    match deadline {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}
