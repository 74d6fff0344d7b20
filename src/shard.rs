use crate::connection::{Connection, ConnectionObserver, ConnectionState};
use crate::error::Error;
use crate::metrics::Metrics;
use crate::registry::Registry;
use futures_util::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Pick the shard for an identifier.
///
/// murmur3 (x86, 32 bit, seed 0) of the identifier bytes, modulo the shard
/// count. Stable across processes, so every node agrees on placement.
pub(crate) fn shard_index(id: &str, shards: usize) -> usize {
    // Reading from an in-memory cursor cannot fail
    let hash = murmur3::murmur3_32(&mut Cursor::new(id.as_bytes()), 0).unwrap_or_default();
    hash as usize % shards
}

/// One partition of the connection space, guarded by its own lock
pub(crate) struct Shard<R: Registry> {
    /// Shard identifier
    id: usize,
    /// Live connections in this shard
    conns: Mutex<HashMap<String, Connection>>,
    /// Set under the `conns` lock when `close` takes its snapshot
    closed: AtomicBool,
    registry: Arc<R>,
    metrics: Arc<Metrics>,
}

impl<R: Registry> Shard<R> {
    /// Create a new shard
    pub(crate) fn new(id: usize, capacity: usize, registry: Arc<R>, metrics: Arc<Metrics>) -> Self {
        Self {
            id,
            conns: Mutex::new(HashMap::with_capacity(capacity)),
            closed: AtomicBool::new(false),
            registry,
            metrics,
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// Insert a connection and publish its presence.
    ///
    /// Rejects identifiers already present, and everything once the shard
    /// started closing. If the registry update fails the insertion is undone
    /// before the error is returned.
    pub(crate) async fn register(&self, conn: &Connection) -> Result<(), Error> {
        {
            let mut conns = self.conns.lock();
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::ShuttingDown);
            }
            if conns.contains_key(conn.id()) {
                self.metrics.record_duplicate_rejection();
                debug!("[SHARD-{}] Rejecting duplicate connection {}", self.id, conn.id());
                return Err(Error::DuplicateConnection {
                    id: conn.id().to_string(),
                    shard_id: self.id,
                });
            }
            conns.insert(conn.id().to_string(), conn.clone());
        }

        if let Err(e) = self.registry.update(conn.id(), conn.presence()).await {
            self.remove(conn);
            self.metrics.record_registry_error();
            warn!(
                "[SHARD-{}] Registry update for {} failed, rolled back: {}",
                self.id,
                conn.id(),
                e
            );
            return Err(e.into());
        }

        if conn.state() >= ConnectionState::Closing {
            // Closed while we were registering; its close hook may have run
            // before the presence record was written.
            conn.wait().await;
            self.remove(conn);
            if let Err(e) = self.registry.deregister(conn.id()).await {
                self.metrics.record_registry_error();
                warn!("[SHARD-{}] Deregister of {} failed: {}", self.id, conn.id(), e);
            }
            return Err(Error::ConnectionClosed {
                id: conn.id().to_string(),
            });
        }

        self.metrics.record_connection_created();
        trace!(
            "[SHARD-{}] Registered {} (count: {})",
            self.id,
            conn.id(),
            self.count()
        );
        Ok(())
    }

    pub(crate) fn find(&self, id: &str) -> Option<Connection> {
        self.conns.lock().get(id).cloned()
    }

    pub(crate) fn count(&self) -> usize {
        self.conns.lock().len()
    }

    /// Identifiers currently held
    pub(crate) fn ids(&self) -> Vec<String> {
        self.conns.lock().keys().cloned().collect()
    }

    /// Push a connection's liveness to the registry.
    ///
    /// Called on pings only, which bounds registry write volume.
    pub(crate) async fn update_registry(&self, conn: &Connection) {
        match self.registry.update(conn.id(), conn.presence()).await {
            Ok(()) => trace!("[SHARD-{}] Refreshed presence of {}", self.id, conn.id()),
            Err(e) => {
                self.metrics.record_registry_error();
                warn!(
                    "[SHARD-{}] Registry update for {} failed: {}",
                    self.id,
                    conn.id(),
                    e
                );
            }
        }
    }

    /// Close every held connection and wait for all of them.
    ///
    /// No connection can be added once the snapshot is taken.
    pub(crate) async fn close(&self) {
        let conns: Vec<Connection> = {
            let map = self.conns.lock();
            self.closed.store(true, Ordering::Release);
            map.values().cloned().collect()
        };
        if !conns.is_empty() {
            debug!("[SHARD-{}] Closing {} connections", self.id, conns.len());
        }

        for conn in &conns {
            conn.close();
        }
        join_all(conns.iter().map(|conn| conn.wait())).await;

        // Close hooks normally removed these already
        for conn in &conns {
            self.remove(conn);
        }
        debug!("[SHARD-{}] Closed", self.id);
    }

    /// Remove `conn` if the map still holds this exact connection.
    ///
    /// A rejected duplicate shares its identifier with the registered
    /// connection and must not evict it.
    fn remove(&self, conn: &Connection) -> bool {
        let mut conns = self.conns.lock();
        match conns.get(conn.id()) {
            Some(held) if held.same(conn) => {
                conns.remove(conn.id());
                true
            }
            _ => false,
        }
    }
}

impl<R: Registry> ConnectionObserver for Shard<R> {
    fn pinged<'a>(&'a self, conn: &'a Connection) -> BoxFuture<'a, ()> {
        Box::pin(self.update_registry(conn))
    }

    fn closed<'a>(&'a self, conn: &'a Connection) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if !self.remove(conn) {
                return;
            }
            if let Err(e) = self.registry.deregister(conn.id()).await {
                self.metrics.record_registry_error();
                warn!("[SHARD-{}] Deregister of {} failed: {}", self.id, conn.id(), e);
            }
        })
    }
}
