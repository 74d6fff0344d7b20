use crate::config::{ConnectionConfig, ManagerConfig};
use crate::connection::{Connection, ConnectionObserver, Metadata, Transport};
use crate::error::Error;
use crate::handler::MessageHandler;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::registry::{AnyRegistry, Registry};
use crate::shard::{shard_index, Shard};
use futures_util::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Owns every live connection, partitioned into shards by identifier hash.
///
/// # Thread Safety
///
/// `ConnectionManager` is `Send + Sync` and all methods can be called from
/// multiple tasks concurrently. Each shard has its own lock, so operations
/// on different shards never contend.
pub struct ConnectionManager<R: Registry = AnyRegistry> {
    shards: Vec<Arc<Shard<R>>>,
    registry: Arc<R>,
    config: ConnectionConfig,
    metrics: Arc<Metrics>,
    /// Set once `close()` starts; new creates are refused from then on
    closed: AtomicBool,
    /// Serializes `close()` so a second caller returns after the first finished.
    /// This is a tokio::Mutex so it can be held across await points.
    lifecycle_lock: Mutex<()>,
}

impl ConnectionManager<AnyRegistry> {
    /// Build a manager using the registry backend named in the config.
    pub async fn from_config(config: ManagerConfig) -> Result<Self, Error> {
        let registry = AnyRegistry::from_kind(config.registry);
        Self::new(config, registry).await
    }
}

impl<R: Registry> ConnectionManager<R> {
    /// Validate the config, health-check the registry and allocate shards.
    ///
    /// Fails with `RegistryUnavailable` if the registry does not answer its
    /// ping; nothing is allocated in that case.
    pub async fn new(config: ManagerConfig, registry: R) -> Result<Self, Error> {
        config.validate()?;

        if let Err(e) = registry.ping().await {
            error!("Registry health check failed: {}", e);
            return Err(Error::RegistryUnavailable(e));
        }

        let registry = Arc::new(registry);
        let metrics = Arc::new(Metrics::new());
        let shards = (0..config.shards)
            .map(|id| {
                Arc::new(Shard::new(
                    id,
                    config.initial_shard_capacity,
                    registry.clone(),
                    metrics.clone(),
                ))
            })
            .collect();

        info!(
            "Starting ConnectionManager with {} shards (queue: {}, write timeout: {:?})",
            config.shards, config.connection.queue_capacity, config.connection.write_timeout
        );

        Ok(Self {
            shards,
            registry,
            config: config.connection,
            metrics,
            closed: AtomicBool::new(false),
            lifecycle_lock: Mutex::new(()),
        })
    }

    /// Shard index an identifier maps to
    pub fn shard_for(&self, id: &str) -> usize {
        shard_index(id, self.shards.len())
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Start a connection over `transport` and register it under `id`.
    ///
    /// On any failure the new connection is fully closed before the error is
    /// returned, and an existing connection with the same id is untouched.
    pub async fn create<T, H>(
        &self,
        id: impl Into<String>,
        transport: T,
        handler: Arc<H>,
        metadata: Metadata,
    ) -> Result<Connection, Error>
    where
        T: Transport,
        H: MessageHandler,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let id = id.into();
        let shard = &self.shards[self.shard_for(&id)];
        let observer: Arc<dyn ConnectionObserver> = shard.clone();
        let conn = Connection::spawn(
            id,
            transport,
            handler,
            metadata,
            &self.config,
            Some(observer),
            self.metrics.clone(),
        );

        if let Err(e) = shard.register(&conn).await {
            debug!("[SHARD-{}] Create of {} failed: {}", shard.id(), conn.id(), e);
            conn.shutdown().await;
            return Err(e);
        }

        debug!("[SHARD-{}] Created connection {}", shard.id(), conn.id());
        Ok(conn)
    }

    /// Look up a live connection by id
    pub fn find(&self, id: &str) -> Option<Connection> {
        self.shards[self.shard_for(id)].find(id)
    }

    /// Total live connections.
    ///
    /// Shards are read one after another, so under concurrent churn the sum
    /// is not an atomic snapshot.
    pub fn count(&self) -> usize {
        self.shards.iter().map(|s| s.count()).sum()
    }

    /// Live connections per shard, indexed by shard id
    pub fn shard_counts(&self) -> Vec<usize> {
        self.shards.iter().map(|s| s.count()).collect()
    }

    /// Close every connection, wait for all of them, then close the registry.
    ///
    /// Shards close in parallel. The registry is closed exactly once, after
    /// every shard finished. Calling this again is a no-op.
    pub async fn close(&self) -> Result<(), Error> {
        let _lifecycle_guard = self.lifecycle_lock.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("ConnectionManager already closed");
            return Ok(());
        }

        info!("Closing ConnectionManager ({} connections)", self.count());

        let handles: Vec<_> = self
            .shards
            .iter()
            .map(|shard| {
                let shard = shard.clone();
                tokio::spawn(async move { shard.close().await })
            })
            .collect();

        for result in join_all(handles).await {
            if let Err(e) = result {
                error!("Shard close task failed: {}", e);
            }
        }

        if let Err(e) = self.registry.close().await {
            warn!("Registry close failed: {}", e);
            self.metrics.record_registry_error();
            return Err(e.into());
        }

        info!("ConnectionManager closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The presence registry shared by all shards
    pub fn registry(&self) -> &R {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Counters plus live connection gauges
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = self.metrics.snapshot();
        snapshot.shard_connections = self.shard_counts();
        snapshot.live_connections = snapshot.shard_connections.iter().sum();
        snapshot
    }
}

impl<R: Registry> Drop for ConnectionManager<R> {
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        // Signal remaining connections so their tasks end and release the shards
        for shard in &self.shards {
            for id in shard.ids() {
                if let Some(conn) = shard.find(&id) {
                    conn.close();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::registry::RegistryError;
    use crate::testing::{ws_pair, RecordingHandler, ScriptedRegistry, TestSocket};
    use futures_util::{SinkExt, StreamExt};
    use std::collections::HashSet;
    use tokio::time::{timeout, Duration};
    use tokio_tungstenite::tungstenite::Message;

    async fn test_manager(shards: usize) -> ConnectionManager<ScriptedRegistry> {
        let config = ManagerConfig::builder().shards(shards).build().unwrap();
        ConnectionManager::new(config, ScriptedRegistry::new())
            .await
            .unwrap()
    }

    async fn connect(
        manager: &ConnectionManager<ScriptedRegistry>,
        id: &str,
    ) -> Result<(Connection, TestSocket), Error> {
        let (server, client) = ws_pair().await;
        let (handler, _rx) = RecordingHandler::new();
        let conn = manager.create(id, server, handler, Metadata::new()).await?;
        Ok((conn, client))
    }

    #[tokio::test]
    async fn test_new_fails_when_registry_unreachable() {
        let registry = ScriptedRegistry::new();
        registry
            .fail_ping
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let result = ConnectionManager::new(ManagerConfig::default(), registry).await;
        let err = result.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::RegistryUnavailable);
        assert!(matches!(
            err,
            Error::RegistryUnavailable(RegistryError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let mut config = ManagerConfig::default();
        config.shards = 0;
        let result = ConnectionManager::new(config, ScriptedRegistry::new()).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_from_config_uses_memory_registry() {
        let manager = ConnectionManager::from_config(ManagerConfig::default())
            .await
            .unwrap();
        assert_eq!(manager.shard_count(), 16);
        assert_eq!(manager.count(), 0);
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_shard_assignment_is_deterministic() {
        let first = test_manager(8).await;
        let second = test_manager(8).await;

        for i in 0..200 {
            let id = format!("device-{}", i);
            let shard = first.shard_for(&id);
            assert!(shard < 8);
            assert_eq!(first.shard_for(&id), shard);
            assert_eq!(second.shard_for(&id), shard);
        }
    }

    #[tokio::test]
    async fn test_connections_live_in_exactly_one_shard() {
        let manager = test_manager(4).await;
        let mut clients = Vec::new();
        for i in 0..20 {
            let (_conn, client) = connect(&manager, &format!("device-{}", i)).await.unwrap();
            clients.push(client);
        }

        let counts = manager.shard_counts();
        assert_eq!(counts.iter().sum::<usize>(), 20);
        assert_eq!(manager.count(), 20);

        let mut seen = HashSet::new();
        for (index, shard) in manager.shards.iter().enumerate() {
            for id in shard.ids() {
                assert_eq!(manager.shard_for(&id), index);
                assert!(seen.insert(id), "id present in two shards");
            }
        }
        assert_eq!(seen.len(), 20);

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_create_keeps_original() {
        let manager = test_manager(4).await;
        let (original, _c1) = connect(&manager, "dup").await.unwrap();

        let (server, mut client) = ws_pair().await;
        let (handler, _rx) = RecordingHandler::new();
        let err = manager
            .create("dup", server, handler, Metadata::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateConnection);

        // The rejected connection was torn down before create returned
        let next = timeout(Duration::from_secs(2), client.next()).await.unwrap();
        assert!(matches!(next, None | Some(Ok(Message::Close(_))) | Some(Err(_))));
        assert_eq!(manager.metrics().connections_closed(), 1);
        assert_eq!(manager.metrics().duplicate_rejections(), 1);

        // The original is untouched
        assert!(manager.find("dup").unwrap().same(&original));
        assert!(!original.is_closed());
        assert_eq!(manager.count(), 1);
        assert!(manager.registry().store.get("dup").is_some());

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_update_failure_rolls_back_create() {
        let manager = test_manager(2).await;
        manager
            .registry()
            .fail_update
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let err = connect(&manager, "dev-1").await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Registry);
        assert!(manager.find("dev-1").is_none());
        assert_eq!(manager.count(), 0);
        assert_eq!(manager.metrics().connections_closed(), 1);
        assert_eq!(manager.metrics().registry_errors(), 1);

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_count_tracks_closes() {
        let manager = test_manager(4).await;
        let mut conns = Vec::new();
        let mut clients = Vec::new();
        for i in 0..12 {
            let (conn, client) = connect(&manager, &format!("device-{}", i)).await.unwrap();
            conns.push(conn);
            clients.push(client);
        }
        assert_eq!(manager.count(), 12);

        for conn in conns.iter().take(5) {
            conn.shutdown().await;
        }

        assert_eq!(manager.count(), 7);
        assert!(manager.find("device-0").is_none());
        assert!(manager.find("device-11").is_some());
        assert_eq!(manager.registry().store.len(), 7);

        let snapshot = manager.metrics_snapshot();
        assert_eq!(snapshot.live_connections, 7);
        assert_eq!(snapshot.shard_connections.len(), 4);
        assert_eq!(snapshot.connections_created_total, 12);
        assert_eq!(snapshot.connections_closed_total, 5);

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_self_closed_connection_is_removed() {
        let manager = test_manager(4).await;
        let (conn, client) = connect(&manager, "dev-1").await.unwrap();

        drop(client);
        timeout(Duration::from_secs(5), conn.wait()).await.unwrap();

        assert!(manager.find("dev-1").is_none());
        assert!(manager.registry().store.get("dev-1").is_none());

        // The id is free again
        let (_again, _client) = connect(&manager, "dev-1").await.unwrap();
        assert_eq!(manager.count(), 1);

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_refreshes_registry_once() {
        let manager = test_manager(4).await;
        let (conn, mut client) = connect(&manager, "dev-1").await.unwrap();
        let mut updates = manager.registry().watch_updates();
        let registered_at = conn.last_pinged_at();

        client.send(Message::Ping(b"hi".to_vec().into())).await.unwrap();

        let (id, presence) = timeout(Duration::from_secs(2), updates.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, "dev-1");
        assert!(presence.last_seen >= registered_at);
        assert_eq!(presence.created_at, conn.created_at());

        let reply = timeout(Duration::from_secs(2), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(reply, Message::Pong(_)));

        // One update at registration, one for the ping
        assert_eq!(
            manager
                .registry()
                .updates
                .load(std::sync::atomic::Ordering::SeqCst),
            2
        );

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_waits_for_every_connection() {
        let manager = test_manager(4).await;
        let mut conns = Vec::new();
        let mut clients = Vec::new();
        for i in 0..10 {
            let (conn, client) = connect(&manager, &format!("device-{}", i)).await.unwrap();
            conns.push(conn);
            clients.push(client);
        }

        timeout(Duration::from_secs(5), manager.close())
            .await
            .unwrap()
            .unwrap();

        assert!(manager.is_closed());
        assert_eq!(manager.count(), 0);
        assert!(conns.iter().all(|c| c.is_closed()));

        let registry = manager.registry();
        assert_eq!(registry.closes.load(std::sync::atomic::Ordering::SeqCst), 1);
        // Every presence record was removed before the registry closed
        assert_eq!(
            registry
                .live_at_close
                .load(std::sync::atomic::Ordering::SeqCst),
            0
        );

        // Second close is a no-op
        manager.close().await.unwrap();
        assert_eq!(registry.closes.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_create_after_close_is_refused() {
        let manager = test_manager(2).await;
        manager.close().await.unwrap();

        let (server, _client) = ws_pair().await;
        let (handler, _rx) = RecordingHandler::new();
        let err = manager
            .create("late", server, handler, Metadata::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ShuttingDown);
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn test_create_into_closing_shard_is_refused() {
        let manager = test_manager(4).await;
        // A concurrent close() has already snapshotted this shard
        let index = manager.shard_for("late");
        manager.shards[index].close().await;

        let err = connect(&manager, "late").await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::ShuttingDown);
        assert!(manager.find("late").is_none());
        assert_eq!(manager.count(), 0);
        assert!(manager.registry().store.get("late").is_none());
        assert_eq!(manager.metrics().connections_closed(), 1);
        assert_eq!(manager.metrics().connections_created(), 0);

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_creates() {
        let manager = Arc::new(test_manager(8).await);
        let mut tasks = Vec::new();
        for i in 0..32 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                connect(&manager, &format!("device-{}", i % 16)).await
            }));
        }

        let mut ok = Vec::new();
        let mut duplicates = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(pair) => ok.push(pair),
                Err(e) => {
                    assert_eq!(e.kind(), ErrorKind::DuplicateConnection);
                    duplicates += 1;
                }
            }
        }

        assert_eq!(ok.len(), 16);
        assert_eq!(duplicates, 16);
        assert_eq!(manager.count(), 16);

        manager.close().await.unwrap();
    }
}
