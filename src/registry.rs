//! Presence registry capability and its backends.
//!
//! The manager and its shards only ever talk to the [`Registry`] trait. The
//! set of concrete backends is closed and selected once, at construction,
//! through [`AnyRegistry`].

use crate::config::RegistryKind;
use crate::connection::Metadata;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Errors reported by registry backends
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    /// Registry has been closed
    #[error("registry is closed")]
    Closed,
    /// Backend could not be reached
    #[error("registry backend unreachable: {0}")]
    Unreachable(String),
    /// Backend rejected the operation
    #[error("registry backend error: {0}")]
    Backend(String),
}

/// Presence record pushed for each live connection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Presence {
    /// Metadata attached when the connection was created
    pub metadata: Metadata,
    /// When the connection was created
    pub created_at: DateTime<Utc>,
    /// Last liveness signal (creation time until the first ping)
    pub last_seen: DateTime<Utc>,
}

/// Presence-tracking collaborator.
///
/// Implementations must be safe for concurrent use: every shard holds the
/// same instance and calls into it from connection tasks.
pub trait Registry: Send + Sync + 'static {
    /// Health check, run once before the manager is constructed.
    fn ping(&self) -> impl Future<Output = Result<(), RegistryError>> + Send;

    /// Insert or refresh the presence record for `id`.
    fn update(
        &self,
        id: &str,
        presence: Presence,
    ) -> impl Future<Output = Result<(), RegistryError>> + Send;

    /// Remove the presence record for `id`.
    fn deregister(&self, id: &str) -> impl Future<Output = Result<(), RegistryError>> + Send;

    /// Release backend resources. Called exactly once, after every shard closed.
    fn close(&self) -> impl Future<Output = Result<(), RegistryError>> + Send;
}

/// In-process registry backed by a concurrent map
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    entries: DashMap<String, Presence>,
    closed: AtomicBool,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current presence record for `id`
    pub fn get(&self, id: &str) -> Option<Presence> {
        self.entries.get(id).map(|p| p.clone())
    }

    /// Number of tracked identifiers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<(), RegistryError> {
        if self.is_closed() {
            Err(RegistryError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Registry for InMemoryRegistry {
    async fn ping(&self) -> Result<(), RegistryError> {
        self.check_open()
    }

    async fn update(&self, id: &str, presence: Presence) -> Result<(), RegistryError> {
        self.check_open()?;
        self.entries.insert(id.to_string(), presence);
        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<(), RegistryError> {
        self.check_open()?;
        self.entries.remove(id);
        Ok(())
    }

    async fn close(&self) -> Result<(), RegistryError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(RegistryError::Closed);
        }
        debug!("In-memory registry closed with {} entries", self.entries.len());
        self.entries.clear();
        Ok(())
    }
}

/// The closed set of registry backends selectable from configuration
#[derive(Debug)]
pub enum AnyRegistry {
    Memory(InMemoryRegistry),
}

impl AnyRegistry {
    /// Build the backend named by `kind`
    pub fn from_kind(kind: RegistryKind) -> Self {
        match kind {
            RegistryKind::Memory => AnyRegistry::Memory(InMemoryRegistry::new()),
        }
    }

    pub fn kind(&self) -> RegistryKind {
        match self {
            AnyRegistry::Memory(_) => RegistryKind::Memory,
        }
    }
}

impl Registry for AnyRegistry {
    async fn ping(&self) -> Result<(), RegistryError> {
        match self {
            AnyRegistry::Memory(r) => r.ping().await,
        }
    }

    async fn update(&self, id: &str, presence: Presence) -> Result<(), RegistryError> {
        match self {
            AnyRegistry::Memory(r) => r.update(id, presence).await,
        }
    }

    async fn deregister(&self, id: &str) -> Result<(), RegistryError> {
        match self {
            AnyRegistry::Memory(r) => r.deregister(id).await,
        }
    }

    async fn close(&self) -> Result<(), RegistryError> {
        match self {
            AnyRegistry::Memory(r) => r.close().await,
        }
    }
}
