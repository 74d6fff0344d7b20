//! # hubcore
//!
//! The connection-management core of a real-time message hub.
//!
//! ## Features
//!
//! - **Sharding** of live connections by murmur3 hash of their identifier
//! - **Per-connection actors** with a single writer and a bounded outbound queue
//! - **Request/response correlation** over the JSON envelope
//! - **Liveness** via ping timestamps pushed to a presence registry
//! - **Coordinated shutdown** that waits for every connection before the registry closes
//! - **Metrics** for observability
//!
//! ## Example
//!
//! ```ignore
//! use hubcore::{ConnectionManager, LoggingHandler, ManagerConfig, Metadata};
//! use std::sync::Arc;
//!
//! let config = ManagerConfig::builder().shards(32).build()?;
//! let manager = ConnectionManager::from_config(config).await?;
//!
//! let socket = tokio_tungstenite::accept_async(stream).await?;
//! let conn = manager
//!     .create("device-42", socket, Arc::new(LoggingHandler), Metadata::new())
//!     .await?;
//!
//! let reply = conn.request("req-1", serde_json::json!({"op": "status"})).await?;
//! manager.close().await?;
//! ```

mod config;
mod connection;
mod error;
mod frame;
mod handler;
mod health;
mod manager;
mod metrics;
mod registry;
mod shard;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, ConnectionConfig, ManagerConfig, ManagerConfigBuilder, RegistryKind};
pub use connection::{CloseReason, Connection, ConnectionState, Metadata, Transport};
pub use error::{Error, ErrorKind};
pub use frame::Envelope;
pub use handler::{HandlerError, LoggingHandler, MessageHandler};
pub use manager::ConnectionManager;
pub use metrics::{Metrics, MetricsSnapshot};
pub use registry::{AnyRegistry, InMemoryRegistry, Presence, Registry, RegistryError};

/// Result type for hubcore operations
pub type Result<T> = std::result::Result<T, Error>;
