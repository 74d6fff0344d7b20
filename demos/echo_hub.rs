//! Example: a minimal hub that echoes every message back to its sender
//!
//! Each accepted WebSocket is registered under its peer address. Ctrl-C
//! closes every connection and then the registry.
//!
//! Run with: RUST_LOG=info cargo run --example echo_hub
//! Then connect with any WebSocket client to ws://127.0.0.1:9001

use hubcore::{
    Connection, ConnectionManager, Envelope, HandlerError, ManagerConfig, Metadata, MessageHandler,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Sends each payload straight back to the connection it came from
struct EchoHandler;

impl MessageHandler for EchoHandler {
    async fn handle_message(&self, conn: &Connection, message: Envelope) -> Result<(), HandlerError> {
        info!("[CONN-{}] echo {}", conn.id(), message.payload);
        conn.send(message.payload)
            .await
            .map_err(|e| HandlerError::new(e.to_string()))
    }

    async fn on_close(&self, conn: &Connection) {
        info!("[CONN-{}] gone after {:?}", conn.id(), conn.close_reason());
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = ManagerConfig::builder()
        .shards(8)
        .queue_capacity(64)
        .write_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(60))
        .build()?;
    let manager = Arc::new(ConnectionManager::from_config(config).await?);
    let handler = Arc::new(EchoHandler);

    let listener = TcpListener::bind("127.0.0.1:9001").await?;
    info!("Listening on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        continue;
                    }
                };
                let manager = manager.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    let socket = match tokio_tungstenite::accept_async(stream).await {
                        Ok(socket) => socket,
                        Err(e) => {
                            warn!("Handshake with {} failed: {}", addr, e);
                            return;
                        }
                    };
                    let mut metadata = Metadata::new();
                    metadata.insert("addr".to_string(), addr.to_string().into());
                    match manager.create(addr.to_string(), socket, handler, metadata).await {
                        Ok(conn) => info!(
                            "[CONN-{}] registered in shard {}",
                            conn.id(),
                            manager.shard_for(conn.id())
                        ),
                        Err(e) => error!("Create for {} failed: {}", addr, e),
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down ({} connections)", manager.count());
                break;
            }
        }
    }

    manager.close().await?;
    let snapshot = manager.metrics_snapshot();
    info!(
        "Done: {} created, {} closed, {} messages in, {} out",
        snapshot.connections_created_total,
        snapshot.connections_closed_total,
        snapshot.messages_received_total,
        snapshot.messages_sent_total
    );
    Ok(())
}
