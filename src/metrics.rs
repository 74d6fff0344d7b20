use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics for observability
///
/// Counters are shared by the manager, its shards and every connection.
/// Use `snapshot()` for a point-in-time view, or the individual getters.
///
/// # Example
/// ```ignore
/// let metrics = manager.metrics();
/// println!("Connections created: {}", metrics.connections_created());
/// println!("Pings received: {}", metrics.pings_received());
/// ```
#[derive(Debug, Default)]
pub struct Metrics {
    // Counter fields - private, exposed via getters
    connections_created_total: AtomicU64,
    connections_closed_total: AtomicU64,
    duplicate_rejections_total: AtomicU64,
    messages_received_total: AtomicU64,
    messages_sent_total: AtomicU64,
    responses_matched_total: AtomicU64,
    pings_received_total: AtomicU64,
    pongs_sent_total: AtomicU64,
    write_timeouts_total: AtomicU64,
    write_errors_total: AtomicU64,
    handler_errors_total: AtomicU64,
    registry_errors_total: AtomicU64,
}

impl Metrics {
    /// Create a new Metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Getters ==========

    /// Get total connections that passed registration
    pub fn connections_created(&self) -> u64 {
        self.connections_created_total.load(Ordering::Relaxed)
    }

    /// Get total connections that finished closing
    pub fn connections_closed(&self) -> u64 {
        self.connections_closed_total.load(Ordering::Relaxed)
    }

    /// Get total creates rejected as duplicates
    pub fn duplicate_rejections(&self) -> u64 {
        self.duplicate_rejections_total.load(Ordering::Relaxed)
    }

    /// Get total inbound data frames
    pub fn messages_received(&self) -> u64 {
        self.messages_received_total.load(Ordering::Relaxed)
    }

    /// Get total outbound data frames written
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent_total.load(Ordering::Relaxed)
    }

    /// Get total inbound frames delivered to a pending request
    pub fn responses_matched(&self) -> u64 {
        self.responses_matched_total.load(Ordering::Relaxed)
    }

    /// Get total pings received
    pub fn pings_received(&self) -> u64 {
        self.pings_received_total.load(Ordering::Relaxed)
    }

    /// Get total pongs written
    pub fn pongs_sent(&self) -> u64 {
        self.pongs_sent_total.load(Ordering::Relaxed)
    }

    /// Get total writes that exceeded the write timeout
    pub fn write_timeouts(&self) -> u64 {
        self.write_timeouts_total.load(Ordering::Relaxed)
    }

    /// Get total failed writes
    pub fn write_errors(&self) -> u64 {
        self.write_errors_total.load(Ordering::Relaxed)
    }

    /// Get total handler errors and panics
    pub fn handler_errors(&self) -> u64 {
        self.handler_errors_total.load(Ordering::Relaxed)
    }

    /// Get total failed registry operations
    pub fn registry_errors(&self) -> u64 {
        self.registry_errors_total.load(Ordering::Relaxed)
    }

    // ========== Recording methods (called internally) ==========

    pub(crate) fn record_connection_created(&self) {
        self.connections_created_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connection_closed(&self) {
        self.connections_closed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_duplicate_rejection(&self) {
        self.duplicate_rejections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_message_received(&self) {
        self.messages_received_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_message_sent(&self) {
        self.messages_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_response_matched(&self) {
        self.responses_matched_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ping(&self) {
        self.pings_received_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_pong(&self) {
        self.pongs_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write_timeout(&self) {
        self.write_timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write_error(&self) {
        self.write_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handler_error(&self) {
        self.handler_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_registry_error(&self) {
        self.registry_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a point-in-time snapshot of the counters.
    ///
    /// `live_connections` and `shard_connections` are gauges owned by the
    /// manager; [`ConnectionManager::metrics_snapshot`](crate::ConnectionManager::metrics_snapshot)
    /// fills them in.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_created_total: self.connections_created_total.load(Ordering::Acquire),
            connections_closed_total: self.connections_closed_total.load(Ordering::Acquire),
            duplicate_rejections_total: self.duplicate_rejections_total.load(Ordering::Acquire),
            messages_received_total: self.messages_received_total.load(Ordering::Acquire),
            messages_sent_total: self.messages_sent_total.load(Ordering::Acquire),
            responses_matched_total: self.responses_matched_total.load(Ordering::Acquire),
            pings_received_total: self.pings_received_total.load(Ordering::Acquire),
            pongs_sent_total: self.pongs_sent_total.load(Ordering::Acquire),
            write_timeouts_total: self.write_timeouts_total.load(Ordering::Acquire),
            write_errors_total: self.write_errors_total.load(Ordering::Acquire),
            handler_errors_total: self.handler_errors_total.load(Ordering::Acquire),
            registry_errors_total: self.registry_errors_total.load(Ordering::Acquire),
            live_connections: 0,
            shard_connections: Vec::new(),
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub connections_created_total: u64,
    pub connections_closed_total: u64,
    pub duplicate_rejections_total: u64,
    pub messages_received_total: u64,
    pub messages_sent_total: u64,
    pub responses_matched_total: u64,
    pub pings_received_total: u64,
    pub pongs_sent_total: u64,
    pub write_timeouts_total: u64,
    pub write_errors_total: u64,
    pub handler_errors_total: u64,
    pub registry_errors_total: u64,
    /// Connections currently registered across all shards
    pub live_connections: usize,
    /// Connections currently registered, per shard
    pub shard_connections: Vec<usize>,
}
