use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;
use tokio::time::Duration;

/// Wall-clock time of the last ping, shared between a connection's read
/// task (the only writer) and any caller reading the timestamp.
#[derive(Debug)]
pub struct PingClock {
    /// Milliseconds since the Unix epoch
    last_pinged_ms: AtomicI64,
}

impl PingClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            last_pinged_ms: AtomicI64::new(at.timestamp_millis()),
        }
    }

    /// Record a ping at `now` and return the stored timestamp.
    ///
    /// The stored value never moves backwards, even if the wall clock does.
    pub fn record(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let now_ms = now.timestamp_millis();
        let prev = self.last_pinged_ms.fetch_max(now_ms, Ordering::AcqRel);
        millis_to_datetime(prev.max(now_ms))
    }

    pub fn last(&self) -> DateTime<Utc> {
        millis_to_datetime(self.last_pinged_ms.load(Ordering::Acquire))
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Tracks inbound activity for a single connection's read task
#[derive(Debug)]
pub struct IdleMonitor {
    idle_timeout: Option<Duration>,

    /// Time of last ping or data frame
    last_activity: Instant,
}

impl IdleMonitor {
    /// Create a new monitor; `None` disables idle detection
    pub fn new(idle_timeout: Option<Duration>) -> Self {
        Self {
            idle_timeout,
            last_activity: Instant::now(), // Start with "just heard from the peer"
        }
    }

    /// Record that we received a ping or data frame
    pub fn record_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Check if the idle timeout has been exceeded
    pub fn is_idle(&self) -> bool {
        match self.idle_timeout {
            None => false,
            Some(timeout) => self.last_activity.elapsed() >= timeout,
        }
    }

    /// Get time until the connection counts as idle, `None` if disabled
    pub fn time_until_idle(&self) -> Option<Duration> {
        self.idle_timeout
            .map(|timeout| timeout.saturating_sub(self.last_activity.elapsed()))
    }
}
