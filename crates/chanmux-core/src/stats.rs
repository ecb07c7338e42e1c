//! Traffic counters attached to connections and channels.
//!
//! Counters are lock-free so that diagnostic reads never block the I/O
//! paths that bump them.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel for "no activity yet".
const NEVER: i64 = i64::MIN;

/// Sent/received counts with last-activity timestamps.
#[derive(Debug)]
pub struct Stats {
    sent: AtomicU64,
    last_sent_ms: AtomicI64,
    received: AtomicU64,
    last_received_ms: AtomicI64,
}

impl Stats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self {
            sent: AtomicU64::new(0),
            last_sent_ms: AtomicI64::new(NEVER),
            received: AtomicU64::new(0),
            last_received_ms: AtomicI64::new(NEVER),
        }
    }

    /// Records one outbound envelope.
    pub fn increment_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.last_sent_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Records one inbound envelope.
    pub fn increment_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.last_received_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Time of the last outbound envelope, if any.
    pub fn last_sent(&self) -> Option<DateTime<Utc>> {
        from_millis(self.last_sent_ms.load(Ordering::Relaxed))
    }

    /// Time of the last inbound envelope, if any.
    pub fn last_received(&self) -> Option<DateTime<Utc>> {
        from_millis(self.last_received_ms.load(Ordering::Relaxed))
    }

    /// Point-in-time copy for diagnostics.
    ///
    /// Individual fields are read independently, so a view taken while
    /// traffic is flowing may pair a count with a slightly newer timestamp.
    pub fn view(&self) -> StatsView {
        StatsView {
            sent: self.sent(),
            last_sent: self.last_sent(),
            received: self.received(),
            last_received: self.last_received(),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    if ms == NEVER {
        None
    } else {
        DateTime::from_timestamp_millis(ms)
    }
}

/// Serializable snapshot of [`Stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsView {
    pub sent: u64,
    pub last_sent: Option<DateTime<Utc>>,
    pub received: u64,
    pub last_received: Option<DateTime<Utc>>,
}
