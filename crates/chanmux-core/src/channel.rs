//! A named logical sub-stream multiplexed over one connection.

use serde::{Deserialize, Serialize};

use crate::id::Topic;
use crate::stats::{Stats, StatsView};

/// Per-connection channel state: subscriptions plus traffic counters.
///
/// Channels are owned by the connection's channel map and are only
/// mutated under that map's write lock; the counters are atomic and can be
/// bumped under a read lock.
#[derive(Debug)]
pub struct Channel {
    name: String,
    subscriptions: Vec<Topic>,
    stats: Stats,
}

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscriptions: Vec::new(),
            stats: Stats::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Adds `topic` unless already present.
    ///
    /// Returns `true` if the subscription is new.
    pub fn subscribe(&mut self, topic: Topic) -> bool {
        if self.subscriptions.contains(&topic) {
            return false;
        }
        self.subscriptions.push(topic);
        true
    }

    pub fn is_subscribed(&self, topic: &Topic) -> bool {
        self.subscriptions.contains(topic)
    }

    pub fn subscriptions(&self) -> &[Topic] {
        &self.subscriptions
    }

    pub fn view(&self) -> ChannelView {
        ChannelView {
            name: self.name.clone(),
            stats: self.stats.view(),
            subscriptions: self
                .subscriptions
                .iter()
                .map(|t| t.as_str().to_string())
                .collect(),
        }
    }
}

/// Serializable snapshot of a [`Channel`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelView {
    pub name: String,
    pub stats: StatsView,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subscriptions: Vec<String>,
}
