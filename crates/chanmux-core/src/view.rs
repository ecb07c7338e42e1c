//! Diagnostic views of connection state.
//!
//! These are the shapes handed to an external debug layer; they are built
//! explicitly from live state rather than serializing the live types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channel::ChannelView;
use crate::id::PeerId;
use crate::stats::StatsView;

/// Lifecycle of a connection actor.
///
/// `Open → Draining → Closed`; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Reading frames and dispatching handlers
    Open,
    /// No longer reading; waiting for in-flight handlers to finish
    Draining,
    /// Write path released and deregistered
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::Draining => "draining",
            Self::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// Serializable snapshot of one connection and its channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionView {
    pub id: PeerId,
    pub state: ConnectionState,
    pub connected_at: DateTime<Utc>,
    pub in_flight: usize,
    pub stats: StatsView,
    /// Sorted by channel name
    pub channels: Vec<ChannelView>,
}

impl ConnectionView {
    /// Looks up a channel by name.
    pub fn channel(&self, name: &str) -> Option<&ChannelView> {
        self.channels.iter().find(|c| c.name == name)
    }
}
