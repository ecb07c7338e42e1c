//! chanmux Core - Shared types for channel multiplexing
//!
//! This crate provides the domain types shared by the server crate
//! (`chanmuxd`) and any diagnostics layer built on top of it:
//! - `lock` - Named read/write locks with a registry for introspection
//! - `stats` - Lock-free traffic counters
//! - `channel` - Per-connection channel with its topic subscriptions
//! - `view` - Serializable snapshots for debug endpoints
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod channel;
pub mod error;
pub mod id;
pub mod lock;
pub mod stats;
pub mod view;

// Re-exports for convenience
pub use channel::{Channel, ChannelView};
pub use error::{DomainError, DomainResult};
pub use id::{PeerId, Topic};
pub use lock::{LockEntry, LockRegistry, LockView, NamedLock, NamedReadGuard, NamedWriteGuard};
pub use stats::{Stats, StatsView};
pub use view::{ConnectionState, ConnectionView};
