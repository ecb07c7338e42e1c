//! chanmux Daemon - Channel multiplexing server
//!
//! This crate provides the server side of chanmux:
//! - `server` - Connection registry, publish fan-out and WebSocket listener
//! - `handler` - Handler registration and the request/response pair
//! - `transport` - Text-frame transport boundary (WebSocket and in-memory)
//! - `config` - Server configuration
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        chanmuxd                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │     Server      │────▶│       HandlerTable          │   │
//! │  │  (WebSocket)    │     │  (type → handler)           │   │
//! │  └────────┬────────┘     └──────────────┬──────────────┘   │
//! │           │                             │                   │
//! │           │ connections                 │ handler tasks     │
//! │           ▼                             ▼                   │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │   Connection    │────▶│  Request / ResponseWriter   │   │
//! │  │   (per peer)    │     │  (write, publish)           │   │
//! │  └─────────────────┘     └─────────────────────────────┘   │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Transport failures end only the affected connection

pub mod config;
pub mod handler;
pub mod server;
pub mod transport;

pub use config::{ConfigError, ServerConfig};
pub use handler::{
    handler_fn, FnHandler, Handler, HandlerError, HandlerTable, RegistrationError, Request,
    ResponseWriter,
};
pub use server::{Connection, ConnectionError, Server, ServerError, ServerSnapshot};
pub use transport::{FrameSink, FrameStream, MemoryPeer, TransportError};
