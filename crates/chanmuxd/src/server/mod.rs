//! Connection registry, publish fan-out and the WebSocket listener.
//!
//! The server:
//! - Accepts TCP connections and upgrades them to WebSocket
//! - Reads each peer's identity frame and registers a [`Connection`]
//! - Routes inbound envelopes to handlers registered with [`Server::handle`]
//! - Fans [`Server::publish`] out to every subscribed channel
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │       Server        │
//! │                     │       "server.handlers"
//! │    TcpListener      │──────▶ HandlerTable
//! └─────────┬───────────┘
//!           │ accept() + upgrade + identity
//!           ▼
//! ┌─────────────────────┐       "server.clients"
//! │     Connection      │◀────── HashMap<PeerId, Arc<Connection>>
//! │  (per peer, actor)  │
//! └─────────┬───────────┘
//!           │ handler tasks
//!           ▼
//! ┌─────────────────────┐
//! │  Request /          │── publish ──▶ every subscribed channel
//! │  ResponseWriter     │── write ────▶ originating channel
//! └─────────────────────┘
//! ```
//!
//! # Duplicate ids
//!
//! Registration is last-writer-wins. A connection registering under an id
//! that is already live replaces the old entry; the old connection is not
//! closed and keeps running until its own transport ends. When it then
//! deregisters it leaves its replacement in place and only releases its own
//! lock entries.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the crate's panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Server errors are logged and allow continued operation

mod connection;

pub use connection::{Connection, ConnectionError};

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use chanmux_core::{ConnectionView, LockRegistry, LockView, NamedLock, PeerId, Topic};
use chanmux_protocol::Envelope;

use crate::config::ServerConfig;
use crate::handler::{
    handler_fn, Handler, HandlerError, HandlerTable, RegistrationError, Request, ResponseWriter,
};
use crate::transport::{self, FrameSink, FrameStream};

/// Lock key of the connection registry
pub const CLIENTS_LOCK: &str = "server.clients";

/// Lock key of the handler table
pub const HANDLERS_LOCK: &str = "server.handlers";

/// Channel multiplexing server.
///
/// Cheap to clone; clones share the same registry, handlers and locks.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

struct Inner {
    config: ServerConfig,

    locks: Arc<LockRegistry>,

    /// Live connections keyed by peer id
    connections: NamedLock<HashMap<PeerId, Arc<Connection>>>,

    handlers: NamedLock<HandlerTable>,

    /// Registration counter, tells apart connections sharing an id
    serial: AtomicU64,

    /// Cancellation token for graceful shutdown
    cancel_token: CancellationToken,

    /// Per-connection tasks
    tasks: TaskTracker,
}

impl Server {
    /// Creates a server with its own lock registry.
    ///
    /// # Arguments
    ///
    /// * `config` - Listener address and per-connection limits
    /// * `cancel_token` - Token for graceful shutdown; each connection gets a child token
    pub fn new(config: ServerConfig, cancel_token: CancellationToken) -> Self {
        Self::with_locks(config, cancel_token, Arc::new(LockRegistry::new()))
    }

    /// Creates a server that registers its locks in `locks`.
    pub fn with_locks(
        config: ServerConfig,
        cancel_token: CancellationToken,
        locks: Arc<LockRegistry>,
    ) -> Self {
        let connections = locks.guard(CLIENTS_LOCK, HashMap::new());
        let handlers = locks.guard(HANDLERS_LOCK, HandlerTable::new());
        Self {
            inner: Arc::new(Inner {
                config,
                locks,
                connections,
                handlers,
                serial: AtomicU64::new(0),
                cancel_token,
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn locks(&self) -> &Arc<LockRegistry> {
        &self.inner.locks
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel_token
    }

    // ------------------------------------------------------------------
    // Handler registration
    // ------------------------------------------------------------------

    /// Registers `handler` for messages of type `kind`.
    ///
    /// Call before serving; a failure here is a startup configuration error.
    pub async fn handle(
        &self,
        kind: impl Into<String>,
        handler: impl Handler,
    ) -> Result<(), ServerError> {
        let kind = kind.into();
        self.inner
            .handlers
            .write()
            .await
            .insert(kind.clone(), Arc::new(handler))?;
        info!(kind = %kind, "Registered handler");
        Ok(())
    }

    /// Registers an async closure for messages of type `kind`.
    pub async fn handle_fn<F, Fut>(&self, kind: impl Into<String>, f: F) -> Result<(), ServerError>
    where
        F: Fn(Request, ResponseWriter) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.handle(kind, handler_fn(f)).await
    }

    pub(crate) async fn handler(&self, kind: &str) -> Option<Arc<dyn Handler>> {
        self.inner.handlers.read().await.get(kind)
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Serves one already-framed transport to completion.
    ///
    /// Reads the identity frame, registers the connection and runs its read
    /// loop. Returns after the connection has drained and deregistered.
    pub async fn accept(&self, sink: FrameSink, mut frames: FrameStream) -> Result<(), ServerError> {
        let identify_timeout = self.inner.config.identify_timeout();
        let result = tokio::select! {
            _ = self.inner.cancel_token.cancelled() => return Err(ServerError::ShuttingDown),
            result = timeout(identify_timeout, frames.next()) => result,
        };
        let identity = match result {
            Ok(Some(Ok(text))) => text,
            Ok(Some(Err(e))) => return Err(ServerError::Handshake(e.to_string())),
            Ok(None) => {
                return Err(ServerError::Handshake(
                    "connection closed before identifying".to_string(),
                ))
            }
            Err(_) => return Err(ServerError::IdentifyTimeout(identify_timeout)),
        };

        if identity.len() > self.inner.config.max_frame_size {
            return Err(ServerError::Handshake(format!(
                "identity frame of {} bytes exceeds limit",
                identity.len()
            )));
        }
        let id = PeerId::parse(&identity).map_err(|e| ServerError::Handshake(e.to_string()))?;

        let connection = self.register(id, sink).await;
        connection.run(self.clone(), frames).await;
        Ok(())
    }

    /// Spawns [`accept`](Self::accept) on a task tracked for shutdown.
    pub fn spawn_connection(&self, sink: FrameSink, frames: FrameStream) -> JoinHandle<()> {
        let server = self.clone();
        self.inner.tasks.spawn(async move {
            if let Err(e) = server.accept(sink, frames).await {
                warn!(error = %e, "Connection rejected");
            }
        })
    }

    async fn register(&self, id: PeerId, sink: FrameSink) -> Arc<Connection> {
        let serial = self.inner.serial.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(Connection::new(
            id.clone(),
            serial,
            sink,
            &self.inner.locks,
            &self.inner.config,
            self.inner.cancel_token.child_token(),
        ));

        let previous = self
            .inner
            .connections
            .write()
            .await
            .insert(id.clone(), Arc::clone(&connection));

        if previous.is_some() {
            info!(peer_id = %id, "Replaced existing connection");
        } else {
            info!(peer_id = %id, "Registered connection");
        }
        connection
    }

    /// Removes `connection` from the registry (unless it has been replaced)
    /// and releases its lock entries.
    pub(crate) async fn deregister(&self, connection: &Connection) {
        {
            let mut connections = self.inner.connections.write().await;
            let is_current = connections
                .get(connection.id())
                .is_some_and(|c| c.serial() == connection.serial());
            if is_current {
                connections.remove(connection.id());
            } else {
                debug!(peer_id = %connection.id(), "Superseded connection left registry untouched");
            }
        }
        connection.release_locks(&self.inner.locks);
        debug!(peer_id = %connection.id(), "Deregistered connection");
    }

    /// Live connection registered under `peer`.
    pub async fn connection(&self, peer: &PeerId) -> Option<Arc<Connection>> {
        self.inner.connections.read().await.get(peer).cloned()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.read().await.len()
    }

    /// Asks the connection registered under `peer` to drain and close.
    pub async fn disconnect(&self, peer: &PeerId) -> bool {
        match self.connection(peer).await {
            Some(connection) => {
                connection.close();
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------

    /// Writes one envelope to `channel` on the connection registered under
    /// `peer`. The envelope carries the peer id in its `client` field.
    ///
    /// Unknown peers and channels are silent no-ops; returns whether the
    /// envelope was delivered.
    pub async fn write<T: Serialize + ?Sized>(
        &self,
        peer: &PeerId,
        channel: &str,
        kind: &str,
        body: &T,
    ) -> bool {
        let Some(connection) = self.connection(peer).await else {
            debug!(peer_id = %peer, channel, kind, "Write to unknown peer");
            return false;
        };

        match serde_json::to_value(body) {
            Ok(body) => {
                let envelope = Envelope::new(channel, kind, body).with_client(peer.as_str());
                connection.deliver(&envelope).await
            }
            Err(e) => {
                warn!(peer_id = %peer, channel, kind, error = %e, "Failed to serialize body");
                false
            }
        }
    }

    /// Delivers one envelope to every channel, on every live connection,
    /// subscribed to `topic`.
    ///
    /// Connections are written concurrently; channels of one connection are
    /// written one after another. Returns the number of channels reached.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        kind: &str,
        body: &T,
    ) -> usize {
        let topic = match Topic::parse(topic) {
            Ok(topic) => topic,
            Err(e) => {
                warn!(topic, kind, error = %e, "Invalid publish topic");
                return 0;
            }
        };
        let body = match serde_json::to_value(body) {
            Ok(body) => body,
            Err(e) => {
                warn!(topic = %topic, kind, error = %e, "Failed to serialize body");
                return 0;
            }
        };

        let connections: Vec<Arc<Connection>> = self
            .inner
            .connections
            .read()
            .await
            .values()
            .cloned()
            .collect();

        let delivered: usize = join_all(
            connections
                .iter()
                .map(|connection| connection.publish(&topic, kind, &body)),
        )
        .await
        .into_iter()
        .sum();

        if delivered == 0 {
            debug!(topic = %topic, kind, "Publish reached no subscribers");
        } else {
            debug!(topic = %topic, kind, delivered, "Published");
        }
        delivered
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Connection and lock state for a debug endpoint.
    pub async fn snapshot(&self) -> ServerSnapshot {
        let connections: Vec<Arc<Connection>> = self
            .inner
            .connections
            .read()
            .await
            .values()
            .cloned()
            .collect();

        let mut views = join_all(connections.iter().map(|c| c.view())).await;
        views.sort_by(|a, b| a.id.cmp(&b.id));

        ServerSnapshot {
            connections: views,
            locks: self.inner.locks.snapshot(),
        }
    }

    // ------------------------------------------------------------------
    // Listener
    // ------------------------------------------------------------------

    /// Binds `listen_addr` and serves until the cancellation token fires.
    pub async fn run(&self) -> Result<(), ServerError> {
        let addr = self.inner.config.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr,
                error: e.to_string(),
            })?;
        self.serve(listener).await
    }

    /// Accepts WebSocket connections on `listener` until the cancellation
    /// token fires, then waits for every connection to drain.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        match listener.local_addr() {
            Ok(addr) => info!(addr = %addr, "Server listening"),
            Err(e) => warn!(error = %e, "Server listening on unknown address"),
        }

        loop {
            tokio::select! {
                _ = self.inner.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.handle_stream(stream, addr),
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            // Continue accepting other connections
                        }
                    }
                }
            }
        }

        drop(listener);
        self.wait().await;
        info!("Server stopped");
        Ok(())
    }

    /// Upgrades `stream` and serves it on a tracked task.
    fn handle_stream(&self, stream: TcpStream, addr: SocketAddr) {
        let server = self.clone();
        self.inner.tasks.spawn(async move {
            let ws_config = server.websocket_config();
            let upgrade = timeout(
                server.inner.config.identify_timeout(),
                tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)),
            );
            let ws = tokio::select! {
                _ = server.inner.cancel_token.cancelled() => {
                    debug!(addr = %addr, "Shutdown before WebSocket upgrade");
                    return;
                }
                result = upgrade => match result {
                    Ok(Ok(ws)) => ws,
                    Ok(Err(e)) => {
                        warn!(addr = %addr, error = %e, "WebSocket upgrade failed");
                        return;
                    }
                    Err(_) => {
                        warn!(addr = %addr, "WebSocket upgrade timed out");
                        return;
                    }
                },
            };
            debug!(addr = %addr, "WebSocket upgraded");

            let (sink, frames) = transport::websocket(ws);
            if let Err(e) = server.accept(sink, frames).await {
                warn!(addr = %addr, error = %e, "Connection rejected");
            }
        });
    }

    /// Message and frame limits handed to tungstenite, so oversized frames
    /// are refused before they are buffered.
    fn websocket_config(&self) -> WebSocketConfig {
        let max = self.inner.config.max_frame_size;
        WebSocketConfig::default()
            .max_message_size(Some(max))
            .max_frame_size(Some(max))
    }

    /// Cancels the server token, then waits for every tracked connection to
    /// drain.
    pub async fn shutdown(&self) {
        self.inner.cancel_token.cancel();
        self.wait().await;
    }

    async fn wait(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }
}

/// Serializable state of the whole server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSnapshot {
    /// Sorted by peer id
    pub connections: Vec<ConnectionView>,
    pub locks: BTreeMap<String, LockView>,
}

impl ServerSnapshot {
    pub fn connection(&self, peer: &str) -> Option<&ConnectionView> {
        self.connections.iter().find(|c| c.id.as_str() == peer)
    }
}

/// Server-level errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {error}")]
    Bind { addr: SocketAddr, error: String },

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Peer did not identify within {0:?}")]
    IdentifyTimeout(Duration),

    #[error("Server is shutting down")]
    ShuttingDown,
}
