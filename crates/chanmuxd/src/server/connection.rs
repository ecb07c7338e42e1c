//! Connection actor for one peer.
//!
//! Each identified peer gets a `Connection` that:
//! - Reads frames in order and demultiplexes them onto channels
//! - Applies the built-in `open`, `close` and `subscribe` types in-line
//! - Spawns a task per handler invocation, bounded by `max_in_flight`
//! - Serializes every outbound write through the `<id>.io` lock
//! - Drains in-flight handlers before releasing its locks on shutdown
//!
//! # Locks
//!
//! ```text
//! "<id>"     NamedLock<HashMap<String, Channel>>   channel map
//! "<id>.io"  NamedLock<()>                         outbound write path
//! ```
//!
//! A write holds the channel map shared while it confirms the target channel
//! exists, then takes the I/O lock exclusively for the socket write. The
//! channel map is never taken while the I/O lock is held.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the crate's panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Connection errors are logged and result in a drain-and-deregister

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, debug_span, info, warn, Instrument};

use chanmux_core::{
    Channel, ConnectionState, ConnectionView, LockRegistry, NamedLock, PeerId, Stats, Topic,
};
use chanmux_protocol::{Builtin, Envelope, EnvelopeError, InboundEnvelope};

use crate::config::ServerConfig;
use crate::handler::{HandlerError, Request, ResponseWriter};
use crate::server::Server;
use crate::transport::{FrameSink, FrameStream, TransportError};

/// Errors that end a connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("Frame of {size} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Write timed out after {0:?}")]
    WriteTimeout(Duration),
}

/// One live peer session.
pub struct Connection {
    id: PeerId,

    /// Distinguishes this connection from a later one under the same id
    serial: u64,

    channels: NamedLock<HashMap<String, Channel>>,

    io: NamedLock<()>,

    /// Only locked while `io` is held exclusively
    sink: Mutex<FrameSink>,

    stats: Stats,

    state: parking_lot::Mutex<ConnectionState>,

    /// In-flight handler tasks
    tasks: TaskTracker,

    in_flight: Arc<Semaphore>,

    max_in_flight: usize,

    connected_at: DateTime<Utc>,

    write_timeout: Duration,

    max_frame_size: usize,

    shutdown: CancellationToken,
}

impl Connection {
    pub(crate) fn new(
        id: PeerId,
        serial: u64,
        sink: FrameSink,
        locks: &LockRegistry,
        config: &ServerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let max_in_flight = config.max_in_flight.max(1);
        Self {
            channels: locks.guard(id.as_str(), HashMap::new()),
            io: locks.create_lock(id.io_lock_key()),
            id,
            serial,
            sink: Mutex::new(sink),
            stats: Stats::new(),
            state: parking_lot::Mutex::new(ConnectionState::Open),
            tasks: TaskTracker::new(),
            in_flight: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            connected_at: Utc::now(),
            write_timeout: config.write_timeout(),
            max_frame_size: config.max_frame_size,
            shutdown,
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Handler invocations currently running.
    pub fn in_flight(&self) -> usize {
        self.max_in_flight
            .saturating_sub(self.in_flight.available_permits())
    }

    /// Asks the connection to stop reading and drain.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Snapshot for diagnostics, channels sorted by name.
    pub async fn view(&self) -> ConnectionView {
        let mut channels: Vec<_> = self
            .channels
            .read()
            .await
            .values()
            .map(Channel::view)
            .collect();
        channels.sort_by(|a, b| a.name.cmp(&b.name));

        ConnectionView {
            id: self.id.clone(),
            state: self.state(),
            connected_at: self.connected_at,
            in_flight: self.in_flight(),
            stats: self.stats.view(),
            channels,
        }
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Writes `envelope` if its channel still exists.
    ///
    /// Returns `true` when the frame reached the transport. A transport
    /// failure closes the connection.
    pub(crate) async fn deliver(&self, envelope: &Envelope) -> bool {
        match self.try_deliver(envelope).await {
            Ok(delivered) => delivered,
            Err(e @ ConnectionError::Envelope(_)) => {
                warn!(
                    peer_id = %self.id,
                    channel = %envelope.channel,
                    kind = %envelope.kind,
                    error = %e,
                    "Failed to encode envelope"
                );
                false
            }
            Err(e) => {
                warn!(peer_id = %self.id, error = %e, "Write failed, closing connection");
                self.close();
                false
            }
        }
    }

    async fn try_deliver(&self, envelope: &Envelope) -> Result<bool, ConnectionError> {
        let channels = self.channels.read().await;
        let Some(channel) = channels.get(&envelope.channel) else {
            info!(
                peer_id = %self.id,
                channel = %envelope.channel,
                kind = %envelope.kind,
                "Dropping write to unknown channel"
            );
            return Ok(false);
        };

        let frame = envelope.to_json()?;

        let _io = self.io.write().await;
        self.write_frame(frame).await?;
        channel.stats().increment_sent();
        self.stats.increment_sent();

        debug!(
            peer_id = %self.id,
            channel = %envelope.channel,
            kind = %envelope.kind,
            "Sent envelope"
        );
        Ok(true)
    }

    /// Caller must hold `io` exclusively.
    async fn write_frame(&self, frame: String) -> Result<(), ConnectionError> {
        let mut sink = self.sink.lock().await;
        match timeout(self.write_timeout, sink.send(frame)).await {
            Ok(result) => result.map_err(ConnectionError::from),
            Err(_) => Err(ConnectionError::WriteTimeout(self.write_timeout)),
        }
    }

    /// Serializes `body` and writes it on `channel`.
    pub(crate) async fn send<T: Serialize + ?Sized>(
        &self,
        channel: &str,
        kind: &str,
        body: &T,
    ) -> bool {
        match serde_json::to_value(body) {
            Ok(body) => self.deliver(&Envelope::new(channel, kind, body)).await,
            Err(e) => {
                warn!(peer_id = %self.id, channel, kind, error = %e, "Failed to serialize body");
                false
            }
        }
    }

    pub(crate) async fn send_error(&self, channel: &str, message: &str) -> bool {
        self.deliver(&Envelope::error(channel, message)).await
    }

    /// Delivers one envelope to each of this connection's channels
    /// subscribed to `topic`. Returns the number delivered.
    pub(crate) async fn publish(&self, topic: &Topic, kind: &str, body: &Value) -> usize {
        let targets: Vec<String> = self
            .channels
            .read()
            .await
            .values()
            .filter(|c| c.is_subscribed(topic))
            .map(|c| c.name().to_owned())
            .collect();

        let mut delivered = 0;
        for name in targets {
            if self.deliver(&Envelope::new(name, kind, body.clone())).await {
                delivered += 1;
            }
        }
        delivered
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Reads frames until EOF, a transport error, a protocol violation or
    /// shutdown, then drains.
    pub(crate) async fn run(self: Arc<Self>, server: Server, mut frames: FrameStream) {
        info!(peer_id = %self.id, "Connection open");

        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!(peer_id = %self.id, "Connection shutdown requested");
                    break;
                }
                frame = frames.next() => frame,
            };

            match frame {
                Some(Ok(text)) => {
                    if let Err(e) = self.handle_frame(&server, text).await {
                        warn!(peer_id = %self.id, error = %e, "Closing connection");
                        break;
                    }
                }
                Some(Err(TransportError::Closed)) | None => {
                    debug!(peer_id = %self.id, "Peer disconnected");
                    break;
                }
                Some(Err(e)) => {
                    warn!(peer_id = %self.id, error = %e, "Transport error");
                    break;
                }
            }
        }

        drop(frames);
        self.drain(&server).await;
    }

    async fn handle_frame(self: &Arc<Self>, server: &Server, text: String) -> Result<(), ConnectionError> {
        if text.len() > self.max_frame_size {
            return Err(ConnectionError::FrameTooLarge {
                size: text.len(),
                max: self.max_frame_size,
            });
        }

        self.stats.increment_received();
        let envelope = InboundEnvelope::parse(&text)?;

        debug!(
            peer_id = %self.id,
            channel = %envelope.channel,
            kind = %envelope.kind,
            "Received envelope"
        );

        self.resolve_channel(&envelope.channel).await;

        match envelope.builtin() {
            Some(Builtin::Open) => {
                debug!(peer_id = %self.id, channel = %envelope.channel, "Channel opened");
            }
            Some(Builtin::Close) => self.close_channel(&envelope.channel).await,
            Some(Builtin::Subscribe) => self.subscribe(&envelope).await,
            Some(Builtin::Error) => {
                warn!(
                    peer_id = %self.id,
                    channel = %envelope.channel,
                    body = envelope.raw_body(),
                    "Peer reported error"
                );
            }
            None => self.dispatch(server, envelope).await,
        }
        Ok(())
    }

    /// Finds or creates `name` and counts the inbound envelope against it.
    async fn resolve_channel(&self, name: &str) {
        if let Some(channel) = self.channels.read().await.get(name) {
            channel.stats().increment_received();
            return;
        }

        let mut channels = self.channels.write().await;
        let channel = channels.entry(name.to_owned()).or_insert_with(|| {
            debug!(peer_id = %self.id, channel = name, "Channel created");
            Channel::new(name)
        });
        channel.stats().increment_received();
    }

    async fn close_channel(&self, name: &str) {
        if let Some(channel) = self.channels.write().await.remove(name) {
            debug!(
                peer_id = %self.id,
                channel = name,
                subscriptions = channel.subscriptions().len(),
                "Channel closed"
            );
        }
    }

    async fn subscribe(&self, envelope: &InboundEnvelope) {
        let topic = envelope
            .unpack::<String>()
            .map_err(|e| e.to_string())
            .and_then(|raw| Topic::parse(&raw).map_err(|e| e.to_string()));

        let topic = match topic {
            Ok(topic) => topic,
            Err(message) => {
                warn!(
                    peer_id = %self.id,
                    channel = %envelope.channel,
                    error = %message,
                    "Invalid subscribe"
                );
                self.send_error(&envelope.channel, &message).await;
                return;
            }
        };

        let mut channels = self.channels.write().await;
        // A racing close may already have removed the channel.
        if let Some(channel) = channels.get_mut(&envelope.channel) {
            if channel.subscribe(topic.clone()) {
                debug!(
                    peer_id = %self.id,
                    channel = %envelope.channel,
                    topic = %topic,
                    "Subscribed"
                );
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, server: &Server, envelope: InboundEnvelope) {
        let Some(handler) = server.handler(&envelope.kind).await else {
            warn!(
                peer_id = %self.id,
                channel = %envelope.channel,
                kind = %envelope.kind,
                "Unknown message type"
            );
            let message = format!("unknown type: {}", envelope.kind);
            self.send_error(&envelope.channel, &message).await;
            return;
        };

        // Waits for a free slot; the read loop pauses meanwhile.
        let Ok(permit) = Arc::clone(&self.in_flight).acquire_owned().await else {
            return;
        };

        let span = debug_span!(
            "handler",
            peer_id = %self.id,
            channel = %envelope.channel,
            kind = %envelope.kind
        );
        let channel = envelope.channel.clone();
        let connection = Arc::clone(self);
        let request = Request::new(Arc::clone(self), envelope);
        let writer = ResponseWriter::new(Arc::clone(self), server.clone(), channel.clone());

        self.tasks.spawn(
            async move {
                let _permit = permit;
                match handler.handle(request, writer).await {
                    Ok(()) | Err(HandlerError::Rejected) => {}
                    Err(HandlerError::Failed(message)) => {
                        debug!(error = %message, "Handler failed");
                        connection.send_error(&channel, &message).await;
                    }
                }
            }
            .instrument(span),
        );
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    async fn drain(&self, server: &Server) {
        self.set_state(ConnectionState::Draining);
        debug!(peer_id = %self.id, in_flight = self.in_flight(), "Draining");

        self.tasks.close();
        self.tasks.wait().await;

        {
            let _io = self.io.write().await;
            let mut sink = self.sink.lock().await;
            match timeout(self.write_timeout, sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(peer_id = %self.id, error = %e, "Error closing transport"),
                Err(_) => debug!(peer_id = %self.id, "Timed out closing transport"),
            }
        }

        server.deregister(self).await;
        self.set_state(ConnectionState::Closed);
        info!(peer_id = %self.id, "Connection closed");
    }

    /// Removes this connection's own entries from the lock registry.
    pub(crate) fn release_locks(&self, locks: &LockRegistry) {
        locks.release(&self.channels);
        locks.release(&self.io);
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }
}
