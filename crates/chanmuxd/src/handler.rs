//! Handler dispatch and the request/response pair handed to handlers.
//!
//! A handler is registered per message type with
//! [`Server::handle`](crate::server::Server::handle). Every inbound envelope
//! whose type is not reserved is looked up in the [`HandlerTable`] and, when
//! found, the handler runs on its own task with a [`Request`] and a
//! [`ResponseWriter`] bound to the originating channel.
//!
//! ```ignore
//! server
//!     .handle_fn("jira.get", |req, rw| async move {
//!         let query: IssueQuery = req.unpack().await?;
//!         rw.write("jira.issue", &lookup(&query)).await;
//!         Ok(())
//!     })
//!     .await?;
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Decode failures are reported to the peer, never propagated as panics

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use chanmux_core::PeerId;
use chanmux_protocol::{is_reserved, InboundEnvelope};

use crate::server::{Connection, Server};

/// Processes one message type.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, req: Request, rw: ResponseWriter) -> Result<(), HandlerError>;
}

/// Adapts an async closure into a [`Handler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Request, ResponseWriter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, req: Request, rw: ResponseWriter) -> Result<(), HandlerError> {
        (self.f)(req, rw).await
    }
}

/// Wraps `f` as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Request, ResponseWriter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

/// Message type → handler.
#[derive(Default)]
pub struct HandlerTable {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `kind`.
    ///
    /// # Errors
    ///
    /// - `RegistrationError::Reserved` for `open`, `close`, `subscribe`, `error`
    /// - `RegistrationError::Duplicate` if `kind` already has a handler
    pub fn insert(
        &mut self,
        kind: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<(), RegistrationError> {
        let kind = kind.into();
        if is_reserved(&kind) {
            return Err(RegistrationError::Reserved(kind));
        }
        if self.handlers.contains_key(&kind) {
            return Err(RegistrationError::Duplicate(kind));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered types, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// Handler registration failures. Fatal at startup.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("{0} has already been registered")]
    Duplicate(String),

    #[error("{0} is a reserved message type")]
    Reserved(String),
}

/// Outcome of a failed handler invocation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// The request body did not decode; the peer has already been sent an
    /// `error` envelope.
    #[error("Request body rejected")]
    Rejected,

    /// The handler failed; the message is sent to the peer as an `error`
    /// envelope on the originating channel.
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(e: anyhow::Error) -> Self {
        Self::Failed(format!("{e:#}"))
    }
}

/// An inbound envelope addressed to a handler.
pub struct Request {
    connection: Arc<Connection>,
    envelope: InboundEnvelope,
}

impl Request {
    pub(crate) fn new(connection: Arc<Connection>, envelope: InboundEnvelope) -> Self {
        Self {
            connection,
            envelope,
        }
    }

    /// Id of the connection the request arrived on.
    pub fn peer_id(&self) -> &PeerId {
        self.connection.id()
    }

    /// Originating channel.
    pub fn channel(&self) -> &str {
        &self.envelope.channel
    }

    /// Message type.
    pub fn kind(&self) -> &str {
        &self.envelope.kind
    }

    /// Undecoded body text.
    pub fn raw_body(&self) -> &str {
        self.envelope.raw_body()
    }

    /// Decodes the body into `T`.
    ///
    /// On failure exactly one `error` envelope carrying the decode message
    /// is written to the originating channel and `HandlerError::Rejected` is
    /// returned; the handler should return it with `?` and do nothing else.
    pub async fn unpack<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        match self.envelope.unpack() {
            Ok(value) => Ok(value),
            Err(e) => {
                debug!(
                    peer_id = %self.connection.id(),
                    channel = %self.envelope.channel,
                    kind = %self.envelope.kind,
                    error = %e,
                    "Rejected request body"
                );
                self.connection
                    .send_error(&self.envelope.channel, &e.to_string())
                    .await;
                Err(HandlerError::Rejected)
            }
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("peer_id", self.connection.id())
            .field("envelope", &self.envelope)
            .finish()
    }
}

/// Write access to the originating channel, plus server-wide publish.
#[derive(Clone)]
pub struct ResponseWriter {
    connection: Arc<Connection>,
    server: Server,
    channel: String,
}

impl ResponseWriter {
    pub(crate) fn new(connection: Arc<Connection>, server: Server, channel: String) -> Self {
        Self {
            connection,
            server,
            channel,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn peer_id(&self) -> &PeerId {
        self.connection.id()
    }

    /// Writes an envelope back on the originating channel.
    ///
    /// Returns `false` if the channel was closed in the meantime or the
    /// write failed; both are logged and otherwise ignored.
    pub async fn write<T: Serialize + ?Sized>(&self, kind: &str, body: &T) -> bool {
        self.connection.send(&self.channel, kind, body).await
    }

    /// Writes an `error` envelope on the originating channel.
    pub async fn error(&self, message: &str) -> bool {
        self.connection.send_error(&self.channel, message).await
    }

    /// Publishes to every channel subscribed to `topic`, on any connection.
    ///
    /// Returns the number of channels the envelope was delivered to.
    pub async fn publish<T: Serialize + ?Sized>(&self, topic: &str, kind: &str, body: &T) -> usize {
        self.server.publish(topic, kind, body).await
    }
}
