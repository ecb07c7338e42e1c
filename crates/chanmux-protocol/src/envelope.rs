//! Envelope types exchanged on a channel.
//!
//! Wire shape, in both directions:
//!
//! ```text
//! {"channel": "c1", "type": "subscribe", "body": "temps"}
//! ```
//!
//! Inbound bodies are kept as raw JSON until a handler asks for a concrete
//! shape; outbound bodies are serialized when the envelope is written.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;

/// Body text used when an inbound envelope has no body.
const NULL_BODY: &str = "null";

/// Type tags handled by the connection itself rather than by user handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    /// Acknowledges the start of a channel's stream
    Open,
    /// Destroys the channel and its subscriptions
    Close,
    /// Adds a topic to the channel's subscriptions
    Subscribe,
    /// Error report
    Error,
}

impl Builtin {
    pub const ALL: [Builtin; 4] = [Self::Open, Self::Close, Self::Subscribe, Self::Error];

    /// Maps a type tag to a built-in, if it is reserved.
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "open" => Some(Self::Open),
            "close" => Some(Self::Close),
            "subscribe" => Some(Self::Subscribe),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Close => "close",
            Self::Subscribe => "subscribe",
            Self::Error => "error",
        }
    }
}

/// Whether `kind` is reserved for the protocol.
pub fn is_reserved(kind: &str) -> bool {
    Builtin::parse(kind).is_some()
}

/// An envelope received from a peer, body still undecoded.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEnvelope {
    pub channel: String,

    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    body: Option<Box<RawValue>>,
}

impl InboundEnvelope {
    /// Parses one text frame.
    ///
    /// # Errors
    ///
    /// - `EnvelopeError::Malformed` if the frame is not a JSON envelope
    /// - `EnvelopeError::EmptyChannel` if the channel name is empty
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let envelope: Self =
            serde_json::from_str(text).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        if envelope.channel.is_empty() {
            return Err(EnvelopeError::EmptyChannel);
        }
        Ok(envelope)
    }

    /// The reserved type this envelope carries, if any.
    pub fn builtin(&self) -> Option<Builtin> {
        Builtin::parse(&self.kind)
    }

    /// Raw JSON text of the body (`null` when absent).
    pub fn raw_body(&self) -> &str {
        self.body.as_deref().map_or(NULL_BODY, RawValue::get)
    }

    /// Decodes the body into `T`.
    ///
    /// # Errors
    ///
    /// Returns `EnvelopeError::Body` when the body does not conform to `T`.
    pub fn unpack<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        serde_json::from_str(self.raw_body()).map_err(|e| EnvelopeError::Body(e.to_string()))
    }
}

/// An envelope ready to be written to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Connection id, present on server-addressed writes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,

    pub channel: String,

    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub body: serde_json::Value,
}

impl Envelope {
    pub fn new(
        channel: impl Into<String>,
        kind: impl Into<String>,
        body: serde_json::Value,
    ) -> Self {
        Self {
            client: None,
            channel: channel.into(),
            kind: kind.into(),
            body,
        }
    }

    /// Creates an `error` envelope carrying `message`.
    pub fn error(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            channel,
            Builtin::Error.as_str(),
            serde_json::Value::String(message.into()),
        )
    }

    /// Tags the envelope with the addressed connection id.
    #[must_use]
    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.client = Some(client.into());
        self
    }

    /// Whether this is an `error` envelope.
    pub fn is_error(&self) -> bool {
        self.kind == Builtin::Error.as_str()
    }

    /// Serializes to one text frame.
    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(|e| EnvelopeError::Encode(e.to_string()))
    }
}

/// Errors from envelope encoding and decoding.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("Malformed envelope: {0}")]
    Malformed(String),

    #[error("Envelope channel must not be empty")]
    EmptyChannel,

    #[error("{0}")]
    Body(String),

    #[error("Failed to encode envelope: {0}")]
    Encode(String),
}
