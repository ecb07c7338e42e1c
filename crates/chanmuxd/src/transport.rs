//! Framed transport boundary.
//!
//! The connection actor only needs a full-duplex stream of text frames.
//! This module defines that boundary and two adapters:
//! - [`websocket`] - an upgraded `tokio-tungstenite` stream
//! - [`memory`] - an in-process pair of channels, for embedding and tests

use std::pin::Pin;

use futures::channel::mpsc;
use futures::future;
use futures::stream::BoxStream;
use futures::{Sink, SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

/// Inbound text frames. The stream ends (or yields `Closed`) when the peer
/// goes away.
pub type FrameStream = BoxStream<'static, Result<String, TransportError>>;

/// Outbound text frames.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Errors raised by a transport. All of them are fatal to the connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Received non-UTF-8 binary frame ({len} bytes)")]
    NonUtf8 { len: usize },
}

/// Splits an upgraded WebSocket into a frame sink and stream.
///
/// Text frames and UTF-8 binary frames are delivered; ping/pong frames are
/// answered by tungstenite and skipped here; a close frame surfaces as
/// `TransportError::Closed`.
pub fn websocket<S>(ws: WebSocketStream<S>) -> (FrameSink, FrameStream)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();

    let sink = sink
        .sink_map_err(|e| TransportError::WebSocket(e.to_string()))
        .with(|text: String| future::ready(Ok::<_, TransportError>(Message::text(text))));

    let stream = stream.filter_map(|frame| future::ready(text_frame(frame)));

    (Box::pin(sink), stream.boxed())
}

fn text_frame(frame: Result<Message, WsError>) -> Option<Result<String, TransportError>> {
    match frame {
        Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
        Ok(Message::Binary(data)) => Some(
            String::from_utf8(data.to_vec()).map_err(|_| TransportError::NonUtf8 { len: data.len() }),
        ),
        Ok(Message::Close(_)) => Some(Err(TransportError::Closed)),
        Ok(_) => None,
        Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Some(Err(TransportError::Closed)),
        Err(e) => Some(Err(TransportError::WebSocket(e.to_string()))),
    }
}

/// The far end of a [`memory`] transport.
pub struct MemoryPeer {
    tx: mpsc::Sender<String>,
    rx: mpsc::Receiver<String>,
}

impl MemoryPeer {
    /// Sends a text frame to the server. Returns `false` once the server
    /// side has gone away.
    pub async fn send(&mut self, frame: impl Into<String>) -> bool {
        self.tx.send(frame.into()).await.is_ok()
    }

    /// Receives the next frame written by the server, or `None` after the
    /// server closed its write path.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.next().await
    }

    /// Closes the peer's write half, which the server sees as EOF.
    pub fn close(&mut self) {
        self.tx.close_channel();
    }
}

/// Creates an in-process transport with `buffer` frames of slack in each
/// direction.
pub fn memory(buffer: usize) -> (FrameSink, FrameStream, MemoryPeer) {
    let (to_peer, from_server) = mpsc::channel::<String>(buffer);
    let (to_server, from_peer) = mpsc::channel::<String>(buffer);

    let sink = to_peer.sink_map_err(|_| TransportError::Closed);
    let stream = from_peer.map(Ok::<String, TransportError>);

    (
        Box::pin(sink),
        stream.boxed(),
        MemoryPeer {
            tx: to_server,
            rx: from_server,
        },
    )
}
