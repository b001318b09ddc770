//! Message transport abstraction.
//!
//! The relay core never touches sockets directly. Everything it needs from a
//! peer is captured by [`Connection`]: a sink of outgoing [`Payload`]s, a lazy
//! stream of incoming ones, and a close operation. The WebSocket adapter lives
//! in [`websocket`]; [`memory`] provides in-process connection pairs.

pub mod memory;
pub mod websocket;

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};

use crate::error::RelayError;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next identity. Identities are never reused.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// An opaque relayed message.
///
/// Cheap to clone: both variants are reference-counted buffers, so fanning a
/// payload out to many subscribers shares one allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(Utf8Bytes),
    Binary(Bytes),
}

impl Payload {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(Utf8Bytes::from(text.into()))
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::Binary(data.into())
    }

    /// Size of the payload in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.as_str().len(),
            Self::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Binary(_) => "binary",
        }
    }

    /// Extract the relayable part of a WebSocket message.
    ///
    /// Control frames return `None`; they are handled by the transport.
    pub fn from_message(message: Message) -> Option<Self> {
        match message {
            Message::Text(text) => Some(Self::Text(text)),
            Message::Binary(data) => Some(Self::Binary(data)),
            Message::Ping(_) | Message::Pong(_) | Message::Close(_) | Message::Frame(_) => None,
        }
    }
}

impl From<Payload> for Message {
    fn from(payload: Payload) -> Self {
        match payload {
            Payload::Text(text) => Self::Text(text),
            Payload::Binary(data) => Self::Binary(data),
        }
    }
}

/// Outgoing half of a [`Connection`].
pub type PayloadSink = Pin<Box<dyn Sink<Payload, Error = RelayError> + Send>>;

/// Incoming half of a [`Connection`]. Ends (`None`) once the peer has closed.
pub type PayloadStream = Pin<Box<dyn Stream<Item = Result<Payload, RelayError>> + Send>>;

/// A full-duplex message channel to one peer.
pub struct Connection {
    id: ConnectionId,
    peer: String,
    sink: PayloadSink,
    stream: PayloadStream,
}

impl Connection {
    /// Wrap an arbitrary sink/stream pair, allocating a fresh identity.
    pub fn new(peer: impl Into<String>, sink: PayloadSink, stream: PayloadStream) -> Self {
        Self {
            id: ConnectionId::next(),
            peer: peer.into(),
            sink,
            stream,
        }
    }

    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address or URL of the peer.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn send(&mut self, payload: Payload) -> Result<(), RelayError> {
        self.sink.send(payload).await
    }

    /// Next incoming payload; `None` once the connection is closed.
    pub async fn recv(&mut self) -> Option<Result<Payload, RelayError>> {
        self.stream.next().await
    }

    /// Close the outgoing half. Errors are irrelevant at this point.
    pub async fn close(&mut self) {
        if let Err(e) = self.sink.close().await {
            tracing::debug!(conn = %self.id, error = %e, "Error while closing connection");
        }
    }

    /// Split into independently owned halves.
    pub fn into_split(self) -> (PayloadSink, PayloadStream) {
        (self.sink, self.stream)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}
