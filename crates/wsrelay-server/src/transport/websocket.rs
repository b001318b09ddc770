//! WebSocket adapter for [`Connection`].

use futures_util::{SinkExt, StreamExt, future};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

use super::{Connection, Payload};
use crate::error::RelayError;

impl Connection {
    /// Adapt an established WebSocket into a relay connection.
    ///
    /// Text and binary frames pass through untouched. Ping/pong and close
    /// frames are answered by `tungstenite` and never surface as payloads;
    /// the stream simply ends after the closing handshake.
    pub fn from_websocket<S>(peer: impl Into<String>, ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();

        let sink = sink
            .sink_map_err(RelayError::from)
            .with(|payload: Payload| future::ready(Ok::<_, RelayError>(Message::from(payload))));

        let stream = stream.filter_map(|item| {
            future::ready(match item {
                Ok(message) => Payload::from_message(message).map(Ok),
                Err(e) => Some(Err(RelayError::from(e))),
            })
        });

        Self::new(peer, Box::pin(sink), Box::pin(stream))
    }
}
