//! Relay error types.

use std::time::Duration;

use tokio_tungstenite::tungstenite;

use crate::transport::ConnectionId;

/// Errors produced by relay connections, the registry and the server.
///
/// Per-connection variants never escape the task that owns the connection;
/// they are turned into registry removals or link state transitions.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Handshake with {peer} failed: {reason}")]
    HandshakeFailure { peer: String, reason: String },

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Send timed out after {}ms", .0.as_millis())]
    SendTimeout(Duration),

    #[error("Outbound queue full: {0}")]
    QueueFull(String),

    #[error("Duplicate connection: {0}")]
    DuplicateConnection(ConnectionId),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Config(#[from] wsrelay_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Whether the error means the peer is gone (or must be treated as gone).
    pub const fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed(_) | Self::SendTimeout(_) | Self::Io(_)
        )
    }
}

impl From<tungstenite::Error> for RelayError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed => Self::ConnectionClosed("closed by peer".into()),
            tungstenite::Error::AlreadyClosed => Self::ConnectionClosed("already closed".into()),
            tungstenite::Error::Io(e) => Self::Io(e),
            other => Self::Protocol(other.to_string()),
        }
    }
}
