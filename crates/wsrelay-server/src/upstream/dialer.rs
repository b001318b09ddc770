//! Opening upstream connections.

use async_trait::async_trait;
use tracing::debug;

use crate::error::RelayError;
use crate::transport::Connection;

/// Opens a new upstream [`Connection`].
///
/// Every failure to establish the connection, at any layer, is reported as
/// [`RelayError::HandshakeFailure`].
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, url: &str) -> Result<Connection, RelayError>;
}

/// Dials real WebSocket endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsDialer;

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self, url: &str) -> Result<Connection, RelayError> {
        let (ws, response) = tokio_tungstenite::connect_async(url).await.map_err(|e| {
            debug!(url, error = ?e, "upstream dial error details");
            RelayError::HandshakeFailure {
                peer: url.to_string(),
                reason: format!("{e}: {}", error_chain(&e)),
            }
        })?;
        debug!(url, status = %response.status(), "Upstream handshake complete");
        Ok(Connection::from_websocket(url, ws))
    }
}

/// Walk the `source()` chain of an error and join into a single string.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut chain = Vec::new();
    let mut current = err.source();
    while let Some(e) = current {
        chain.push(e.to_string());
        current = e.source();
    }
    if chain.is_empty() {
        String::from("(no further details)")
    } else {
        chain.join(" -> ")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refused_dial_is_a_handshake_failure() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let err = WsDialer
            .dial(&format!("ws://127.0.0.1:{port}"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::HandshakeFailure { ref peer, .. } if peer.ends_with(&port.to_string())));
    }

    #[test]
    fn error_chain_without_source() {
        let err = std::io::Error::other("boom");
        assert_eq!(error_chain(&err), "(no further details)");
    }
}
