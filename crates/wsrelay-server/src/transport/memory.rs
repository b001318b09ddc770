//! In-process connection pairs.
//!
//! Useful for embedding producers in the same process as the relay and for
//! driving the relay without sockets.

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{Connection, Payload};
use crate::error::RelayError;

/// Create two connected in-memory connections.
///
/// Whatever one end sends, the other receives, in order. Dropping one end
/// ends the other end's stream, which is how a peer close is observed.
pub fn duplex(capacity: usize) -> (Connection, Connection) {
    let (left_tx, left_rx) = mpsc::channel::<Payload>(capacity);
    let (right_tx, right_rx) = mpsc::channel::<Payload>(capacity);
    (
        channel_connection("memory:left", left_tx, right_rx),
        channel_connection("memory:right", right_tx, left_rx),
    )
}

fn channel_connection(
    peer: &str,
    tx: mpsc::Sender<Payload>,
    rx: mpsc::Receiver<Payload>,
) -> Connection {
    let sink = futures_util::sink::unfold(tx, |tx, payload: Payload| async move {
        tx.send(payload)
            .await
            .map_err(|_| RelayError::ConnectionClosed("in-memory peer dropped".into()))?;
        Ok::<_, RelayError>(tx)
    });
    let stream = ReceiverStream::new(rx).map(Ok);
    Connection::new(peer, Box::pin(sink), Box::pin(stream))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn both_directions_deliver_in_order() {
        let (mut left, mut right) = duplex(8);

        left.send(Payload::text("one")).await.unwrap();
        left.send(Payload::text("two")).await.unwrap();
        right.send(Payload::binary(vec![7u8])).await.unwrap();

        assert_eq!(right.recv().await.unwrap().unwrap(), Payload::text("one"));
        assert_eq!(right.recv().await.unwrap().unwrap(), Payload::text("two"));
        assert_eq!(left.recv().await.unwrap().unwrap(), Payload::binary(vec![7u8]));
        assert_ne!(left.id(), right.id());
    }

    #[tokio::test]
    async fn dropping_one_end_closes_the_other() {
        let (left, mut right) = duplex(8);
        drop(left);

        assert!(right.recv().await.is_none());
        let err = right.send(Payload::text("late")).await.unwrap_err();
        assert!(err.is_disconnect());
    }
}
