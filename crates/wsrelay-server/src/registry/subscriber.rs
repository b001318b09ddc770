//! Downstream subscriber handle and its outbound queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::error::RelayError;
use crate::transport::{ConnectionId, Payload};

/// Handle to a registered downstream connection.
///
/// Sending enqueues onto a bounded per-subscriber queue that the connection's
/// writer task drains into the socket. Once the handle is retired (removed
/// from the registry) it refuses new payloads and its queue yields nothing
/// more, so nothing is written after removal completes.
pub struct Subscriber {
    id: ConnectionId,
    peer: String,
    tx: mpsc::Sender<Payload>,
    retired: Arc<AtomicBool>,
    connected_at: Instant,
}

/// Receiving end of a [`Subscriber`]'s queue, owned by the writer task.
pub struct SubscriberQueue {
    rx: mpsc::Receiver<Payload>,
    retired: Arc<AtomicBool>,
}

impl Subscriber {
    /// Create a handle plus the queue its writer task should drain.
    pub fn channel(
        id: ConnectionId,
        peer: impl Into<String>,
        capacity: usize,
    ) -> (Self, SubscriberQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let retired = Arc::new(AtomicBool::new(false));
        let subscriber = Self {
            id,
            peer: peer.into(),
            tx,
            retired: Arc::clone(&retired),
            connected_at: Instant::now(),
        };
        (subscriber, SubscriberQueue { rx, retired })
    }

    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub(super) fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    /// Enqueue `payload`, waiting at most `limit` for queue space.
    ///
    /// A full queue past the deadline is a `SendTimeout`; a retired handle or
    /// a dead writer is `ConnectionClosed`.
    pub async fn send(&self, payload: Payload, limit: Duration) -> Result<(), RelayError> {
        if self.is_retired() {
            return Err(RelayError::ConnectionClosed(format!("{} was removed", self.id)));
        }
        match timeout(limit, self.tx.send(payload)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(RelayError::ConnectionClosed(format!(
                "{} writer has stopped",
                self.id
            ))),
            Err(_) => Err(RelayError::SendTimeout(limit)),
        }
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("retired", &self.is_retired())
            .finish_non_exhaustive()
    }
}

impl SubscriberQueue {
    /// Next payload to write out.
    ///
    /// Returns `None` once the subscriber has been retired or every handle
    /// has been dropped; queued payloads are discarded in that case.
    pub async fn recv(&mut self) -> Option<Payload> {
        if self.retired.load(Ordering::Acquire) {
            return None;
        }
        let payload = self.rx.recv().await?;
        if self.retired.load(Ordering::Acquire) {
            None
        } else {
            Some(payload)
        }
    }
}
