//! Upstream link: owns one upstream connection and keeps it alive.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use super::config::LinkConfig;
use super::dialer::Dialer;
use crate::error::RelayError;
use crate::events::{EventBus, EventKind};
use crate::router::BroadcastRouter;
use crate::transport::{Connection, Payload};

/// Reconnect state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// Deliberate shutdown; terminal.
    Closing,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
        })
    }
}

/// Runs the reconnect loop for a single upstream address.
///
/// The upstream [`Connection`] only ever lives inside [`UpstreamLink::run`];
/// a reconnect replaces it with a freshly dialed one. Other tasks interact
/// through the cloneable [`UpstreamHandle`].
pub struct UpstreamLink {
    config: LinkConfig,
    dialer: Arc<dyn Dialer>,
    router: Arc<BroadcastRouter>,
    events: EventBus,
    state: watch::Sender<LinkState>,
    outbound: mpsc::Receiver<Payload>,
}

/// Cheap handle for observing a link and writing to its upstream.
#[derive(Clone)]
pub struct UpstreamHandle {
    url: Arc<str>,
    state: watch::Receiver<LinkState>,
    outbound: mpsc::Sender<Payload>,
}

impl UpstreamLink {
    pub fn new(
        config: LinkConfig,
        dialer: Arc<dyn Dialer>,
        router: Arc<BroadcastRouter>,
        events: EventBus,
    ) -> (Self, UpstreamHandle) {
        let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let handle = UpstreamHandle {
            url: Arc::from(config.url.as_str()),
            state: state_rx,
            outbound: outbound_tx,
        };
        let link = Self {
            config,
            dialer,
            router,
            events,
            state: state_tx,
            outbound: outbound_rx,
        };
        (link, handle)
    }

    /// Run the link until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// Upstream errors never escape: a failed dial or a lost connection moves
    /// the link to `Disconnected`, waits out the backoff delay and dials again.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(LinkState::Connecting);
            self.events.emit(
                EventKind::ReconnectAttempt,
                &self.config.url,
                format!("attempt {}", attempt.saturating_add(1)),
            );

            let dialed = tokio::select! {
                result = timeout(self.config.handshake_timeout, self.dialer.dial(&self.config.url)) => {
                    result.unwrap_or_else(|_| Err(RelayError::HandshakeFailure {
                        peer: self.config.url.clone(),
                        reason: format!(
                            "timed out after {}ms",
                            self.config.handshake_timeout.as_millis()
                        ),
                    }))
                }
                _ = shutdown.changed() => break,
            };

            match dialed {
                Ok(conn) => {
                    attempt = 0;
                    self.set_state(LinkState::Connected);
                    self.events.emit(
                        EventKind::Connect,
                        &self.config.url,
                        format!("upstream {} connected", conn.id()),
                    );

                    match self.pump(conn, &mut shutdown).await {
                        Ok(()) => break,
                        Err(e) => {
                            self.set_state(LinkState::Disconnected);
                            self.events
                                .emit(EventKind::Disconnect, &self.config.url, e.to_string());
                        }
                    }
                }
                Err(e) => {
                    self.set_state(LinkState::Disconnected);
                    warn!(url = %self.config.url, attempt, error = %e, "Upstream handshake failed");
                }
            }

            if !self.config.reconnect.should_retry(attempt) {
                error!(url = %self.config.url, attempt, "Max reconnect attempts reached");
                break;
            }

            let delay = self.config.reconnect.delay_for_attempt(attempt);
            debug!(url = %self.config.url, attempt, delay_ms = delay.as_millis(), "Waiting before reconnect");

            tokio::select! {
                () = sleep(delay) => {}
                _ = shutdown.changed() => break,
            }

            attempt = attempt.saturating_add(1);
        }

        self.set_state(LinkState::Closing);
        info!(url = %self.config.url, "Upstream link stopped");
    }

    /// Move payloads in both directions until the connection fails or
    /// shutdown is requested.
    ///
    /// Each inbound payload is fully dispatched before the next read, so a
    /// slow fan-out backpressures the upstream instead of buffering. Writes
    /// and the final close are bounded by the link's write timeout; a write
    /// that overruns it counts as a lost connection.
    async fn pump(
        &mut self,
        mut conn: Connection,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), RelayError> {
        let conn_id = conn.id();
        loop {
            tokio::select! {
                incoming = conn.recv() => match incoming {
                    Some(Ok(payload)) => {
                        self.router.dispatch(payload).await;
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        return Err(RelayError::ConnectionClosed(format!(
                            "upstream {conn_id} ended the stream"
                        )));
                    }
                },
                Some(payload) = self.outbound.recv() => {
                    let write_timeout = self.config.write_timeout;
                    match timeout(write_timeout, conn.send(payload)).await {
                        Ok(result) => result?,
                        Err(_) => return Err(RelayError::SendTimeout(write_timeout)),
                    }
                }
                _ = shutdown.changed() => {
                    if timeout(self.config.write_timeout, conn.close()).await.is_err() {
                        debug!(url = %self.config.url, conn = %conn_id, "Upstream close timed out");
                    }
                    return Ok(());
                }
            }
        }
    }

    fn set_state(&self, next: LinkState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(url = %self.config.url, from = %previous, to = %next, "Upstream link state changed");
        }
    }
}

impl UpstreamHandle {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Wait until the link reaches `target`.
    pub async fn wait_for_state(&self, target: LinkState) -> Result<(), RelayError> {
        let mut state = self.state.clone();
        state
            .wait_for(|current| *current == target)
            .await
            .map(|_| ())
            .map_err(|_| RelayError::ConnectionClosed(format!("link to {} has stopped", self.url)))
    }

    /// Queue `payload` for the upstream without waiting.
    ///
    /// Payloads queued while the link is down go out after the next
    /// successful handshake. A full queue drops the payload.
    pub fn forward(&self, payload: Payload) -> Result<(), RelayError> {
        self.outbound.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                RelayError::QueueFull(format!("upstream {}", self.url))
            }
            mpsc::error::TrySendError::Closed(_) => {
                RelayError::ConnectionClosed(format!("link to {} has stopped", self.url))
            }
        })
    }
}

impl fmt::Debug for UpstreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamHandle")
            .field("url", &self.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
