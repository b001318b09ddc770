//! Structured relay events.
//!
//! Every connect, disconnect, reconnect attempt and send failure is mirrored
//! to `tracing` and published on a broadcast bus for external consumers.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Default number of events buffered per bus subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Connect,
    Disconnect,
    ReconnectAttempt,
    SendFailure,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::ReconnectAttempt => "reconnect_attempt",
            Self::SendFailure => "send_failure",
        })
    }
}

/// One observable relay event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayEvent {
    pub event_kind: EventKind,
    /// Connection id for subscribers, URL for upstream links.
    pub connection_identity: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub detail: String,
}

/// Fan-out channel for [`RelayEvent`]s.
///
/// Emitting never blocks; slow consumers lose the oldest events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RelayEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event_kind: EventKind, identity: impl fmt::Display, detail: impl Into<String>) {
        let event = RelayEvent {
            event_kind,
            connection_identity: identity.to_string(),
            timestamp: unix_millis(),
            detail: detail.into(),
        };

        match event_kind {
            EventKind::SendFailure => warn!(
                event_kind = %event.event_kind,
                connection = %event.connection_identity,
                detail = %event.detail,
                "relay event"
            ),
            _ => info!(
                event_kind = %event.event_kind,
                connection = %event.connection_identity,
                detail = %event.detail,
                "relay event"
            ),
        }

        // No receivers is fine: the bus is an optional hook.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
