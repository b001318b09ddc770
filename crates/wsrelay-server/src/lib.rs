//! wsrelay Server Library
//!
//! WebSocket relay that fans upstream traffic out to downstream subscribers:
//! - Subscriber registry with copy-on-write snapshots
//! - Broadcast router with bounded, independent per-subscriber sends
//! - Upstream links with a reconnect state machine and capped backoff
//! - Hub and bridge server roles over `tokio-tungstenite`
//! - Structured relay events

pub mod error;
pub mod events;
pub mod registry;
pub mod router;
pub mod server;
pub mod transport;
pub mod upstream;

pub use error::RelayError;
pub use events::{EventBus, EventKind, RelayEvent};
pub use registry::{Subscriber, SubscriberRegistry};
pub use router::{BroadcastRouter, DeliveryReport};
pub use server::RelayServer;
pub use transport::{Connection, ConnectionId, Payload};
pub use upstream::{Dialer, LinkState, UpstreamHandle, UpstreamLink, WsDialer};
