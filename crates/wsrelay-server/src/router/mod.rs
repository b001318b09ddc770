//! Fan-out of relayed payloads to subscribers.

pub mod broadcast;

pub use broadcast::{BroadcastRouter, DeliveryReport};
