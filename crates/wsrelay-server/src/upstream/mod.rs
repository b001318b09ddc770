//! Upstream links with automatic reconnection.
//!
//! Each configured upstream address gets one [`UpstreamLink`] task that owns
//! the upstream connection exclusively, pushes everything it receives through
//! the broadcast router, and redials with capped exponential backoff whenever
//! the connection is lost.

pub mod config;
pub mod dialer;
pub mod link;

pub use config::{LinkConfig, ReconnectPolicy};
pub use dialer::{Dialer, WsDialer};
pub use link::{LinkState, UpstreamHandle, UpstreamLink};
