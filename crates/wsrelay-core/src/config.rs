//! Configuration resolution for the relay.
//!
//! Resolution order (lowest to highest priority):
//! 1. Built-in defaults
//! 2. JSON config file (`--config path.json`)
//! 3. Environment variables (`WSRELAY_*`)
//! 4. CLI arguments (applied by the binary)
//!
//! The merged [`RelayConfig`] is then checked by [`RelayConfig::validate`],
//! which produces the typed [`RelaySettings`] the server runs with. Every
//! error surfaced here is fatal and reported before any socket is opened.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Deployment role of the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Broadcast upstream traffic to every connected subscriber.
    #[default]
    Hub,
    /// Single upstream; inbound subscriber traffic is also written upstream.
    Bridge,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hub => f.write_str("hub"),
            Self::Bridge => f.write_str("bridge"),
        }
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hub" => Ok(Self::Hub),
            "bridge" => Ok(Self::Bridge),
            other => Err(Error::Config(format!(
                "Unknown role {other:?} (expected \"hub\" or \"bridge\")"
            ))),
        }
    }
}

/// Raw relay configuration as read from file, environment and CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    pub bind_address: String,
    pub bind_port: u16,
    pub upstream_addresses: Vec<String>,
    pub reconnect_min_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub role: Role,
    /// Per-subscriber send budget; a slower subscriber is dropped.
    pub send_timeout_ms: u64,
    /// Budget for a WebSocket handshake, inbound or upstream.
    pub handshake_timeout_ms: u64,
    /// Outbound queue depth per subscriber.
    pub subscriber_queue: usize,
    /// Outbound queue depth per upstream link (bridge traffic).
    pub upstream_queue: usize,
    /// Text message sent to every subscriber right after it is registered.
    pub greeting: Option<String>,
    /// Hub only: republish each subscriber's inbound messages to all subscribers.
    pub rebroadcast_inbound: bool,
    /// Treat peers on loopback addresses as publishers that never subscribe.
    pub loopback_publishers: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            bind_port: 20000,
            upstream_addresses: Vec::new(),
            reconnect_min_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            role: Role::Hub,
            send_timeout_ms: 5_000,
            handshake_timeout_ms: 10_000,
            subscriber_queue: 256,
            upstream_queue: 256,
            greeting: None,
            rebroadcast_inbound: false,
            loopback_publishers: false,
        }
    }
}

/// Validated, typed settings consumed by the relay server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    pub bind: SocketAddr,
    pub upstreams: Vec<String>,
    pub reconnect_min_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub role: Role,
    pub send_timeout: Duration,
    pub handshake_timeout: Duration,
    pub subscriber_queue: usize,
    pub upstream_queue: usize,
    pub greeting: Option<String>,
    pub rebroadcast_inbound: bool,
    pub loopback_publishers: bool,
}

impl RelayConfig {
    /// Check the configuration and convert it into [`RelaySettings`].
    pub fn validate(&self) -> Result<RelaySettings> {
        let ip: IpAddr = self.bind_address.trim().parse().map_err(|e| {
            Error::Config(format!(
                "Invalid bind address {:?} (expected an IP literal): {e}",
                self.bind_address
            ))
        })?;

        let upstreams = self
            .upstream_addresses
            .iter()
            .map(|address| validate_upstream(address))
            .collect::<Result<Vec<_>>>()?;

        if self.role == Role::Bridge && upstreams.len() != 1 {
            return Err(Error::Config(format!(
                "Bridge role requires exactly one upstream address, got {}",
                upstreams.len()
            )));
        }

        if self.reconnect_min_delay_ms == 0 {
            return Err(Error::Config(
                "reconnect_min_delay_ms must be greater than zero".into(),
            ));
        }
        if self.reconnect_min_delay_ms > self.reconnect_max_delay_ms {
            return Err(Error::Config(format!(
                "reconnect_min_delay_ms ({}) exceeds reconnect_max_delay_ms ({})",
                self.reconnect_min_delay_ms, self.reconnect_max_delay_ms
            )));
        }
        for (name, value) in [
            ("send_timeout_ms", self.send_timeout_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }
        for (name, value) in [
            ("subscriber_queue", self.subscriber_queue),
            ("upstream_queue", self.upstream_queue),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }

        Ok(RelaySettings {
            bind: SocketAddr::new(ip, self.bind_port),
            upstreams,
            reconnect_min_delay: Duration::from_millis(self.reconnect_min_delay_ms),
            reconnect_max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            role: self.role,
            send_timeout: Duration::from_millis(self.send_timeout_ms),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            subscriber_queue: self.subscriber_queue,
            upstream_queue: self.upstream_queue,
            greeting: self.greeting.clone(),
            rebroadcast_inbound: self.rebroadcast_inbound,
            loopback_publishers: self.loopback_publishers,
        })
    }
}

fn validate_upstream(address: &str) -> Result<String> {
    let trimmed = address.trim();
    let invalid = |reason: String| Error::InvalidUpstream {
        address: address.to_string(),
        reason,
    };

    let url = url::Url::parse(trimmed).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "ws" => {}
        "wss" => {
            return Err(invalid(
                "wss is not supported (this build has no TLS support)".into(),
            ));
        }
        other => {
            return Err(invalid(format!("unsupported scheme {other:?} (expected ws)")));
        }
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(invalid("missing host".into()));
    }
    Ok(trimmed.to_string())
}

/// Load configuration: defaults, then the optional file, then environment.
pub fn load_config(path: Option<&Path>) -> Result<RelayConfig> {
    let mut config = match path {
        Some(path) => load_config_file(path)?,
        None => RelayConfig::default(),
    };
    apply_env_overrides(&mut config)?;
    Ok(config)
}

fn load_config_file(path: &Path) -> Result<RelayConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Apply `WSRELAY_*` environment variables on top of `config`.
pub fn apply_env_overrides(config: &mut RelayConfig) -> Result<()> {
    apply_overrides(config, |key| std::env::var(key).ok())
}

fn apply_overrides(
    config: &mut RelayConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    fn parsed<T: FromStr>(key: &str, raw: &str) -> Result<T>
    where
        T::Err: fmt::Display,
    {
        raw.trim()
            .parse()
            .map_err(|e| Error::Config(format!("Invalid value {raw:?} for {key}: {e}")))
    }

    if let Some(val) = lookup("WSRELAY_BIND_ADDRESS") {
        config.bind_address = val;
    }
    if let Some(val) = lookup("WSRELAY_BIND_PORT") {
        config.bind_port = parsed("WSRELAY_BIND_PORT", &val)?;
    }
    if let Some(val) = lookup("WSRELAY_UPSTREAM_ADDRESSES") {
        config.upstream_addresses = val
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
    }
    if let Some(val) = lookup("WSRELAY_RECONNECT_MIN_DELAY_MS") {
        config.reconnect_min_delay_ms = parsed("WSRELAY_RECONNECT_MIN_DELAY_MS", &val)?;
    }
    if let Some(val) = lookup("WSRELAY_RECONNECT_MAX_DELAY_MS") {
        config.reconnect_max_delay_ms = parsed("WSRELAY_RECONNECT_MAX_DELAY_MS", &val)?;
    }
    if let Some(val) = lookup("WSRELAY_ROLE") {
        config.role = val.parse()?;
    }
    if let Some(val) = lookup("WSRELAY_SEND_TIMEOUT_MS") {
        config.send_timeout_ms = parsed("WSRELAY_SEND_TIMEOUT_MS", &val)?;
    }
    if let Some(val) = lookup("WSRELAY_HANDSHAKE_TIMEOUT_MS") {
        config.handshake_timeout_ms = parsed("WSRELAY_HANDSHAKE_TIMEOUT_MS", &val)?;
    }
    if let Some(val) = lookup("WSRELAY_SUBSCRIBER_QUEUE") {
        config.subscriber_queue = parsed("WSRELAY_SUBSCRIBER_QUEUE", &val)?;
    }
    if let Some(val) = lookup("WSRELAY_UPSTREAM_QUEUE") {
        config.upstream_queue = parsed("WSRELAY_UPSTREAM_QUEUE", &val)?;
    }
    if let Some(val) = lookup("WSRELAY_GREETING") {
        config.greeting = Some(val);
    }
    if let Some(val) = lookup("WSRELAY_REBROADCAST_INBOUND") {
        config.rebroadcast_inbound = parsed("WSRELAY_REBROADCAST_INBOUND", &val)?;
    }
    if let Some(val) = lookup("WSRELAY_LOOPBACK_PUBLISHERS") {
        config.loopback_publishers = parsed("WSRELAY_LOOPBACK_PUBLISHERS", &val)?;
    }
    Ok(())
}
