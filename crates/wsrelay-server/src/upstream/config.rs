//! Upstream link configuration.

use std::time::Duration;

use wsrelay_core::RelaySettings;

/// Capped exponential backoff between reconnect attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry; no delay is ever shorter.
    pub min_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub multiplier: f64,
    /// Maximum number of consecutive failed attempts (None = unlimited).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            min_delay,
            max_delay: max_delay.max(min_delay),
            ..Self::default()
        }
    }

    /// Delay to wait after the given failed attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);
        // NaN and infinity both collapse onto max_delay through f64::min.
        let secs = (self.min_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs.max(0.0)).max(self.min_delay)
    }

    /// Whether another attempt should be made.
    pub const fn should_retry(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt < max,
            None => true,
        }
    }
}

/// Configuration for one upstream link.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Upstream WebSocket URL (e.g. "ws://192.168.137.100:20000").
    pub url: String,

    /// Reconnection policy.
    pub reconnect: ReconnectPolicy,

    /// Budget for a single dial, including the WebSocket handshake.
    pub handshake_timeout: Duration,

    /// Depth of the outbound (bridge) queue.
    pub outbound_capacity: usize,

    /// Budget for one upstream write or close; exceeding it drops the link.
    pub write_timeout: Duration,
}

impl LinkConfig {
    /// Create a link config with default policy and timeouts.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: ReconnectPolicy::default(),
            handshake_timeout: Duration::from_secs(10),
            outbound_capacity: 256,
            write_timeout: Duration::from_secs(5),
        }
    }

    /// Derive the link config for `url` from validated relay settings.
    pub fn from_settings(url: impl Into<String>, settings: &RelaySettings) -> Self {
        Self {
            url: url.into(),
            reconnect: ReconnectPolicy::new(
                settings.reconnect_min_delay,
                settings.reconnect_max_delay,
            ),
            handshake_timeout: settings.handshake_timeout,
            outbound_capacity: settings.upstream_queue,
            write_timeout: settings.send_timeout,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use wsrelay_core::RelayConfig;

    use super::*;

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = ReconnectPolicy::new(Duration::from_secs(1), Duration::from_secs(20));

        // 1s, 2s, 4s, 8s, 16s, 20s (capped), 20s
        let delays: Vec<u64> = (0..7)
            .map(|n| policy.delay_for_attempt(n).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 20, 20]);
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(20));
    }

    #[test]
    fn delay_never_drops_below_minimum() {
        let policy = ReconnectPolicy {
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(100),
            multiplier: 0.1,
            max_attempts: None,
        };
        for attempt in [0, 1, 5, 1000] {
            assert_eq!(policy.delay_for_attempt(attempt), Duration::from_millis(500));
        }
    }

    #[test]
    fn constant_policy_with_unit_multiplier() {
        let policy = ReconnectPolicy {
            multiplier: 1.0,
            ..ReconnectPolicy::new(Duration::from_secs(1), Duration::from_secs(60))
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(1));
    }

    #[test]
    fn retry_with_max_attempts() {
        let policy = ReconnectPolicy {
            max_attempts: Some(3),
            ..Default::default()
        };

        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(ReconnectPolicy::default().should_retry(u32::MAX));
    }

    #[test]
    fn link_config_from_settings() {
        let settings = RelayConfig {
            reconnect_min_delay_ms: 250,
            reconnect_max_delay_ms: 4_000,
            handshake_timeout_ms: 1_500,
            upstream_queue: 16,
            ..Default::default()
        }
        .validate()
        .unwrap();

        let config = LinkConfig::from_settings("ws://upstream:20000", &settings);
        assert_eq!(config.url, "ws://upstream:20000");
        assert_eq!(config.reconnect.min_delay, Duration::from_millis(250));
        assert_eq!(config.reconnect.max_delay, Duration::from_secs(4));
        assert_eq!(config.handshake_timeout, Duration::from_millis(1_500));
        assert_eq!(config.outbound_capacity, 16);
        assert_eq!(config.write_timeout, settings.send_timeout);
    }
}
