use std::time::Duration;

use crate::error::ConfigError;

/// Configuration for a [`GameClient`](crate::client::GameClient).
///
/// Built with plain field initialization (no builder, no `lazy_static`
/// globals) and validated explicitly via [`ClientConfig::validate`] before
/// `GameClient::connect` does anything network-facing. Field names match
/// the "recognized options" enumerated in `spec.md` §4.3/§6; this is the
/// exact configuration surface of a client — there is no catch-all bag for
/// unrecognized options.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the test server, e.g. `ws://127.0.0.1:9000/ws`.
    pub server_url: String,
    pub token: String,
    pub client_version: String,
    pub device_id: String,
    /// Maximum time to establish a connection, covering the TCP/WebSocket
    /// upgrade plus the login request/response round trip.
    pub handshake_timeout: Duration,
    /// Period between pings sent by the heartbeat loop.
    pub heartbeat_interval: Duration,
    /// Tolerance before a single outstanding ping is considered lost.
    pub ping_timeout: Duration,
    /// Bound on unanswered pings before a reconnect is forced.
    pub max_in_flight_pings: u32,
    pub reconnect_initial_interval: Duration,
    pub reconnect_max_interval: Duration,
    /// Backoff growth factor applied each retry: `delay_n = min(max,
    /// initial * multiplier^n)`.
    pub reconnect_multiplier: f64,
    /// Total wall-clock budget for reconnect attempts. `None` means no
    /// elapsed-time budget (only `max_reconnect_tries`, if set, bounds
    /// retries).
    pub reconnect_max_elapsed: Option<Duration>,
    /// `None` retries forever (subject to `reconnect_max_elapsed`).
    pub max_reconnect_tries: Option<u32>,
    /// Hint to the transport layer; this implementation's WebSocket stack
    /// does not negotiate permessage-deflate, so the hint is recorded but
    /// otherwise inert today.
    pub enable_compression: bool,
    pub max_frame_size: usize,
    pub observer_queue_capacity: usize,
    /// Mirror every sent/received frame into the session recorder's
    /// optional raw-frame capture (`spec.md` §5, "may additionally capture
    /// raw frames"). Off by default since the base64 copy roughly doubles
    /// the memory a long session holds onto.
    pub capture_raw_frames: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            server_url: String::new(),
            token: String::new(),
            client_version: "0.1.0".to_owned(),
            device_id: String::new(),
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(15),
            ping_timeout: Duration::from_secs(5),
            max_in_flight_pings: 3,
            reconnect_initial_interval: Duration::from_millis(200),
            reconnect_max_interval: Duration::from_secs(30),
            reconnect_multiplier: 2.0,
            reconnect_max_elapsed: None,
            max_reconnect_tries: None,
            enable_compression: false,
            max_frame_size: frame_codec::DEFAULT_MAX_FRAME_SIZE,
            observer_queue_capacity: 256,
            capture_raw_frames: false,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_url.is_empty() {
            return Err(ConfigError::EmptyServerUrl);
        }
        if self.reconnect_initial_interval > self.reconnect_max_interval {
            return Err(ConfigError::BackoffOrdering {
                initial: self.reconnect_initial_interval,
                max: self.reconnect_max_interval,
            });
        }
        if self.reconnect_multiplier < 1.0 {
            return Err(ConfigError::InvalidMultiplier(self.reconnect_multiplier));
        }
        if self.max_in_flight_pings == 0 {
            return Err(ConfigError::ZeroMaxInFlightPings);
        }
        if self.observer_queue_capacity == 0 {
            return Err(ConfigError::ZeroObserverQueueCapacity);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid_once_server_url_is_set() {
        let mut cfg = ClientConfig::default();
        cfg.server_url = "ws://127.0.0.1:9000/ws".to_owned();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn empty_server_url_is_rejected() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.validate(), Err(ConfigError::EmptyServerUrl));
    }

    #[test]
    fn backoff_ordering_is_enforced() {
        let mut cfg = ClientConfig::default();
        cfg.server_url = "ws://x".to_owned();
        cfg.reconnect_initial_interval = Duration::from_secs(60);
        cfg.reconnect_max_interval = Duration::from_secs(1);
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::BackoffOrdering { .. })
        ));
    }

    #[test]
    fn multiplier_below_one_is_rejected() {
        let mut cfg = ClientConfig::default();
        cfg.server_url = "ws://x".to_owned();
        cfg.reconnect_multiplier = 0.5;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidMultiplier(_))
        ));
    }

    #[test]
    fn zero_max_in_flight_pings_is_rejected() {
        let mut cfg = ClientConfig::default();
        cfg.server_url = "ws://x".to_owned();
        cfg.max_in_flight_pings = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroMaxInFlightPings));
    }
}
