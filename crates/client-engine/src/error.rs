use proto::ProtoError;

/// A [`ClientConfig`](crate::config::ClientConfig) failed validation.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("server_url must not be empty")]
    EmptyServerUrl,
    #[error(
        "reconnect_initial_interval ({initial:?}) must not exceed reconnect_max_interval ({max:?})"
    )]
    BackoffOrdering {
        initial: std::time::Duration,
        max: std::time::Duration,
    },
    #[error("reconnect_multiplier must be >= 1.0, got {0}")]
    InvalidMultiplier(f64),
    #[error("max_in_flight_pings must be at least 1")]
    ZeroMaxInFlightPings,
    #[error("observer_queue_capacity must be at least 1")]
    ZeroObserverQueueCapacity,
}

/// Errors surfaced by [`GameClient`](crate::client::GameClient) operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtoError),
    #[error("login rejected by server: {message}")]
    LoginRejected { code: i32, message: String },
    #[error("timed out waiting for login response")]
    LoginTimeout,
    #[error("not connected")]
    NotConnected,
}
