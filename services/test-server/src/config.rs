use std::time::Duration;

/// Configuration for a [`TestServer`](crate::server::TestServer).
///
/// Plain field initialization, validated explicitly, mirroring
/// `client_engine::ClientConfig`'s approach on the other side of the wire.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the listener to, e.g. `127.0.0.1:0` for an
    /// OS-assigned ephemeral port (the default, convenient for tests).
    pub bind_addr: String,
    pub max_connections: usize,
    /// Maximum time to await the login frame after a transport is accepted.
    pub handshake_timeout: Duration,
    /// Period of the shared push ticker.
    pub push_interval: Duration,
    /// A connection with no traffic (in either direction) for this long is
    /// closed.
    pub idle_timeout: Duration,
    /// Capacity of each connection's bounded writer queue.
    pub writer_queue_capacity: usize,
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: "127.0.0.1:0".to_owned(),
            max_connections: 1000,
            handshake_timeout: Duration::from_secs(10),
            push_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(60),
            writer_queue_capacity: 64,
            max_frame_size: frame_codec::DEFAULT_MAX_FRAME_SIZE,
        }
    }
}
