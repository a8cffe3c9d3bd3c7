use proto::ProtoError;

/// Errors surfaced by a single connection's handling, logged and used to
/// decide cleanup; never propagated to other connections.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server is at max_connections")]
    AtCapacity,
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtoError),
    #[error("websocket error: {0}")]
    Transport(String),
    #[error("connection idle past idle_timeout")]
    Idle,
    #[error("connection closed by peer")]
    PeerClosed,
}
