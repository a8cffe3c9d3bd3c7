/// Lifecycle state of a [`GameClient`](crate::client::GameClient).
///
/// Transitions: `Disconnected -> Connecting -> Connected`; on connection
/// loss, `Connected -> Reconnecting -> Connecting` (repeat); on
/// [`GameClient::close`](crate::client::GameClient::close),
/// `* -> Closing -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closing,
    Closed,
}

impl ClientState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ClientState::Closed)
    }
}
