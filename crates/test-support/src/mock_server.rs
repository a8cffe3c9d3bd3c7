use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use frame_codec::{Codec, Decoder, Frame, FrameError};
use futures_util::{SinkExt, StreamExt};
use proto::{opcode, LoginRequest, LoginResponse, ProtoError};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Errors surfaced by [`MockConnection`]'s helper methods.
#[derive(Debug, thiserror::Error)]
pub enum MockError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Proto(#[from] ProtoError),
    #[error("connection closed before a frame arrived")]
    ClosedEarly,
    #[error("expected opcode {expected:#06x}, got {actual:#06x}")]
    UnexpectedOpcode { expected: u16, actual: u16 },
}

/// A single accepted WebSocket connection, with the same length-prefixed
/// framing a real client/server speaks. Tests drive it frame-by-frame
/// instead of running the real handshake/heartbeat/reconnect state
/// machine, so they can script exactly the server behavior a scenario
/// needs (reject login, withhold a pong, send pushes out of order, hang
/// up mid-session, ...).
pub struct MockConnection {
    ws: WebSocketStream<TcpStream>,
    codec: Codec,
    decoder: Decoder,
}

impl MockConnection {
    fn new(ws: WebSocketStream<TcpStream>) -> Self {
        MockConnection {
            ws,
            codec: Codec::default(),
            decoder: Decoder::default(),
        }
    }

    /// Read the next complete frame, pulling more WebSocket messages in as
    /// needed. Returns `None` on a clean close.
    pub async fn recv_frame(&mut self) -> Result<Option<Frame>, MockError> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(Some(frame));
            }
            match self.ws.next().await {
                Some(Ok(Message::Binary(bytes))) => self.decoder.feed(&bytes),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Decode the next frame's JSON body as `T`, asserting it carries
    /// `expected_opcode`.
    pub async fn recv_message<T: DeserializeOwned>(
        &mut self,
        expected_opcode: u16,
    ) -> Result<T, MockError> {
        let frame = self.recv_frame().await?.ok_or(MockError::ClosedEarly)?;
        if frame.opcode != expected_opcode {
            return Err(MockError::UnexpectedOpcode {
                expected: expected_opcode,
                actual: frame.opcode,
            });
        }
        Ok(proto::decode_frame_body(&frame)?)
    }

    /// Encode `msg` as a frame with the given opcode and send it.
    pub async fn send_message<T: Serialize>(
        &mut self,
        opcode: u16,
        msg: &T,
    ) -> Result<(), MockError> {
        let buf = proto::encode_message(&self.codec, opcode, msg)?;
        self.ws.send(Message::Binary(buf.into())).await?;
        Ok(())
    }

    /// Read the client's login frame and decode it.
    pub async fn expect_login(&mut self) -> Result<LoginRequest, MockError> {
        self.recv_message(opcode::LOGIN_REQUEST).await
    }

    /// Reply to a login attempt.
    pub async fn send_login_response(&mut self, resp: &LoginResponse) -> Result<(), MockError> {
        self.send_message(opcode::LOGIN_RESPONSE, resp).await
    }

    /// Convenience: accept the login and immediately approve it.
    pub async fn accept_login(&mut self, player_id: &str, session_id: &str) -> Result<LoginRequest, MockError> {
        let req = self.expect_login().await?;
        self.send_login_response(&LoginResponse {
            ok: true,
            player_id: player_id.to_owned(),
            session_id: session_id.to_owned(),
            server_time_ms: 0,
            error: None,
        })
        .await?;
        Ok(req)
    }

    /// Close the underlying WebSocket connection.
    pub async fn close(mut self) -> Result<(), MockError> {
        self.ws.close(None).await?;
        Ok(())
    }
}

/// A WebSocket server bound to an ephemeral port, handing accepted
/// connections to the test one at a time via [`MockServer::accept`].
///
/// Bind port 0, spawn a background accept loop, let the test drive each
/// connection directly rather than running canned server logic in the
/// background.
pub struct MockServer {
    local_addr: std::net::SocketAddr,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockConnection>>,
    _accept_task: tokio::task::JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let ws = match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(_) => continue,
                };
                if tx.send(MockConnection::new(ws)).is_err() {
                    return;
                }
            }
        });

        Ok(MockServer {
            local_addr,
            incoming: tokio::sync::Mutex::new(rx),
            _accept_task: accept_task,
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.local_addr)
    }

    /// Await the next accepted connection.
    pub async fn accept(&self) -> Option<MockConnection> {
        self.incoming.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proto::{LoginRequest, LoginResponse};

    #[tokio::test]
    async fn accepts_a_connection_and_completes_login() {
        let server = MockServer::start().await.expect("bind mock server");
        let url = server.ws_url();

        let client_task = tokio::spawn(async move {
            let (ws, _) = tokio_tungstenite::connect_async(url).await.expect("connect");
            let (mut write, mut read) = futures_util::StreamExt::split(ws);
            let codec = Codec::default();
            let req = LoginRequest {
                token: "tok".to_owned(),
                client_version: "1.0".to_owned(),
                device_id: "dev-1".to_owned(),
            };
            let buf = proto::encode_message(&codec, opcode::LOGIN_REQUEST, &req).unwrap();
            futures_util::SinkExt::send(&mut write, Message::Binary(buf.into()))
                .await
                .unwrap();

            let msg = futures_util::StreamExt::next(&mut read).await.unwrap().unwrap();
            match msg {
                Message::Binary(bytes) => {
                    let (opc, resp): (u16, LoginResponse) =
                        proto::decode_message(&codec, &bytes).unwrap();
                    assert_eq!(opc, opcode::LOGIN_RESPONSE);
                    assert!(resp.ok);
                }
                other => panic!("unexpected message: {other:?}"),
            }
        });

        let mut conn = server.accept().await.expect("connection accepted");
        let req = conn.accept_login("p1", "s1").await.expect("login");
        assert_eq!(req.device_id, "dev-1");

        client_task.await.expect("client task");
    }

    #[tokio::test]
    async fn recv_message_rejects_unexpected_opcode() {
        let server = MockServer::start().await.expect("bind mock server");
        let url = server.ws_url();

        tokio::spawn(async move {
            let (ws, _) = tokio_tungstenite::connect_async(url).await.expect("connect");
            let (mut write, _read) = futures_util::StreamExt::split(ws);
            let codec = Codec::default();
            let buf = codec.encode(opcode::PING, Some(b"{}"));
            futures_util::SinkExt::send(&mut write, Message::Binary(buf.into()))
                .await
                .unwrap();
            // Keep the socket alive briefly so the server side can read.
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        });

        let mut conn = server.accept().await.expect("connection accepted");
        let err = conn.expect_login().await.unwrap_err();
        assert!(matches!(err, MockError::UnexpectedOpcode { .. }));
    }
}
