use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use frame_codec::{Codec, Decoder};
use proto::{decode_frame_body, encode_message, opcode, Action, ErrorFrame, LoginRequest, LoginResponse, Ping, Pong};

use crate::error::ServerError;
use crate::state::{ConnHandle, PushQueue, ServerState};

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send_error(socket: &mut WebSocket, codec: &Codec, code: i32, message: &str) {
    let err = ErrorFrame {
        code,
        message: message.to_owned(),
        correlation_id: None,
    };
    if let Ok(bytes) = encode_message(codec, opcode::ERROR, &err) {
        let _ = socket.send(Message::Binary(bytes)).await;
    }
}

/// Reads frames off `socket` until a `LOGIN_REQUEST` arrives, decoding
/// through `decoder` which may need several WebSocket messages to see a
/// complete frame.
async fn await_login(
    socket: &mut WebSocket,
    decoder: &mut Decoder,
) -> Result<LoginRequest, ServerError> {
    loop {
        if let Some(frame) = decoder
            .next_frame()
            .map_err(|e| ServerError::Transport(e.to_string()))?
        {
            if frame.opcode != opcode::LOGIN_REQUEST {
                return Err(ServerError::HandshakeRejected(format!(
                    "expected login_request, got opcode {:#06x}",
                    frame.opcode
                )));
            }
            return Ok(decode_frame_body(&frame)?);
        }
        match socket.recv().await {
            Some(Ok(Message::Binary(data))) => decoder.feed(&data),
            Some(Ok(Message::Close(_))) | None => return Err(ServerError::PeerClosed),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(ServerError::Transport(e.to_string())),
        }
    }
}

async fn handle_socket(mut socket: WebSocket, state: ServerState) {
    let codec = Codec::new(state.config.max_frame_size);

    if state.connection_count().await >= state.config.max_connections {
        warn!(error = %ServerError::AtCapacity, "rejecting connection");
        send_error(&mut socket, &codec, 503, "server at max_connections").await;
        return;
    }

    let mut decoder = Decoder::new(state.config.max_frame_size);
    let login = match tokio::time::timeout(
        state.config.handshake_timeout,
        await_login(&mut socket, &mut decoder),
    )
    .await
    {
        Ok(Ok(login)) => login,
        Ok(Err(e)) => {
            warn!(error = %e, "handshake rejected");
            return;
        }
        Err(_) => {
            warn!(error = %ServerError::HandshakeTimeout, "giving up on connection");
            return;
        }
    };

    if login.token.is_empty() {
        send_error(&mut socket, &codec, 401, "token must not be empty").await;
        return;
    }

    let player_id = Uuid::new_v4().to_string();
    let session_id = Uuid::new_v4().to_string();
    let response = LoginResponse {
        ok: true,
        player_id: player_id.clone(),
        session_id,
        server_time_ms: now_unix_ms(),
        error: None,
    };
    let bytes = match encode_message(&codec, opcode::LOGIN_RESPONSE, &response) {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "failed to encode login response");
            return;
        }
    };
    if socket.send(Message::Binary(bytes)).await.is_err() {
        return;
    }
    state.stats.record_message_out();

    let conn_id = Uuid::new_v4();
    let handle = Arc::new(ConnHandle {
        id: conn_id,
        device_id: login.device_id.clone(),
        player_id: player_id.clone(),
        queue: Arc::new(PushQueue::new(state.config.writer_queue_capacity)),
        close_notify: Arc::new(Notify::new()),
        last_action_seq: std::sync::atomic::AtomicU64::new(0),
        last_activity: Mutex::new(Instant::now()),
    });
    state
        .connections
        .write()
        .await
        .insert(conn_id, handle.clone());
    state.stats.record_connect();
    info!(conn_id = %conn_id, device_id = %login.device_id, player_id = %player_id, "connection established");

    let (mut write, mut read) = socket.split();

    let writer_queue = handle.queue.clone();
    let writer_close = handle.close_notify.clone();
    let writer_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = writer_queue.pop() => {
                    if write.send(Message::Binary(frame)).await.is_err() {
                        break;
                    }
                }
                _ = writer_close.notified() => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let idle_check_period = (state.config.idle_timeout / 4).max(std::time::Duration::from_millis(20));
    let mut idle_check = tokio::time::interval(idle_check_period);
    idle_check.tick().await;

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        decoder.feed(&data);
                        handle.touch();
                        while let Ok(Some(frame)) = decoder.next_frame() {
                            state.stats.record_message_in();
                            handle_frame(&state, &handle, &codec, frame).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(conn_id = %conn_id, "peer closed connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(conn_id = %conn_id, error = %e, "websocket read error");
                        break;
                    }
                }
            }
            _ = idle_check.tick() => {
                if handle.idle_for() > state.config.idle_timeout {
                    info!(conn_id = %conn_id, error = %ServerError::Idle, "closing connection");
                    break;
                }
            }
            _ = handle.close_notify.notified() => {
                debug!(conn_id = %conn_id, "shutdown requested for connection");
                break;
            }
        }
    }

    writer_task.abort();
    state.connections.write().await.remove(&conn_id);
    state.stats.record_disconnect();
    info!(conn_id = %conn_id, "connection closed");
}

async fn handle_frame(
    state: &ServerState,
    handle: &Arc<ConnHandle>,
    codec: &Codec,
    frame: frame_codec::Frame,
) {
    match frame.opcode {
        opcode::PING => {
            let Ok(ping): Result<Ping, _> = decode_frame_body(&frame) else {
                return;
            };
            let pong = Pong {
                client_unix_ms: ping.client_unix_ms,
                ping_seq: ping.ping_seq,
            };
            if let Ok(bytes) = encode_message(codec, opcode::PONG, &pong) {
                handle.queue.push(bytes);
                state.stats.record_message_out();
            }
        }
        opcode::ACTION => {
            let Ok(action): Result<Action, _> = decode_frame_body(&frame) else {
                return;
            };
            let prev = handle.last_action_seq.load(Ordering::SeqCst);
            if action.action_seq <= prev && prev != 0 {
                let err = ErrorFrame {
                    code: 409,
                    message: format!(
                        "action_seq {} did not increase past {prev}",
                        action.action_seq
                    ),
                    correlation_id: Some(action.action_seq.to_string()),
                };
                if let Ok(bytes) = encode_message(codec, opcode::ERROR, &err) {
                    handle.queue.push(bytes);
                    state.stats.record_message_out();
                }
                return;
            }
            handle
                .last_action_seq
                .store(action.action_seq, Ordering::SeqCst);
            let ack = state.action_handler.handle(&action);
            if let Ok(bytes) = encode_message(codec, opcode::ACTION_ACK, &ack) {
                handle.queue.push(bytes);
                state.stats.record_message_out();
            }
        }
        other => {
            debug!(opcode = format!("{other:#06x}"), "ignoring unrecognized opcode from client");
        }
    }
}
