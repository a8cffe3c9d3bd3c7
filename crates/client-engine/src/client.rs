use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, watch, Notify};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use frame_codec::{Codec, Decoder, Frame};
use proto::{
    decode_frame_body, encode_message, opcode, Action, ActionAck, ErrorFrame, LoginRequest,
    LoginResponse, Ping, Pong, PushState,
};
use session::{attr_keys, AttrValue, Direction, EventKind, Session, SessionRecorder};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::observer::{ClientObserver, ObserverEvent, ObserverRegistry};
use crate::state::ClientState;
use crate::stats::{ClientStats, ClientStatsInner};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn opcode_seq_attrs(opcode: u16, seq: u64) -> BTreeMap<String, AttrValue> {
    let mut attrs = BTreeMap::new();
    attrs.insert(attr_keys::OPCODE.to_owned(), AttrValue::U64(opcode as u64));
    attrs.insert(attr_keys::SEQUENCE_NUMBER.to_owned(), AttrValue::U64(seq));
    attrs
}

/// Exponential backoff with full jitter: `delay_n = min(max, initial *
/// multiplier^n)`, then a uniform `[0.5, 1.5)` jitter factor applied on
/// top. Computed inline rather than pulled from an external backoff
/// crate, per the fixed algorithm `spec.md` §9 mandates.
fn next_backoff(current: Duration, max: Duration, multiplier: f64) -> Duration {
    Duration::from_secs_f64((current.as_secs_f64() * multiplier).min(max.as_secs_f64()))
}

fn jittered(base: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64((base.as_secs_f64() * factor).max(0.0))
}

/// An outstanding ping, tracked so the heartbeat loop can enforce
/// `ping_timeout` and `max_in_flight_pings`. A ping that ages past
/// `ping_timeout` is counted as lost (once) but stays in the queue as
/// still-unanswered until a `Pong` actually removes it or the connection
/// is abandoned — only the unanswered *count* forces a reconnect.
struct PendingPing {
    seq: u64,
    sent_at: Instant,
    counted_lost: bool,
}

/// State shared between the supervisor task, each connection's task, and
/// the `GameClient` handle returned to callers.
struct Shared {
    config: ClientConfig,
    state_tx: watch::Sender<ClientState>,
    stats: Arc<ClientStatsInner>,
    observers: std::sync::Mutex<ObserverRegistry>,
    recorder: Arc<SessionRecorder>,
    action_tx_slot: std::sync::Mutex<Option<mpsc::Sender<Action>>>,
    action_seq: AtomicU64,
    ping_seq: AtomicU64,
    last_seen_push_seq: AtomicU64,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
}

fn set_state(shared: &Shared, state: ClientState) {
    let _ = shared.state_tx.send(state);
    shared
        .observers
        .lock()
        .expect("observer registry mutex poisoned")
        .dispatch(ObserverEvent::StateChange(state), &shared.stats);
}

/// A running game-protocol test client: connects, logs in, maintains
/// heartbeats, dedups pushes, and reconnects with backoff on connection
/// loss, all driven by a single background supervisor task once the
/// initial handshake succeeds.
pub struct GameClient {
    shared: Arc<Shared>,
    state_rx: watch::Receiver<ClientState>,
    supervisor: Option<tokio::task::JoinHandle<()>>,
}

impl GameClient {
    /// Validate `config`, perform the handshake within `handshake_timeout`,
    /// and on success spawn the background supervisor that owns the
    /// reader/writer/heartbeat loop and all subsequent reconnects.
    ///
    /// Matches `spec.md` §4.3's `connect(deadline)`: fails with
    /// [`ClientError::LoginTimeout`], [`ClientError::LoginRejected`], or
    /// [`ClientError::Connect`] without ever entering the background
    /// reconnect loop — a failed *initial* connect is the caller's
    /// problem to retry, not the supervisor's.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let (state_tx, state_rx) = watch::channel(ClientState::Disconnected);
        let shared = Arc::new(Shared {
            recorder: Arc::new(SessionRecorder::new(format!(
                "client-{}",
                config.device_id
            ))),
            config,
            state_tx,
            stats: Arc::new(ClientStatsInner::default()),
            observers: std::sync::Mutex::new(ObserverRegistry::new()),
            action_tx_slot: std::sync::Mutex::new(None),
            action_seq: AtomicU64::new(0),
            ping_seq: AtomicU64::new(0),
            last_seen_push_seq: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
        });

        set_state(&shared, ClientState::Connecting);
        shared.stats.record_connect_attempt();
        let _ = shared.recorder.record_event(EventKind::Connect, BTreeMap::new());

        let handshake = tokio::time::timeout(
            shared.config.handshake_timeout,
            connect_and_handshake(&shared),
        )
        .await
        .map_err(|_| ClientError::LoginTimeout)?;

        let (ws, login, decoder) = match handshake {
            Ok(triple) => triple,
            Err(e) => {
                set_state(&shared, ClientState::Disconnected);
                return Err(e);
            }
        };

        info!(player_id = %login.player_id, session_id = %login.session_id, "login accepted");
        let _ = shared.recorder.record_event(EventKind::Login, BTreeMap::new());
        set_state(&shared, ClientState::Connected);

        let (action_tx, action_rx) = mpsc::channel(64);
        *shared
            .action_tx_slot
            .lock()
            .expect("action sender slot mutex poisoned") = Some(action_tx);

        let supervisor = tokio::spawn(run_supervisor(shared.clone(), ws, decoder, action_rx));
        Ok(GameClient {
            shared,
            state_rx,
            supervisor: Some(supervisor),
        })
    }

    pub fn state(&self) -> ClientState {
        *self.state_rx.borrow()
    }

    /// A clone of the state-change watch channel, usable to await a
    /// specific transition.
    pub fn state_rx(&self) -> watch::Receiver<ClientState> {
        self.state_rx.clone()
    }

    pub fn stats(&self) -> ClientStats {
        self.shared.stats.snapshot()
    }

    /// Snapshot the session recorded so far (connects, pushes, reconnects,
    /// errors, close).
    pub fn session(&self) -> Session {
        self.shared.recorder.get_session()
    }

    pub fn register_observer(&self, observer: Box<dyn ClientObserver>) {
        self.shared
            .observers
            .lock()
            .expect("observer registry mutex poisoned")
            .register(observer, self.shared.config.observer_queue_capacity);
    }

    /// Send a business action. `action_seq` is assigned here, strictly
    /// monotone for the lifetime of this client and never reset by a
    /// reconnect. Fails with [`ClientError::NotConnected`] if there is no
    /// live connection to hand the action to right now.
    pub async fn send_action(
        &self,
        action_kind: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<u64, ClientError> {
        let seq = self.shared.action_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let action = Action {
            action_seq: seq,
            player_id: self.shared.config.device_id.clone(),
            action_kind: action_kind.into(),
            payload,
            client_time_ms: now_unix_ms(),
        };
        let tx = self
            .shared
            .action_tx_slot
            .lock()
            .expect("action sender slot mutex poisoned")
            .clone();
        let tx = tx.ok_or(ClientError::NotConnected)?;
        tx.send(action).await.map_err(|_| ClientError::NotConnected)?;
        Ok(seq)
    }

    /// Request a graceful close and wait for the supervisor task to exit.
    ///
    /// Idempotent: a second call after the first has returned observes
    /// `shutdown` already set and simply re-awaits the (already-finished)
    /// supervisor handle. Moves through `Closing` immediately so
    /// `on_state_change` observers see it before the background loops
    /// drain and the supervisor settles on `Closed`.
    pub async fn close(mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        set_state(&self.shared, ClientState::Closing);
        self.shared.shutdown_notify.notify_one();
        if let Some(handle) = self.supervisor.take() {
            let _ = handle.await;
        }
        let _ = self.shared.recorder.record_close(0, "client closed");
    }
}

impl Drop for GameClient {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.shutdown_notify.notify_one();
    }
}

enum ConnectionExit {
    Closed,
    Lost(String),
}

struct FrameReader<'a> {
    ws: &'a mut WsStream,
    decoder: Decoder,
}

impl FrameReader<'_> {
    /// Returns `Ok(None)` only on a clean peer-initiated close.
    async fn next_frame(&mut self) -> Result<Option<Frame>, ClientError> {
        loop {
            if let Some(frame) = self
                .decoder
                .next_frame()
                .map_err(|e| ClientError::Protocol(e.into()))?
            {
                return Ok(Some(frame));
            }
            match self.ws.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(ClientError::Connect(e.to_string())),
                Some(Ok(Message::Binary(data))) => self.decoder.feed(&data),
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(_)) => continue,
            }
        }
    }
}

async fn write_frame<T: serde::Serialize>(
    shared: &Shared,
    ws: &mut WsStream,
    codec: &Codec,
    opcode: u16,
    msg: &T,
) -> Result<(), ClientError> {
    let bytes = encode_message(codec, opcode, msg)?;
    if shared.config.capture_raw_frames {
        if let Ok(frame) = codec.decode(&bytes) {
            let _ = shared.recorder.record_frame(Direction::Send, frame.opcode, &frame.body);
        }
    }
    ws.send(Message::Binary(bytes.into()))
        .await
        .map_err(|e| ClientError::Connect(e.to_string()))
}

async fn connect_and_handshake(
    shared: &Shared,
) -> Result<(WsStream, LoginResponse, Decoder), ClientError> {
    let (mut ws, _response) = tokio_tungstenite::connect_async(shared.config.server_url.as_str())
        .await
        .map_err(|e| ClientError::Connect(e.to_string()))?;

    let codec = Codec::new(shared.config.max_frame_size);
    let login_req = LoginRequest {
        token: shared.config.token.clone(),
        client_version: shared.config.client_version.clone(),
        device_id: shared.config.device_id.clone(),
    };
    write_frame(shared, &mut ws, &codec, opcode::LOGIN_REQUEST, &login_req).await?;
    shared.stats.record_message_sent();

    let mut reader = FrameReader {
        ws: &mut ws,
        decoder: Decoder::new(shared.config.max_frame_size),
    };
    let frame = reader.next_frame().await?;
    let decoder = reader.decoder;
    let frame = frame.ok_or_else(|| {
        ClientError::Connect("connection closed during handshake".to_owned())
    })?;
    if frame.opcode != opcode::LOGIN_RESPONSE {
        return Err(ClientError::Connect(format!(
            "expected login_response, got opcode {:#06x}",
            frame.opcode
        )));
    }
    let login: LoginResponse = decode_frame_body(&frame)?;
    shared.stats.record_message_received();
    if !login.ok {
        let (code, message) = login
            .error
            .clone()
            .map(|e| (e.code, e.message))
            .unwrap_or((0, "login rejected".to_owned()));
        return Err(ClientError::LoginRejected { code, message });
    }
    Ok((ws, login, decoder))
}

fn handle_incoming_frame(
    shared: &Shared,
    frame: Frame,
    pending_pings: &mut VecDeque<PendingPing>,
) -> Result<(), String> {
    if shared.config.capture_raw_frames {
        let _ = shared.recorder.record_frame(Direction::Receive, frame.opcode, &frame.body);
    }
    match frame.opcode {
        proto::opcode::PONG => {
            let pong: Pong = decode_frame_body(&frame).map_err(|e| e.to_string())?;
            let pos = pending_pings.iter().position(|p| p.seq == pong.ping_seq);
            if let Some(pos) = pos {
                let pending = pending_pings.remove(pos).expect("position just found");
                let rtt = Instant::now().duration_since(pending.sent_at);
                shared.stats.record_rtt(rtt);
                let _ = shared.recorder.record_latency(rtt);
                shared
                    .observers
                    .lock()
                    .expect("observer registry mutex poisoned")
                    .dispatch(ObserverEvent::Rtt(rtt), &shared.stats);
            } else {
                debug!(ping_seq = pong.ping_seq, "pong did not match any pending ping, ignoring");
            }
        }
        proto::opcode::PUSH_STATE => {
            let push: PushState = decode_frame_body(&frame).map_err(|e| e.to_string())?;
            let prev = shared.last_seen_push_seq.load(Ordering::SeqCst);
            if push.seq > prev {
                shared.last_seen_push_seq.store(push.seq, Ordering::SeqCst);
                let _ = shared.recorder.record_event(
                    EventKind::MessageReceive,
                    opcode_seq_attrs(frame.opcode, push.seq),
                );
                shared
                    .observers
                    .lock()
                    .expect("observer registry mutex poisoned")
                    .dispatch(ObserverEvent::PushState(push), &shared.stats);
            } else {
                debug!(seq = push.seq, prev, "dropping out-of-order or duplicate push");
                shared.stats.record_dedup_drop();
            }
        }
        proto::opcode::ACTION_ACK => {
            let ack: ActionAck = decode_frame_body(&frame).map_err(|e| e.to_string())?;
            // Correlate against the `MessageSend` event by the *request's*
            // opcode, not this reply frame's own opcode, so the analyser's
            // (opcode, sequence_number) matching key lines up with the
            // action that was sent.
            let _ = shared.recorder.record_event(
                EventKind::MessageReceive,
                opcode_seq_attrs(proto::opcode::ACTION, ack.action_seq),
            );
            shared
                .observers
                .lock()
                .expect("observer registry mutex poisoned")
                .dispatch(ObserverEvent::ActionAck(ack), &shared.stats);
        }
        proto::opcode::ERROR => {
            let err: ErrorFrame = decode_frame_body(&frame).map_err(|e| e.to_string())?;
            let _ = shared.recorder.record_event(EventKind::Error, BTreeMap::new());
            shared
                .observers
                .lock()
                .expect("observer registry mutex poisoned")
                .dispatch(ObserverEvent::Error(err), &shared.stats);
        }
        other => {
            debug!(opcode = format!("{other:#06x}"), "ignoring unrecognized opcode");
        }
    }
    Ok(())
}

async fn run_connection(
    shared: &Shared,
    mut ws: WsStream,
    decoder: Decoder,
    mut action_rx: mpsc::Receiver<Action>,
) -> ConnectionExit {
    let codec = Codec::new(shared.config.max_frame_size);
    let mut heartbeat_tick = tokio::time::interval(shared.config.heartbeat_interval);
    heartbeat_tick.tick().await;
    let mut pending_pings: VecDeque<PendingPing> = VecDeque::new();
    let mut reader = FrameReader {
        ws: &mut ws,
        decoder,
    };

    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            let _ = reader.ws.close(None).await;
            return ConnectionExit::Closed;
        }

        tokio::select! {
            frame = reader.next_frame() => {
                match frame {
                    Ok(Some(frame)) => {
                        shared.stats.record_message_received();
                        if let Err(reason) = handle_incoming_frame(shared, frame, &mut pending_pings) {
                            return ConnectionExit::Lost(reason);
                        }
                    }
                    Ok(None) => return ConnectionExit::Lost("connection closed by peer".to_owned()),
                    Err(e) => return ConnectionExit::Lost(e.to_string()),
                }
            }
            _ = heartbeat_tick.tick() => {
                let now = Instant::now();
                let mut newly_lost = 0u64;
                for p in pending_pings.iter_mut() {
                    if !p.counted_lost && now.duration_since(p.sent_at) > shared.config.ping_timeout {
                        p.counted_lost = true;
                        newly_lost += 1;
                    }
                }
                if newly_lost > 0 {
                    shared.stats.record_pings_lost(newly_lost);
                }
                if pending_pings.len() >= shared.config.max_in_flight_pings as usize {
                    return ConnectionExit::Lost(format!(
                        "{} pings unanswered, exceeding max_in_flight_pings ({})",
                        pending_pings.len(),
                        shared.config.max_in_flight_pings
                    ));
                }
                let ping_seq = shared.ping_seq.fetch_add(1, Ordering::SeqCst);
                let ping = Ping { client_unix_ms: now_unix_ms(), ping_seq };
                if write_frame(shared, reader.ws, &codec, opcode::PING, &ping).await.is_err() {
                    return ConnectionExit::Lost("failed to send ping".to_owned());
                }
                pending_pings.push_back(PendingPing { seq: ping_seq, sent_at: now, counted_lost: false });
                shared.stats.record_message_sent();
            }
            maybe_action = action_rx.recv() => {
                if let Some(action) = maybe_action {
                    if write_frame(shared, reader.ws, &codec, opcode::ACTION, &action).await.is_err() {
                        return ConnectionExit::Lost("failed to send action".to_owned());
                    }
                    shared.stats.record_message_sent();
                    let _ = shared.recorder.record_event(
                        EventKind::MessageSend,
                        opcode_seq_attrs(opcode::ACTION, action.action_seq),
                    );
                }
            }
            _ = shared.shutdown_notify.notified() => {
                let _ = reader.ws.close(None).await;
                return ConnectionExit::Closed;
            }
        }
    }
}

/// Owns the connection established by [`GameClient::connect`] and, on
/// loss, the reconnect loop: exponential backoff with full jitter,
/// bounded by `reconnect_max_elapsed` and `max_reconnect_tries`, whichever
/// is exhausted first. The action-sequence counter and dedup state live
/// on `Shared` and are untouched by reconnects, per `spec.md` §4.3
/// "clients do NOT reset".
async fn run_supervisor(
    shared: Arc<Shared>,
    ws: WsStream,
    decoder: Decoder,
    action_rx: mpsc::Receiver<Action>,
) {
    let exit = run_connection(&shared, ws, decoder, action_rx).await;
    if matches!(exit, ConnectionExit::Closed) {
        set_state(&shared, ClientState::Closed);
        return;
    }
    note_connection_lost(&shared, exit);

    let mut backoff = shared.config.reconnect_initial_interval;
    let mut attempts: u32 = 0;
    let reconnect_deadline = shared
        .config
        .reconnect_max_elapsed
        .map(|budget| Instant::now() + budget);

    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            set_state(&shared, ClientState::Closed);
            return;
        }

        attempts += 1;
        if let Some(max) = shared.config.max_reconnect_tries {
            if attempts > max {
                warn!(attempts, "max_reconnect_tries exhausted, giving up");
                set_state(&shared, ClientState::Disconnected);
                return;
            }
        }
        if let Some(deadline) = reconnect_deadline {
            if Instant::now() >= deadline {
                warn!("reconnect_max_elapsed exhausted, giving up");
                set_state(&shared, ClientState::Disconnected);
                return;
            }
        }

        set_state(&shared, ClientState::Reconnecting);
        shared.stats.record_reconnect();
        let _ = shared.recorder.record_event(EventKind::Reconnect, BTreeMap::new());

        let sleep_for = jittered(backoff);
        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = shared.shutdown_notify.notified() => {
                set_state(&shared, ClientState::Closed);
                return;
            }
        }
        backoff = next_backoff(backoff, shared.config.reconnect_max_interval, shared.config.reconnect_multiplier);

        if shared.shutdown.load(Ordering::SeqCst) {
            set_state(&shared, ClientState::Closed);
            return;
        }

        set_state(&shared, ClientState::Connecting);
        shared.stats.record_connect_attempt();
        match tokio::time::timeout(shared.config.handshake_timeout, connect_and_handshake(&shared))
            .await
        {
            Ok(Ok((ws, login, decoder))) => {
                backoff = shared.config.reconnect_initial_interval;
                attempts = 0;
                info!(player_id = %login.player_id, session_id = %login.session_id, "reconnect login accepted");
                let _ = shared.recorder.record_event(EventKind::Login, BTreeMap::new());
                set_state(&shared, ClientState::Connected);

                let (action_tx, action_rx) = mpsc::channel(64);
                *shared
                    .action_tx_slot
                    .lock()
                    .expect("action sender slot mutex poisoned") = Some(action_tx);

                let exit = run_connection(&shared, ws, decoder, action_rx).await;

                *shared
                    .action_tx_slot
                    .lock()
                    .expect("action sender slot mutex poisoned") = None;

                if matches!(exit, ConnectionExit::Closed) {
                    set_state(&shared, ClientState::Closed);
                    return;
                }
                note_connection_lost(&shared, exit);
            }
            Ok(Err(e)) => warn!(error = %e, "reconnect attempt failed"),
            Err(_) => warn!("reconnect attempt timed out"),
        }
    }
}

fn note_connection_lost(shared: &Shared, exit: ConnectionExit) {
    if let ConnectionExit::Lost(reason) = exit {
        warn!(reason = %reason, "connection lost");
        let mut attrs = BTreeMap::new();
        attrs.insert(attr_keys::DESCRIPTION.to_owned(), AttrValue::Str(reason));
        let _ = shared.recorder.record_event(EventKind::Error, attrs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_by_multiplier_up_to_cap() {
        let max = Duration::from_secs(10);
        let mut backoff = Duration::from_millis(500);
        for _ in 0..3 {
            backoff = next_backoff(backoff, max, 2.0);
        }
        assert_eq!(backoff, Duration::from_secs(4));
        for _ in 0..10 {
            backoff = next_backoff(backoff, max, 2.0);
        }
        assert_eq!(backoff, max);
    }

    #[test]
    fn multiplier_of_one_holds_backoff_steady() {
        let base = Duration::from_millis(500);
        let next = next_backoff(base, Duration::from_secs(10), 1.0);
        assert_eq!(next, base);
    }

    #[test]
    fn jitter_stays_within_expected_band() {
        let base = Duration::from_millis(1000);
        for _ in 0..50 {
            let j = jittered(base);
            assert!(j >= Duration::from_millis(500));
            assert!(j <= Duration::from_millis(1500));
        }
    }
}
