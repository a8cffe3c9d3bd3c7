use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{info, warn};
use uuid::Uuid;

use frame_codec::Codec;
use proto::{encode_message, opcode, PushState};

use crate::config::ServerConfig;
use crate::handler::ws_handler;
use crate::state::{ActionHandler, ServerState, ServerStats};

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A running test server: one `/ws` route, a shared push ticker, and an
/// explicit [`shutdown`](TestServer::shutdown) that tests can call directly
/// rather than needing a signal handler, per `spec.md` §4.4 item 4.
pub struct TestServer {
    local_addr: std::net::SocketAddr,
    state: ServerState,
    serve_task: tokio::task::JoinHandle<()>,
    push_task: tokio::task::JoinHandle<()>,
    shutdown_notify: Arc<Notify>,
}

impl TestServer {
    /// Bind `config.bind_addr`, start serving `/ws`, and start the push
    /// ticker. Returns once the listener is bound so `local_addr()` is
    /// immediately valid.
    pub async fn start(config: ServerConfig) -> std::io::Result<Self> {
        Self::start_with_action_handler(config, Arc::new(crate::state::EchoActionHandler)).await
    }

    pub async fn start_with_action_handler(
        config: ServerConfig,
        action_handler: Arc<dyn ActionHandler>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let push_interval = config.push_interval;
        let state = ServerState::new(config).with_action_handler(action_handler);

        let router = Router::new()
            .route("/ws", get(ws_handler))
            .with_state(state.clone());

        let shutdown_notify = Arc::new(Notify::new());
        let serve_shutdown = shutdown_notify.clone();
        let serve_task = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    serve_shutdown.notified().await;
                })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "test server accept loop exited with error");
            }
        });

        let push_task = spawn_push_ticker(state.clone(), push_interval, shutdown_notify.clone());

        info!(addr = %local_addr, "test server listening");
        Ok(TestServer {
            local_addr,
            state,
            serve_task,
            push_task,
            shutdown_notify,
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.local_addr)
    }

    pub fn get_stats(&self) -> ServerStats {
        self.state.stats.snapshot()
    }

    /// Forcibly close every currently-live connection without stopping the
    /// push ticker or the accept loop, so new connections (e.g. a client's
    /// own reconnect) are still welcomed afterward. Used by tests that
    /// exercise the server-side half of a client reconnect scenario; the
    /// server itself never initiates a reconnect, it just stops serving
    /// the old transport.
    pub async fn disconnect_all(&self) {
        for handle in self.state.connections.read().await.values() {
            handle.close_notify.notify_waiters();
        }
    }

    /// Stop accepting new connections, stop the push ticker, ask every live
    /// connection to close, then wait up to `deadline` for all per-
    /// connection tasks to exit. Connections still open past `deadline` are
    /// forcibly abandoned (the underlying tasks are daemon tasks, dropped
    /// with the runtime rather than joined).
    pub async fn shutdown(self, deadline: Duration) {
        self.state.accepting.store(false, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();

        for handle in self.state.connections.read().await.values() {
            handle.close_notify.notify_waiters();
        }

        let wait_for_drain = async {
            loop {
                if self.state.connection_count().await == 0 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        if tokio::time::timeout(deadline, wait_for_drain).await.is_err() {
            warn!("shutdown deadline elapsed with connections still open");
        }

        self.push_task.abort();
        self.serve_task.abort();
    }
}

fn spawn_push_ticker(
    state: ServerState,
    push_interval: Duration,
    shutdown_notify: Arc<Notify>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let codec = Codec::new(state.config.max_frame_size);
        let mut ticker = tokio::time::interval(push_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !state.accepting.load(Ordering::SeqCst) {
                        continue;
                    }
                    let seq = state.push_seq.fetch_add(1, Ordering::SeqCst) + 1;
                    let push = PushState {
                        seq,
                        business_id: Uuid::nil().to_string(),
                        state_fingerprint: format!("tick-{seq}"),
                        units: Vec::new(),
                        server_time_ms: now_unix_ms(),
                    };
                    let Ok(bytes) = encode_message(&codec, opcode::PUSH_STATE, &push) else {
                        continue;
                    };
                    let conns = state.connections.read().await;
                    let mut drops = 0u64;
                    for handle in conns.values() {
                        if handle.queue.push(bytes.clone()) {
                            drops += 1;
                        }
                        state.stats.record_message_out();
                    }
                    if drops > 0 {
                        state.stats.record_push_drop(drops);
                    }
                }
                _ = shutdown_notify.notified() => return,
            }
        }
    })
}
