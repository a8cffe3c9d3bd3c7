use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{Notify, RwLock};
use uuid::Uuid;

use proto::{Action, ActionAck};

use crate::config::ServerConfig;

/// Identifies one accepted connection.
pub type ConnId = Uuid;

/// A small bounded ring buffer with a drop-oldest overflow policy: pushing
/// past `capacity` evicts the oldest undelivered frame and increments a
/// counter, rather than blocking the shared push ticker or failing
/// closed like a plain `mpsc::Sender::try_send` would. Mirrors
/// `client_engine`'s observer dispatch queue on the other side of the
/// connection.
pub struct PushQueue {
    capacity: usize,
    inner: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
    drops: AtomicU64,
}

impl PushQueue {
    pub fn new(capacity: usize) -> Self {
        PushQueue {
            capacity,
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            drops: AtomicU64::new(0),
        }
    }

    /// Enqueue a pre-encoded frame. Returns `true` if an older frame was
    /// dropped to make room.
    pub fn push(&self, frame: Vec<u8>) -> bool {
        let mut dropped = false;
        {
            let mut guard = self.inner.lock().expect("push queue mutex poisoned");
            if guard.len() >= self.capacity {
                guard.pop_front();
                dropped = true;
            }
            guard.push_back(frame);
        }
        if dropped {
            self.drops.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        dropped
    }

    pub async fn pop(&self) -> Vec<u8> {
        loop {
            {
                let mut guard = self.inner.lock().expect("push queue mutex poisoned");
                if let Some(frame) = guard.pop_front() {
                    return frame;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn drop_count(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }
}

/// Server-side handle to one live connection: everything the push ticker,
/// the shutdown routine, and the action-handling path need without
/// touching the socket directly.
pub struct ConnHandle {
    pub id: ConnId,
    pub device_id: String,
    pub player_id: String,
    pub queue: Arc<PushQueue>,
    /// Signalled by `shutdown()` to ask the writer task to send a close
    /// frame and exit; also signalled per-connection on idle timeout.
    pub close_notify: Arc<Notify>,
    /// Highest `action_seq` accepted so far, for monotonicity checks.
    pub last_action_seq: AtomicU64,
    pub last_activity: Mutex<Instant>,
}

impl ConnHandle {
    pub fn touch(&self) {
        *self.last_activity.lock().expect("activity mutex poisoned") = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .expect("activity mutex poisoned")
            .elapsed()
    }
}

/// Decides how a connection's [`Action`] frames are acknowledged. Swappable
/// so tests can assert on custom business logic without a general plugin
/// system.
pub trait ActionHandler: Send + Sync {
    fn handle(&self, action: &Action) -> ActionAck;
}

/// Default handler: acknowledges every action as accepted.
pub struct EchoActionHandler;

impl ActionHandler for EchoActionHandler {
    fn handle(&self, action: &Action) -> ActionAck {
        ActionAck {
            action_seq: action.action_seq,
            ok: true,
        }
    }
}

/// Point-in-time snapshot of [`ServerStatsInner`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub current_connections: u64,
    pub total_connections: u64,
    pub total_messages_in: u64,
    pub total_messages_out: u64,
    pub push_drops: u64,
    pub uptime: Duration,
}

/// Atomic counters readable concurrently with traffic, per `spec.md` §4.4
/// "uses atomic counters, not locks".
pub struct ServerStatsInner {
    start: Instant,
    current_connections: AtomicU64,
    total_connections: AtomicU64,
    total_messages_in: AtomicU64,
    total_messages_out: AtomicU64,
    push_drops: AtomicU64,
}

impl Default for ServerStatsInner {
    fn default() -> Self {
        ServerStatsInner {
            start: Instant::now(),
            current_connections: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            total_messages_in: AtomicU64::new(0),
            total_messages_out: AtomicU64::new(0),
            push_drops: AtomicU64::new(0),
        }
    }
}

impl ServerStatsInner {
    pub fn record_connect(&self) {
        self.current_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disconnect(&self) {
        self.current_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_message_in(&self) {
        self.total_messages_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_out(&self) {
        self.total_messages_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_push_drop(&self, count: u64) {
        self.push_drops.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ServerStats {
        ServerStats {
            current_connections: self.current_connections.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            total_messages_in: self.total_messages_in.load(Ordering::Relaxed),
            total_messages_out: self.total_messages_out.load(Ordering::Relaxed),
            push_drops: self.push_drops.load(Ordering::Relaxed),
            uptime: self.start.elapsed(),
        }
    }
}

/// Shared state behind every connection handler, cloned cheaply (every
/// field is an `Arc`) into each axum handler invocation.
#[derive(Clone)]
pub struct ServerState {
    pub connections: Arc<RwLock<HashMap<ConnId, Arc<ConnHandle>>>>,
    pub push_seq: Arc<AtomicU64>,
    pub stats: Arc<ServerStatsInner>,
    pub action_handler: Arc<dyn ActionHandler>,
    pub config: Arc<ServerConfig>,
    pub accepting: Arc<std::sync::atomic::AtomicBool>,
}

impl ServerState {
    pub fn new(config: ServerConfig) -> Self {
        ServerState {
            connections: Arc::new(RwLock::new(HashMap::new())),
            push_seq: Arc::new(AtomicU64::new(0)),
            stats: Arc::new(ServerStatsInner::default()),
            action_handler: Arc::new(EchoActionHandler),
            config: Arc::new(config),
            accepting: Arc::new(std::sync::atomic::AtomicBool::new(true)),
        }
    }

    pub fn with_action_handler(mut self, handler: Arc<dyn ActionHandler>) -> Self {
        self.action_handler = handler;
        self
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_queue_drops_oldest_once_at_capacity() {
        let q = PushQueue::new(2);
        assert!(!q.push(vec![1]));
        assert!(!q.push(vec![2]));
        assert!(q.push(vec![3]));
        assert_eq!(q.drop_count(), 1);
        assert_eq!(q.pop().await, vec![2]);
        assert_eq!(q.pop().await, vec![3]);
    }

    #[test]
    fn echo_action_handler_always_acks_ok() {
        let handler = EchoActionHandler;
        let ack = handler.handle(&Action {
            action_seq: 7,
            player_id: "p1".to_owned(),
            action_kind: "move".to_owned(),
            payload: serde_json::Value::Null,
            client_time_ms: 0,
        });
        assert_eq!(ack.action_seq, 7);
        assert!(ack.ok);
    }

    #[test]
    fn stats_snapshot_reflects_connect_and_disconnect() {
        let stats = ServerStatsInner::default();
        stats.record_connect();
        stats.record_connect();
        stats.record_disconnect();
        let snap = stats.snapshot();
        assert_eq!(snap.current_connections, 1);
        assert_eq!(snap.total_connections, 2);
    }
}
