use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Point-in-time snapshot of a client's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub connect_attempts: u64,
    pub reconnect_count: u64,
    pub dedup_drops: u64,
    pub callback_drops: u64,
    pub pings_lost: u64,
    pub last_rtt_nanos: Option<u64>,
}

impl ClientStats {
    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt_nanos.map(Duration::from_nanos)
    }
}

/// The atomic counters backing [`ClientStats`]. Shared via `Arc` between the
/// supervisor task, connection tasks, and the handle returned to callers.
#[derive(Debug, Default)]
pub struct ClientStatsInner {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    connect_attempts: AtomicU64,
    reconnect_count: AtomicU64,
    dedup_drops: AtomicU64,
    callback_drops: AtomicU64,
    pings_lost: AtomicU64,
    last_rtt_nanos: AtomicU64,
    has_rtt: std::sync::atomic::AtomicBool,
}

impl ClientStatsInner {
    pub fn record_message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnect_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dedup_drop(&self) {
        self.dedup_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_callback_drop(&self) {
        self.callback_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pings_lost(&self, count: u64) {
        self.pings_lost.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_rtt(&self, rtt: Duration) {
        self.last_rtt_nanos
            .store(rtt.as_nanos() as u64, Ordering::Relaxed);
        self.has_rtt.store(true, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ClientStats {
        ClientStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            reconnect_count: self.reconnect_count.load(Ordering::Relaxed),
            dedup_drops: self.dedup_drops.load(Ordering::Relaxed),
            callback_drops: self.callback_drops.load(Ordering::Relaxed),
            pings_lost: self.pings_lost.load(Ordering::Relaxed),
            last_rtt_nanos: self
                .has_rtt
                .load(Ordering::Relaxed)
                .then(|| self.last_rtt_nanos.load(Ordering::Relaxed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_counters() {
        let inner = ClientStatsInner::default();
        inner.record_message_sent();
        inner.record_message_sent();
        inner.record_dedup_drop();
        inner.record_rtt(Duration::from_millis(20));

        let snap = inner.snapshot();
        assert_eq!(snap.messages_sent, 2);
        assert_eq!(snap.dedup_drops, 1);
        assert_eq!(snap.last_rtt(), Some(Duration::from_millis(20)));
    }

    #[test]
    fn last_rtt_is_none_before_any_heartbeat() {
        let inner = ClientStatsInner::default();
        assert_eq!(inner.snapshot().last_rtt(), None);
    }
}
