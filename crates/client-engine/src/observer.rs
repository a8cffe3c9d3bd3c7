use std::sync::Arc;
use std::time::Duration;

use proto::{ActionAck, ErrorFrame, PushState};

use crate::backpressure::DropOldestQueue;
use crate::state::ClientState;
use crate::stats::ClientStatsInner;

/// An event delivered to a registered [`ClientObserver`].
#[derive(Debug, Clone)]
pub enum ObserverEvent {
    PushState(PushState),
    ActionAck(ActionAck),
    Error(ErrorFrame),
    StateChange(ClientState),
    Rtt(Duration),
}

/// Callback interface for consuming client-observed events off the
/// protocol hot path. Default methods are no-ops so observers only
/// implement what they care about.
pub trait ClientObserver: Send + 'static {
    fn on_push_state(&mut self, _push: &PushState) {}
    fn on_action_ack(&mut self, _ack: &ActionAck) {}
    fn on_error(&mut self, _err: &ErrorFrame) {}
    fn on_state_change(&mut self, _state: ClientState) {}
    fn on_rtt(&mut self, _rtt: Duration) {}

    fn on_event(&mut self, event: &ObserverEvent) {
        match event {
            ObserverEvent::PushState(p) => self.on_push_state(p),
            ObserverEvent::ActionAck(a) => self.on_action_ack(a),
            ObserverEvent::Error(e) => self.on_error(e),
            ObserverEvent::StateChange(s) => self.on_state_change(*s),
            ObserverEvent::Rtt(d) => self.on_rtt(*d),
        }
    }
}

/// One registered observer: a bounded drop-oldest queue plus the background
/// task draining it into the observer's callbacks.
struct ObserverHandle {
    queue: Arc<DropOldestQueue<ObserverEvent>>,
    _task: tokio::task::JoinHandle<()>,
}

/// Owns every registered observer and fans out events to each of them
/// without letting a slow observer block message delivery.
#[derive(Default)]
pub struct ObserverRegistry {
    handles: Vec<ObserverHandle>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        ObserverRegistry::default()
    }

    pub fn register(&mut self, mut observer: Box<dyn ClientObserver>, queue_capacity: usize) {
        let queue = Arc::new(DropOldestQueue::new(queue_capacity));
        let worker_queue = queue.clone();
        let task = tokio::spawn(async move {
            loop {
                let event = worker_queue.pop().await;
                observer.on_event(&event);
            }
        });
        self.handles.push(ObserverHandle {
            queue,
            _task: task,
        });
    }

    pub fn dispatch(&self, event: ObserverEvent, stats: &ClientStatsInner) {
        for handle in &self.handles {
            if handle.queue.push(event.clone()) {
                stats.record_callback_drop();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }
}

impl Drop for ObserverRegistry {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle._task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingObserver(Arc<AtomicU64>);
    impl ClientObserver for CountingObserver {
        fn on_push_state(&mut self, _push: &PushState) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn dispatch_invokes_registered_observer() {
        let count = Arc::new(AtomicU64::new(0));
        let mut registry = ObserverRegistry::new();
        let stats = Arc::new(ClientStatsInner::default());
        registry.register(Box::new(CountingObserver(count.clone())), 16);

        registry.dispatch(
            ObserverEvent::PushState(PushState {
                seq: 1,
                business_id: "m".to_owned(),
                state_fingerprint: "f".to_owned(),
                units: vec![],
                server_time_ms: 0,
            }),
            &stats,
        );

        // Allow the background task to drain the queue.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn overflow_increments_callback_drops() {
        let count = Arc::new(AtomicU64::new(0));
        let mut registry = ObserverRegistry::new();
        let stats = Arc::new(ClientStatsInner::default());
        // Capacity 1 with the consumer never scheduled: push several events
        // back-to-back before yielding, forcing drops.
        registry.register(Box::new(CountingObserver(count.clone())), 1);

        for seq in 0..5u64 {
            registry.dispatch(
                ObserverEvent::PushState(PushState {
                    seq,
                    business_id: "m".to_owned(),
                    state_fingerprint: "f".to_owned(),
                    units: vec![],
                    server_time_ms: 0,
                }),
                &stats,
            );
        }
        assert!(stats.snapshot().callback_drops > 0);
    }
}
