use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

/// A bounded FIFO queue that drops the oldest entry (rather than rejecting
/// the new one) when full, counting every drop.
///
/// Used for per-observer dispatch: a slow or wedged observer must not block
/// the reader task delivering live protocol messages, and the client would
/// rather lose stale history than fall behind real time.
pub struct DropOldestQueue<T> {
    capacity: usize,
    inner: Mutex<VecDeque<T>>,
    notify: Notify,
    drops: std::sync::atomic::AtomicU64,
}

impl<T> DropOldestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        DropOldestQueue {
            capacity: capacity.max(1),
            inner: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            notify: Notify::new(),
            drops: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Push a value, dropping the oldest queued value if at capacity.
    /// Returns `true` if a drop occurred.
    pub fn push(&self, value: T) -> bool {
        let mut dropped = false;
        {
            let mut guard = self.inner.lock().expect("drop-oldest queue mutex poisoned");
            if guard.len() >= self.capacity {
                guard.pop_front();
                dropped = true;
            }
            guard.push_back(value);
        }
        if dropped {
            self.drops.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        self.notify.notify_one();
        dropped
    }

    /// Await the next value, in FIFO order.
    pub async fn pop(&self) -> T {
        loop {
            {
                let mut guard = self.inner.lock().expect("drop-oldest queue mutex poisoned");
                if let Some(v) = guard.pop_front() {
                    return v;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn drop_count(&self) -> u64 {
        self.drops.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("drop-oldest queue mutex poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_drops_oldest_once_at_capacity() {
        let q: DropOldestQueue<i32> = DropOldestQueue::new(2);
        assert!(!q.push(1));
        assert!(!q.push(2));
        assert!(q.push(3));
        assert_eq!(q.len(), 2);
        assert_eq!(q.drop_count(), 1);
    }

    #[tokio::test]
    async fn pop_returns_values_in_fifo_order_after_a_drop() {
        let q: DropOldestQueue<i32> = DropOldestQueue::new(2);
        q.push(1);
        q.push(2);
        q.push(3); // drops 1
        assert_eq!(q.pop().await, 2);
        assert_eq!(q.pop().await, 3);
    }
}
