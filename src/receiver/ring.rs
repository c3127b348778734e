//! Bounded channel that drops the *oldest* queued item on overflow instead
//! of rejecting the newest (§4.1: "drops the oldest parsed tick ... and
//! increments bufferFullCount"). `tokio::sync::mpsc` only supports the
//! opposite (reject-newest via `try_send`), so the receiver gets its own
//! small ring here instead.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
}

pub struct RingSender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for RingSender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

pub struct RingReceiver<T> {
    shared: Arc<Shared<T>>,
}

pub fn ring_channel<T>(capacity: usize) -> (RingSender<T>, RingReceiver<T>) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        capacity: capacity.max(1),
        notify: Notify::new(),
    });
    (
        RingSender {
            shared: shared.clone(),
        },
        RingReceiver { shared },
    )
}

impl<T> RingSender<T> {
    /// Pushes `item`. If the ring is already at capacity, the oldest queued
    /// item is dropped to make room and `true` is returned so the caller
    /// can count it as a buffer-full event.
    pub fn push(&self, item: T) -> bool {
        let mut queue = self.shared.queue.lock();
        let evicted = if queue.len() >= self.shared.capacity {
            queue.pop_front();
            true
        } else {
            false
        };
        queue.push_back(item);
        drop(queue);
        self.shared.notify.notify_one();
        evicted
    }
}

impl<T> RingReceiver<T> {
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            if let Some(item) = self.shared.queue.lock().pop_front() {
                return Some(item);
            }
            self.shared.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drops_oldest_when_full() {
        let (tx, mut rx) = ring_channel(2);
        assert!(!tx.push(1));
        assert!(!tx.push(2));
        assert!(tx.push(3));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn recv_waits_for_a_push() {
        let (tx, mut rx) = ring_channel::<u32>(4);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            tx.push(7);
        });
        assert_eq!(rx.recv().await, Some(7));
    }
}
