//! FIFO event queue pairing the socket read loop with the host-facing stream.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

/// Multi-producer, single-consumer FIFO with explicit close.
///
/// The socket read loop pushes; the turn stream takes. `close` wakes the
/// suspended taker, after which `take` returns `None` for good. Values pushed
/// after close are discarded, so nothing buffered post-close is ever
/// delivered.
pub struct EventQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

struct QueueState<T> {
    buffer: VecDeque<T>,
    closed: bool,
}

impl<T> EventQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                buffer: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueues a value, handing it to a waiting taker if one is suspended.
    /// Dropped silently when the queue is closed.
    pub fn push(&self, value: T) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        if state.closed {
            return;
        }
        state.buffer.push_back(value);
        drop(state);
        self.notify.notify_one();
    }

    /// Takes the oldest buffered value, suspending until one is pushed or the
    /// queue is closed. Returns `None` once closed and drained of values that
    /// were buffered before the close.
    pub async fn take(&self) -> Option<T> {
        loop {
            {
                let mut state = self.state.lock().expect("queue lock poisoned");
                if let Some(value) = state.buffer.pop_front() {
                    return Some(value);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Closes the queue and wakes the suspended taker. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("queue lock poisoned").closed
    }
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn take_returns_buffered_values_in_order() {
        let queue = EventQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.take().await, Some(1));
        assert_eq!(queue.take().await, Some(2));
        assert_eq!(queue.take().await, Some(3));
    }

    #[tokio::test]
    async fn take_suspends_until_push() {
        let queue = Arc::new(EventQueue::new());
        let taker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.take().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push("hello");
        assert_eq!(taker.await.unwrap(), Some("hello"));
    }

    #[tokio::test]
    async fn close_wakes_suspended_taker_with_end() {
        let queue = Arc::new(EventQueue::<u32>::new());
        let taker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.take().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();
        let result = tokio::time::timeout(Duration::from_secs(1), taker)
            .await
            .expect("taker should wake in bounded time")
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn push_after_close_is_discarded() {
        let queue = EventQueue::new();
        queue.push(1);
        queue.close();
        queue.push(2);
        assert_eq!(queue.take().await, Some(1));
        assert_eq!(queue.take().await, None);
        assert_eq!(queue.take().await, None);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let queue = EventQueue::<()>::new();
        queue.close();
        queue.close();
        assert!(queue.is_closed());
    }
}
