//! Per-session inbound message queue.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

struct QueueState<M> {
    messages: VecDeque<M>,
    closed: bool,
}

/// FIFO of assembled messages, filled by a session's read loop and drained by
/// the dispatch layer
pub struct InboundQueue<M> {
    state: Mutex<QueueState<M>>,
    notify: Notify,
}

impl<M> InboundQueue<M> {
    /// Create an empty, open queue
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                messages: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Append a message. Returns false (and drops it) if the queue is closed.
    pub fn push(&self, message: M) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.messages.push_back(message);
        }
        self.notify.notify_one();
        true
    }

    /// Take the oldest message without waiting
    pub fn try_pop(&self) -> Option<M> {
        self.state.lock().messages.pop_front()
    }

    /// Wait for the oldest message; `None` once the queue is closed and empty
    pub async fn pop(&self) -> Option<M> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(message) = state.messages.pop_front() {
                    if !state.messages.is_empty() {
                        // Hand the remaining backlog to another waiter
                        self.notify.notify_one();
                    }
                    return Some(message);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Number of queued messages
    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    /// Whether no messages are queued
    pub fn is_empty(&self) -> bool {
        self.state.lock().messages.is_empty()
    }

    /// Whether the queue has been closed
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Close the queue, discard everything in it and wake all waiters.
    ///
    /// Returns the number of discarded messages.
    pub fn close_and_drain(&self) -> usize {
        let drained = {
            let mut state = self.state.lock();
            state.closed = true;
            let drained = state.messages.len();
            state.messages.clear();
            drained
        };
        self.notify.notify_waiters();
        drained
    }
}

impl<M> Default for InboundQueue<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let queue = InboundQueue::new();
        for i in 0..5 {
            assert!(queue.push(i));
        }
        assert_eq!(queue.len(), 5);

        let drained: Vec<_> = std::iter::from_fn(|| queue.try_pop()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_close_discards() {
        let queue = InboundQueue::new();
        queue.push("a");
        queue.push("b");

        assert_eq!(queue.close_and_drain(), 2);
        assert!(queue.is_closed());
        assert!(queue.try_pop().is_none());
        assert!(!queue.push("c"));
        assert_eq!(queue.close_and_drain(), 0);
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(InboundQueue::new());

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(42u32);

        assert_eq!(consumer.await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let queue: Arc<InboundQueue<u32>> = Arc::new(InboundQueue::new());

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.pop().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close_and_drain();

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn test_multiple_consumers_receive_everything() {
        let queue = Arc::new(InboundQueue::new());
        for i in 0..100u32 {
            queue.push(i);
        }

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    let mut taken = Vec::new();
                    while let Some(value) = queue.try_pop() {
                        taken.push(value);
                    }
                    taken
                })
            })
            .collect();

        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.await.unwrap());
        }
        all.sort_unstable();
        assert_eq!(all, (0..100).collect::<Vec<_>>());
    }
}
