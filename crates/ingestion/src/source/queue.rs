use std::collections::VecDeque;
use tokio::sync::{Mutex as AsyncMutex, Notify};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OverflowPolicy {
    /// Producer waits for space; nothing is lost, the stream slows down.
    Block,
    /// Oldest queued record is replaced; freshness wins over completeness.
    DropOldest,
}

impl OverflowPolicy {
    pub(crate) fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "drop_oldest" | "drop-oldest" => Self::DropOldest,
            _ => Self::Block,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PushOutcome {
    pub(crate) backpressured: bool,
    pub(crate) replaced_oldest: bool,
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded hand-off queue between a stream task and its consumer. `push`
/// honors the overflow policy; `pop` returns `None` only after `close`.
pub(crate) struct BoundedQueue<T> {
    state: AsyncMutex<QueueState<T>>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
}

impl<T> BoundedQueue<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: AsyncMutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity: capacity.max(1),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    /// `None` means the queue was closed and the item discarded.
    pub(crate) async fn push(&self, item: T, policy: OverflowPolicy) -> Option<PushOutcome> {
        let mut pending = Some(item);
        let mut backpressured = false;
        loop {
            let mut state = self.state.lock().await;
            if state.closed {
                return None;
            }
            if state.items.len() < self.capacity {
                state
                    .items
                    .push_back(pending.take().expect("pending item before enqueue"));
                drop(state);
                self.not_empty.notify_one();
                return Some(PushOutcome {
                    backpressured,
                    replaced_oldest: false,
                });
            }
            if policy == OverflowPolicy::DropOldest {
                let _ = state.items.pop_front();
                state
                    .items
                    .push_back(pending.take().expect("pending item before replacement"));
                drop(state);
                self.not_empty.notify_one();
                self.not_full.notify_one();
                return Some(PushOutcome {
                    backpressured,
                    replaced_oldest: true,
                });
            }
            backpressured = true;
            drop(state);
            self.not_full.notified().await;
        }
    }

    pub(crate) async fn pop(&self) -> Option<T> {
        loop {
            let mut state = self.state.lock().await;
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            drop(state);
            self.not_empty.notified().await;
        }
    }

    pub(crate) async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        drop(state);
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_pop_preserves_order() {
        let queue = BoundedQueue::new(4);
        for n in 0..4 {
            queue.push(n, OverflowPolicy::Block).await.unwrap();
        }
        for n in 0..4 {
            assert_eq!(queue.pop().await, Some(n));
        }
    }

    #[tokio::test]
    async fn drop_oldest_replaces_front_when_full() {
        let queue = BoundedQueue::new(2);
        queue.push(1, OverflowPolicy::DropOldest).await.unwrap();
        queue.push(2, OverflowPolicy::DropOldest).await.unwrap();
        let outcome = queue.push(3, OverflowPolicy::DropOldest).await.unwrap();
        assert!(outcome.replaced_oldest);
        assert_eq!(queue.pop().await, Some(2));
        assert_eq!(queue.pop().await, Some(3));
    }

    #[tokio::test]
    async fn pop_returns_none_after_close() {
        let queue: BoundedQueue<u8> = BoundedQueue::new(1);
        queue.close().await;
        assert_eq!(queue.pop().await, None);
        assert!(queue.push(1, OverflowPolicy::Block).await.is_none());
    }
}
