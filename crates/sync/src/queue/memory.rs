//! In-memory queue with bounded-wait pop

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::WorkQueue;
use crate::item::QueueItem;

/// Unbounded FIFO shared between tasks
///
/// # Example
///
/// ```
/// use edge_sync::queue::InMemoryQueue;
///
/// let queue = InMemoryQueue::new();
/// queue.push_item(1);
/// queue.push_item(2);
/// assert_eq!(queue.try_pop(), Some(1));
/// assert_eq!(queue.size(), 1);
/// ```
pub struct InMemoryQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T: Send> InMemoryQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Enqueue at the back and wake one waiter
    pub fn push_item(&self, item: T) {
        self.items.lock().push_back(item);
        self.notify.notify_one();
    }

    /// Take the front item if there is one
    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Take the front item, waiting up to `timeout` when another task races
    /// us for it. A drained queue returns `None` without waiting.
    pub async fn pop_within(&self, timeout: Duration) -> Option<T> {
        if self.size() == 0 {
            return None;
        }

        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop();
            }
        }
    }

    pub fn size(&self) -> usize {
        self.items.lock().len()
    }

    /// Remove and return everything queued
    pub fn drain(&self) -> Vec<T> {
        self.items.lock().drain(..).collect()
    }
}

impl<T: Send> Default for InMemoryQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> FromIterator<T> for InMemoryQueue<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            items: Mutex::new(iter.into_iter().collect()),
            notify: Notify::new(),
        }
    }
}

#[async_trait]
impl WorkQueue for InMemoryQueue<QueueItem> {
    async fn pop(&self, timeout: Duration) -> Option<QueueItem> {
        self.pop_within(timeout).await
    }

    fn push(&self, item: QueueItem) {
        self.push_item(item);
    }

    fn len(&self) -> usize {
        self.size()
    }
}
