//! Work queues
//!
//! This module provides:
//! - [`WorkQueue`] - the seam workers use for the main and retry queues
//! - [`InMemoryQueue`] - a FIFO with bounded-wait pop, also used as the client pool backing
//!
//! Producers (change-feed pollers, the retry re-merger) live outside this crate
//! and only need a [`WorkQueue`] implementation.

mod memory;

use std::time::Duration;

use async_trait::async_trait;

use crate::item::QueueItem;

pub use memory::InMemoryQueue;

/// A shared FIFO-ish queue of [`QueueItem`]s
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Take the next item, waiting at most `timeout`.
    ///
    /// Returns `None` straight away when the queue is drained.
    async fn pop(&self, timeout: Duration) -> Option<QueueItem>;

    /// Enqueue an item without blocking
    fn push(&self, item: QueueItem);

    /// Number of items currently queued
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
