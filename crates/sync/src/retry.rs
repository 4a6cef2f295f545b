//! Retry scheduling
//!
//! Failed items are pushed onto the retry queue with a doubled backoff and
//! an incremented retry count, or dropped once the count passes the ceiling.
//! A rate-limit failure (429) leaves both untouched: throttling is the client
//! pool's concern, not the item's.
//!
//! After requeueing, the scheduler suspends the calling worker for the
//! item's previous timeout. A worker that just failed pauses before taking
//! more work, which smooths retry storms.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::client::TOO_MANY_REQUESTS;
use crate::config::SyncConfig;
use crate::events::{EventSink, SyncEvent};
use crate::item::QueueItem;
use crate::queue::WorkQueue;
use crate::shutdown::ShutdownListener;

/// What the scheduler decided for an item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Item goes back on the retry queue; the worker pauses for `pause`
    Requeue { item: QueueItem, pause: Duration },

    /// Retry ceiling exceeded, item leaves the pipeline
    Drop { item: QueueItem },
}

/// Retry backoff policy
///
/// # Example
///
/// ```
/// use edge_sync::retry::{RetryDecision, RetryPolicy};
/// use edge_sync::QueueItem;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(Duration::from_secs(10), 5);
/// match policy.plan(QueueItem::live("B", None), Some(500)) {
///     RetryDecision::Requeue { item, pause } => {
///         assert_eq!(item.timeout, Some(Duration::from_secs(20)));
///         assert_eq!(item.retries_count, Some(1));
///         assert_eq!(pause, Duration::from_secs(10));
///     }
///     RetryDecision::Drop { .. } => unreachable!(),
/// }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Backoff of an item that has never been retried
    pub default_timeout: Duration,

    /// Items whose retry count exceeds this are dropped
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(default_timeout: Duration, max_retries: u32) -> Self {
        Self {
            default_timeout,
            max_retries,
        }
    }

    /// Compute the next retry state of `item`.
    ///
    /// `status_code` is the HTTP status of the failure, if there was one.
    pub fn plan(&self, mut item: QueueItem, status_code: Option<u16>) -> RetryDecision {
        let timeout = item.timeout.unwrap_or(self.default_timeout);
        let retries = item.retries_count.unwrap_or(0);

        if status_code == Some(TOO_MANY_REQUESTS) {
            item.timeout = Some(timeout);
            item.retries_count = Some(retries);
        } else {
            item.timeout = Some(timeout.saturating_mul(2));
            item.retries_count = Some(retries.saturating_add(1));
        }

        if item.retries_count.unwrap_or(0) > self.max_retries {
            RetryDecision::Drop { item }
        } else {
            RetryDecision::Requeue {
                item,
                pause: timeout,
            }
        }
    }
}

impl From<&SyncConfig> for RetryPolicy {
    fn from(config: &SyncConfig) -> Self {
        Self::new(config.retry_default_timeout, config.max_retries)
    }
}

/// Applies a [`RetryPolicy`] against the retry queue
pub struct RetryScheduler {
    policy: RetryPolicy,
    queue: Arc<dyn WorkQueue>,
    events: Arc<dyn EventSink>,
    shutdown: ShutdownListener,
}

impl RetryScheduler {
    pub fn new(
        policy: RetryPolicy,
        queue: Arc<dyn WorkQueue>,
        events: Arc<dyn EventSink>,
        shutdown: ShutdownListener,
    ) -> Self {
        Self {
            policy,
            queue,
            events,
            shutdown,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Requeue or drop `item`, then pause the caller for the backoff.
    ///
    /// The pause ends early on shutdown.
    #[instrument(skip(self, item), fields(id = %item.id))]
    pub async fn schedule(&self, item: QueueItem, status_code: Option<u16>) -> RetryDecision {
        let decision = self.policy.plan(item, status_code);

        match &decision {
            RetryDecision::Drop { item } => {
                self.events.emit(SyncEvent::Dropped {
                    id: item.id.clone(),
                    retries_count: item.retries_count.unwrap_or(0),
                    max_retries: self.policy.max_retries,
                });
            }
            RetryDecision::Requeue { item, pause } => {
                self.queue.push(item.clone());
                if self.shutdown.sleep(*pause).await {
                    debug!("Retry pause interrupted by shutdown");
                }
                self.events.emit(SyncEvent::RetryScheduled {
                    id: item.id.clone(),
                    timeout: item.timeout.unwrap_or(*pause),
                    retries_count: item.retries_count.unwrap_or(0),
                });
            }
        }

        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventSink;
    use crate::queue::InMemoryQueue;
    use crate::shutdown::shutdown_channel;
    use tokio::time::Instant;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(10), 3)
    }

    #[test]
    fn test_first_failure_doubles_default() {
        let decision = policy().plan(QueueItem::live("B", None), Some(500));
        let RetryDecision::Requeue { item, pause } = decision else {
            panic!("expected requeue");
        };
        assert_eq!(item.timeout, Some(Duration::from_secs(20)));
        assert_eq!(item.retries_count, Some(1));
        assert_eq!(pause, Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_keeps_doubling() {
        let item = QueueItem::live("B", None).with_retry_state(Some(Duration::from_secs(40)), Some(2));
        let RetryDecision::Requeue { item, pause } = policy().plan(item, None) else {
            panic!("expected requeue");
        };
        assert_eq!(item.timeout, Some(Duration::from_secs(80)));
        assert_eq!(item.retries_count, Some(3));
        assert_eq!(pause, Duration::from_secs(40));
    }

    #[test]
    fn test_rate_limit_leaves_item_untouched() {
        let item = QueueItem::live("B", None).with_retry_state(Some(Duration::from_secs(40)), Some(2));
        let RetryDecision::Requeue { item, pause } = policy().plan(item, Some(429)) else {
            panic!("expected requeue");
        };
        assert_eq!(item.timeout, Some(Duration::from_secs(40)));
        assert_eq!(item.retries_count, Some(2));
        assert_eq!(pause, Duration::from_secs(40));

        let RetryDecision::Requeue { item, .. } = policy().plan(QueueItem::live("C", None), Some(429))
        else {
            panic!("expected requeue");
        };
        assert_eq!(item.timeout, Some(Duration::from_secs(10)));
        assert_eq!(item.retries_count, Some(0));
    }

    #[test]
    fn test_drop_past_ceiling() {
        let item = QueueItem::live("B", None).with_retry_state(Some(Duration::from_secs(80)), Some(3));
        let decision = policy().plan(item, Some(500));
        assert!(matches!(
            decision,
            RetryDecision::Drop { ref item } if item.retries_count == Some(4)
        ));
    }

    #[test]
    fn test_every_item_past_ceiling_is_dropped() {
        let policy = policy();
        for retries in 0..10u32 {
            let item = QueueItem::live("X", None).with_retry_state(None, Some(retries));
            match policy.plan(item, None) {
                RetryDecision::Drop { item } => {
                    assert!(item.retries_count.unwrap() > policy.max_retries)
                }
                RetryDecision::Requeue { item, .. } => {
                    assert!(item.retries_count.unwrap() <= policy.max_retries)
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_requeues_and_pauses() {
        let queue = Arc::new(InMemoryQueue::<QueueItem>::new());
        let events = Arc::new(MemoryEventSink::new());
        let (_handle, listener) = shutdown_channel();
        let scheduler = RetryScheduler::new(policy(), queue.clone(), events.clone(), listener);
        let started = Instant::now();

        scheduler.schedule(QueueItem::live("B", None), Some(500)).await;

        assert_eq!(started.elapsed(), Duration::from_secs(10));
        let queued = queue.drain();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].timeout, Some(Duration::from_secs(20)));
        assert_eq!(events.count_message("add_to_retry"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_drop_never_queues() {
        let queue = Arc::new(InMemoryQueue::<QueueItem>::new());
        let events = Arc::new(MemoryEventSink::new());
        let scheduler =
            RetryScheduler::new(policy(), queue.clone(), events.clone(), ShutdownListener::never());
        let started = Instant::now();

        let item = QueueItem::live("B", None).with_retry_state(None, Some(3));
        let decision = scheduler.schedule(item, None).await;

        assert!(matches!(decision, RetryDecision::Drop { .. }));
        assert_eq!(queue.size(), 0);
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(events.count_message("dropped_documents"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cuts_pause_short() {
        let queue = Arc::new(InMemoryQueue::<QueueItem>::new());
        let (handle, listener) = shutdown_channel();
        let scheduler = RetryScheduler::new(
            policy(),
            queue.clone(),
            Arc::new(MemoryEventSink::new()),
            listener,
        );
        handle.shutdown();
        let started = Instant::now();

        scheduler.schedule(QueueItem::live("B", None), None).await;

        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(queue.size(), 1);
    }
}
