//! Single sync worker loop

use std::time::Duration;

use tracing::{debug, info, instrument};

use super::WorkerResources;
use crate::bulk::{BulkBuffer, FlushReport, MergeOutcome};
use crate::config::SyncConfig;
use crate::pipeline::{FetchPipeline, Processed};
use crate::retry::{RetryPolicy, RetryScheduler};
use crate::shutdown::ShutdownListener;

/// Worker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Looping over the work queue
    Running,
    /// Shutdown requested, committing what is buffered
    ShuttingDown,
    /// Loop has exited
    Stopped,
}

/// What one loop iteration did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// No client could be leased; the worker slept
    NoClient,
    /// Work queue was empty; the worker slept
    NoItem,
    /// A document was fetched and merged into the buffer
    Buffered(MergeOutcome),
    Skipped,
    Archived,
    Retried,
    Dropped,
}

/// Counters accumulated over a worker's lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub worker_id: usize,
    pub iterations: u64,
    /// Documents fetched and handed to the buffer
    pub fetched: u64,
    pub skipped: u64,
    pub archived: u64,
    /// Items handed to the retry scheduler (fetch and write failures)
    pub retried: u64,
    /// Items dropped past the retry ceiling
    pub dropped: u64,
    pub saved: u64,
    pub updated: u64,
    pub flushes: u64,
}

impl WorkerReport {
    /// Add the counters of `other` to this report
    pub fn absorb(&mut self, other: &WorkerReport) {
        self.iterations += other.iterations;
        self.fetched += other.fetched;
        self.skipped += other.skipped;
        self.archived += other.archived;
        self.retried += other.retried;
        self.dropped += other.dropped;
        self.saved += other.saved;
        self.updated += other.updated;
        self.flushes += other.flushes;
    }

    fn record_flush(&mut self, flush: &FlushReport) {
        self.flushes += 1;
        self.saved += flush.saved as u64;
        self.updated += flush.updated as u64;
        self.retried += flush.requeued as u64;
        self.dropped += flush.dropped as u64;
    }
}

/// One sync worker.
///
/// # Example
///
/// ```ignore
/// let (handle, listener) = shutdown_channel();
/// let worker = SyncWorker::new(0, config, resources, listener);
/// let task = tokio::spawn(worker.run());
///
/// // ... later
/// handle.shutdown();
/// let report = task.await?;
/// ```
pub struct SyncWorker {
    id: usize,
    queue_timeout: Duration,
    worker_sleep: Duration,
    resources: WorkerResources,
    pipeline: FetchPipeline,
    retry: RetryScheduler,
    buffer: BulkBuffer,
    shutdown: ShutdownListener,
    state: WorkerState,
    report: WorkerReport,
}

impl SyncWorker {
    pub fn new(
        id: usize,
        config: &SyncConfig,
        resources: WorkerResources,
        shutdown: ShutdownListener,
    ) -> Self {
        let pipeline = FetchPipeline::new(
            config,
            resources.pool.clone(),
            resources.store.clone(),
            resources.events.clone(),
        );
        let retry = RetryScheduler::new(
            RetryPolicy::from(config),
            resources.retry_queue.clone(),
            resources.events.clone(),
            shutdown.clone(),
        );
        let buffer = BulkBuffer::new(config, resources.events.clone());

        Self {
            id,
            queue_timeout: config.queue_timeout,
            worker_sleep: config.worker_sleep,
            resources,
            pipeline,
            retry,
            buffer,
            shutdown,
            state: WorkerState::Running,
            report: WorkerReport {
                worker_id: id,
                ..WorkerReport::default()
            },
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn report(&self) -> &WorkerReport {
        &self.report
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Loop until shutdown, then commit the buffer and stop.
    #[instrument(skip(self), fields(worker_id = self.id, mode = %self.pipeline.mode()))]
    pub async fn run(mut self) -> WorkerReport {
        info!("Starting sync worker");

        while !self.shutdown.is_shutdown() {
            self.run_once().await;
        }

        self.drain().await;
        info!(
            fetched = self.report.fetched,
            saved = self.report.saved,
            updated = self.report.updated,
            retried = self.report.retried,
            "Sync worker stopped"
        );
        self.report
    }

    /// One loop iteration
    pub async fn run_once(&mut self) -> Step {
        self.report.iterations += 1;

        let Some(handle) = self.resources.pool.lease(self.queue_timeout).await else {
            debug!(worker_id = self.id, "API clients queue is empty");
            self.shutdown.sleep(self.worker_sleep).await;
            return Step::NoClient;
        };

        let Some(item) = self.resources.queue.pop(self.queue_timeout).await else {
            self.resources.pool.release(handle);
            debug!(worker_id = self.id, "Resource items queue is empty");
            self.shutdown.sleep(self.worker_sleep).await;
            return Step::NoItem;
        };

        let step = match self.pipeline.process(handle, item, &self.retry).await {
            Processed::Ready {
                item,
                document,
                stored_rev,
            } => {
                self.report.fetched += 1;
                Step::Buffered(self.buffer.merge(item, document, stored_rev))
            }
            Processed::Skipped => {
                self.report.skipped += 1;
                return Step::Skipped;
            }
            Processed::Archived => {
                self.report.archived += 1;
                return Step::Archived;
            }
            Processed::Retried => {
                self.report.retried += 1;
                return Step::Retried;
            }
            Processed::Dropped => {
                self.report.dropped += 1;
                return Step::Dropped;
            }
        };

        if let Some(reason) = self.buffer.flush_reason(self.shutdown.is_shutdown()) {
            debug!(worker_id = self.id, ?reason, "Flushing bulk");
            self.flush().await;
        }
        step
    }

    /// Commit whatever is still buffered before stopping
    async fn drain(&mut self) {
        self.state = WorkerState::ShuttingDown;
        if !self.buffer.is_empty() {
            info!(
                worker_id = self.id,
                buffered = self.buffer.len(),
                "Flushing bulk before exit"
            );
            self.flush().await;
        }
        self.state = WorkerState::Stopped;
    }

    async fn flush(&mut self) {
        let flush = self
            .buffer
            .flush(self.resources.store.as_ref(), &self.retry)
            .await;
        self.report.record_flush(&flush);
    }
}

impl std::fmt::Debug for SyncWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncWorker")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("buffer", &self.buffer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, Utc};

    use super::*;
    use crate::client::{ApiError, ClientPool, ResourceApi, ScriptedApi};
    use crate::events::MemoryEventSink;
    use crate::item::{Document, QueueItem};
    use crate::queue::{InMemoryQueue, WorkQueue};
    use crate::shutdown::shutdown_channel;
    use crate::store::InMemoryLocalStore;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    struct Fixture {
        api: Arc<ScriptedApi>,
        queue: Arc<InMemoryQueue<QueueItem>>,
        retry_queue: Arc<InMemoryQueue<QueueItem>>,
        store: Arc<InMemoryLocalStore>,
        resources: WorkerResources,
    }

    fn fixture() -> Fixture {
        let api = Arc::new(ScriptedApi::new("client-0"));
        let events = Arc::new(MemoryEventSink::new());
        let queue = Arc::new(InMemoryQueue::<QueueItem>::new());
        let retry_queue = Arc::new(InMemoryQueue::<QueueItem>::new());
        let store = Arc::new(InMemoryLocalStore::new());
        let resources = WorkerResources {
            pool: Arc::new(ClientPool::new(
                vec![api.clone() as Arc<dyn ResourceApi>],
                events.clone(),
            )),
            queue: queue.clone(),
            retry_queue: retry_queue.clone(),
            store: store.clone(),
            events,
        };
        Fixture {
            api,
            queue,
            retry_queue,
            store,
            resources,
        }
    }

    fn config() -> SyncConfig {
        SyncConfig::default()
            .with_bulk_save_limit(10)
            .with_bulk_save_interval(Duration::from_secs(60))
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_queue_sleeps_and_returns_client() {
        let f = fixture();
        let (_handle, listener) = shutdown_channel();
        let mut worker = SyncWorker::new(0, &config(), f.resources.clone(), listener);
        let started = tokio::time::Instant::now();

        assert_eq!(worker.run_once().await, Step::NoItem);

        assert_eq!(started.elapsed(), config().worker_sleep);
        assert_eq!(f.resources.pool.available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_client_sleeps() {
        let f = fixture();
        let (_handle, listener) = shutdown_channel();
        let mut worker = SyncWorker::new(0, &config(), f.resources.clone(), listener);
        let held = f.resources.pool.lease(Duration::from_secs(1)).await.unwrap();

        assert_eq!(worker.run_once().await, Step::NoClient);
        f.resources.pool.release(held);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_buffers_until_limit() {
        let f = fixture();
        f.api.respond(
            "A",
            Ok(Document::new("A").with_date_modified(ts("2020-01-02T00:00:00Z"))),
        );
        f.queue
            .push(QueueItem::live("A", Some(ts("2020-01-01T00:00:00Z"))));
        let (_handle, listener) = shutdown_channel();
        let mut worker = SyncWorker::new(0, &config(), f.resources.clone(), listener);

        assert_eq!(
            worker.run_once().await,
            Step::Buffered(MergeOutcome::Inserted)
        );
        assert_eq!(worker.buffered(), 1);
        assert!(f.store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_buffer() {
        let f = fixture();
        f.api.respond(
            "A",
            Ok(Document::new("A").with_date_modified(ts("2020-01-02T00:00:00Z"))),
        );
        f.queue
            .push(QueueItem::live("A", Some(ts("2020-01-01T00:00:00Z"))));
        let (handle, listener) = shutdown_channel();
        let mut worker = SyncWorker::new(0, &config(), f.resources.clone(), listener);
        worker.run_once().await;
        assert_eq!(worker.state(), WorkerState::Running);

        handle.shutdown();
        let report = worker.run().await;

        assert_eq!(report.fetched, 1);
        assert_eq!(report.saved, 1);
        assert_eq!(report.flushes, 1);
        assert!(f.store.document("A").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_counts_as_retry() {
        let f = fixture();
        f.api
            .respond("B", Err(ApiError::RequestFailed { status_code: 500 }));
        f.queue.push(QueueItem::live("B", None));
        let (_handle, listener) = shutdown_channel();
        let mut worker = SyncWorker::new(0, &config(), f.resources.clone(), listener);

        assert_eq!(worker.run_once().await, Step::Retried);
        assert_eq!(worker.report().retried, 1);
        assert_eq!(f.retry_queue.len(), 1);
    }
}
