//! Bulk write buffer
//!
//! Each worker accumulates fetched documents in its own [`BulkBuffer`] and
//! commits them to the local store in one batch when the buffer grows past
//! `bulk_save_limit`, when `bulk_save_interval` has elapsed since the last
//! flush, or when the worker is shutting down.
//!
//! # Example
//!
//! ```
//! use edge_sync::bulk::BulkBuffer;
//! use edge_sync::events::NoopEventSink;
//! use edge_sync::{Document, QueueItem, SyncConfig};
//! use std::sync::Arc;
//!
//! let config = SyncConfig::default();
//! let mut buffer = BulkBuffer::new(&config, Arc::new(NoopEventSink));
//!
//! buffer.merge(QueueItem::live("A", None), Document::new("A"), None);
//! assert_eq!(buffer.len(), 1);
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::config::SyncConfig;
use crate::events::{EventSink, SyncEvent};
use crate::item::{Document, QueueItem, SyncMode};
use crate::retry::{RetryDecision, RetryScheduler};
use crate::store::LocalStore;

/// Why a buffer is due for a flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// More than `bulk_save_limit` documents buffered
    Count,
    /// `bulk_save_interval` elapsed since the last flush
    Time,
    /// Worker is shutting down
    Shutdown,
}

/// Result of [`BulkBuffer::merge`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// New buffer entry
    Inserted,
    /// Replaced an older buffered copy
    Replaced,
    /// Buffer already held an equal-or-newer copy
    Ignored,
}

/// Counters of one flush
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Documents submitted
    pub attempted: usize,
    pub saved: usize,
    pub updated: usize,
    /// Refused because a newer copy already landed
    pub superseded: usize,
    /// Refused for any other reason
    pub failed: usize,
    /// Handed back to the retry scheduler
    pub requeued: usize,
    /// Dropped by the retry scheduler
    pub dropped: usize,
    /// Whole-batch error, if the store refused the batch
    pub batch_error: Option<String>,
    pub duration: Duration,
}

impl FlushReport {
    pub fn committed(&self) -> usize {
        self.saved + self.updated
    }
}

#[derive(Debug, Clone)]
struct BufferEntry {
    /// Queue item that produced the document, carrying its retry lineage
    item: QueueItem,
    document: Document,
}

/// Per-worker buffer of documents pending a batched write.
///
/// Keys are store identities: `id` in live mode, `id-rev` in historical
/// mode. Not shared between workers.
pub struct BulkBuffer {
    mode: SyncMode,
    doc_type: String,
    limit: usize,
    interval: Duration,
    entries: BTreeMap<String, BufferEntry>,
    last_flush: Instant,
    events: Arc<dyn EventSink>,
}

impl BulkBuffer {
    pub fn new(config: &SyncConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            mode: config.mode(),
            doc_type: config.doc_type(),
            limit: config.bulk_save_limit,
            interval: config.bulk_save_interval,
            entries: BTreeMap::new(),
            last_flush: Instant::now(),
            events,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Buffered copy under store identity `key`
    pub fn get(&self, key: &str) -> Option<&Document> {
        self.entries.get(key).map(|entry| &entry.document)
    }

    /// Time since the last flush (or since creation)
    pub fn elapsed(&self) -> Duration {
        self.last_flush.elapsed()
    }

    /// Add a fetched document.
    ///
    /// The document is stamped with its `doc_type` and store identity, and
    /// with `stored_rev` so that writing it updates the existing record. In
    /// live mode an equal-or-newer buffered copy wins; in historical mode
    /// every revision gets its own entry.
    pub fn merge(
        &mut self,
        item: QueueItem,
        mut document: Document,
        stored_rev: Option<String>,
    ) -> MergeOutcome {
        let key = document.identity(self.mode);
        document.doc_type = Some(self.doc_type.clone());
        document.store_id = Some(key.clone());
        document.store_rev = stored_rev;

        let outcome = match (self.mode, self.entries.get(&key)) {
            (SyncMode::Live, Some(buffered))
                if buffered.document.date_modified >= document.date_modified =>
            {
                self.events.emit(SyncEvent::DuplicateIgnored {
                    id: key,
                    buffered: buffered.document.date_modified,
                    incoming: document.date_modified,
                });
                return MergeOutcome::Ignored;
            }
            (SyncMode::Live, Some(buffered)) => {
                self.events.emit(SyncEvent::BufferReplaced {
                    id: key.clone(),
                    previous: buffered.document.date_modified,
                    current: document.date_modified,
                });
                MergeOutcome::Replaced
            }
            _ => MergeOutcome::Inserted,
        };

        self.events.emit(SyncEvent::Buffered {
            id: document.id.clone(),
            version: match self.mode {
                SyncMode::Historical => document.rev.clone().unwrap_or_default(),
                SyncMode::Live => document
                    .date_modified
                    .map(|dm| dm.to_rfc3339())
                    .unwrap_or_default(),
            },
        });
        self.entries.insert(key, BufferEntry { item, document });
        outcome
    }

    /// Reason the buffer is due, if it is
    pub fn flush_reason(&self, shutting_down: bool) -> Option<FlushReason> {
        if shutting_down {
            Some(FlushReason::Shutdown)
        } else if self.entries.len() > self.limit {
            Some(FlushReason::Count)
        } else if self.last_flush.elapsed() >= self.interval {
            Some(FlushReason::Time)
        } else {
            None
        }
    }

    pub fn should_flush(&self, shutting_down: bool) -> bool {
        self.flush_reason(shutting_down).is_some()
    }

    /// Write every buffered document in one batch.
    ///
    /// The buffer is empty and the interval clock restarted afterwards,
    /// whatever the store answered.
    ///
    /// In live mode a timeshift event is emitted only for documents whose
    /// write succeeded; failed and superseded writes report none.
    #[instrument(skip_all, fields(count = self.entries.len(), mode = %self.mode))]
    pub async fn flush(&mut self, store: &dyn LocalStore, retry: &RetryScheduler) -> FlushReport {
        let mut entries = std::mem::take(&mut self.entries);
        self.last_flush = Instant::now();

        let mut report = FlushReport {
            attempted: entries.len(),
            ..FlushReport::default()
        };
        if entries.is_empty() {
            return report;
        }

        let docs: Vec<Document> = entries.values().map(|e| e.document.clone()).collect();
        let started = Instant::now();
        let result = store.bulk_update(docs).await;
        report.duration = started.elapsed();

        let results = match result {
            Ok(results) => results,
            Err(e) => {
                self.events.emit(SyncEvent::BulkFailed {
                    count: entries.len(),
                    error: e.to_string(),
                });
                report.batch_error = Some(e.to_string());
                for entry in entries.into_values() {
                    let item = self.retry_item(&entry);
                    self.requeue(item, retry, &mut report).await;
                }
                return report;
            }
        };

        self.events.emit(SyncEvent::BulkSaved {
            count: report.attempted,
            duration: report.duration,
        });

        let now = Utc::now();
        for result in results {
            let entry = entries.remove(&result.id);
            let created = result.is_created();
            match result.result {
                Ok(_) if created => {
                    report.saved += 1;
                    self.events.emit(SyncEvent::Saved {
                        id: result.id.clone(),
                    });
                }
                Ok(_) => {
                    report.updated += 1;
                    self.events.emit(SyncEvent::Updated {
                        id: result.id.clone(),
                    });
                }
                Err(e) if e.is_superseded() => {
                    report.superseded += 1;
                    self.events.emit(SyncEvent::WriteSuperseded {
                        id: result.id,
                        reason: e.to_string(),
                    });
                    continue;
                }
                Err(e) => {
                    report.failed += 1;
                    self.events.emit(SyncEvent::WriteFailed {
                        id: result.id.clone(),
                        reason: e.to_string(),
                    });
                    if let (SyncMode::Live, Some(entry)) = (self.mode, entry) {
                        let item = QueueItem::live(entry.document.id.clone(), None)
                            .with_retry_state(entry.item.timeout, entry.item.retries_count);
                        self.requeue(item, retry, &mut report).await;
                    }
                    continue;
                }
            }

            if let (SyncMode::Live, Some(entry)) = (self.mode, entry) {
                if let Some(dm) = entry.document.date_modified {
                    let lag = now.signed_duration_since(dm);
                    self.events.emit(SyncEvent::Timeshift {
                        id: result.id,
                        seconds: lag.num_milliseconds() as f64 / 1000.0,
                    });
                }
            }
        }

        debug!(
            saved = report.saved,
            updated = report.updated,
            failed = report.failed,
            "Bulk flushed"
        );
        report
    }

    /// Retry item for a document whose whole batch failed
    fn retry_item(&self, entry: &BufferEntry) -> QueueItem {
        let base = match self.mode {
            SyncMode::Live => {
                QueueItem::live(entry.document.id.clone(), entry.document.date_modified)
            }
            SyncMode::Historical => QueueItem {
                rev: entry.document.rev.clone().or_else(|| entry.item.rev.clone()),
                ..QueueItem::live(entry.document.id.clone(), None)
            },
        };
        base.with_retry_state(entry.item.timeout, entry.item.retries_count)
    }

    async fn requeue(&self, item: QueueItem, retry: &RetryScheduler, report: &mut FlushReport) {
        match retry.schedule(item, None).await {
            RetryDecision::Requeue { .. } => report.requeued += 1,
            RetryDecision::Drop { .. } => report.dropped += 1,
        }
    }
}

impl std::fmt::Debug for BulkBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkBuffer")
            .field("mode", &self.mode)
            .field("len", &self.entries.len())
            .field("limit", &self.limit)
            .field("interval", &self.interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventSink;
    use crate::queue::{InMemoryQueue, WorkQueue};
    use crate::retry::RetryPolicy;
    use crate::shutdown::ShutdownListener;
    use crate::store::{InMemoryLocalStore, StoreError, WriteError};
    use chrono::DateTime;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn doc(id: &str, dm: &str) -> Document {
        Document::new(id).with_date_modified(ts(dm))
    }

    fn live_config() -> SyncConfig {
        SyncConfig::default()
            .with_bulk_save_limit(2)
            .with_bulk_save_interval(Duration::from_secs(5))
    }

    fn retry_for(config: &SyncConfig) -> (Arc<InMemoryQueue<QueueItem>>, RetryScheduler) {
        let queue = Arc::new(InMemoryQueue::<QueueItem>::new());
        let retry = RetryScheduler::new(
            RetryPolicy::from(config),
            queue.clone(),
            Arc::new(MemoryEventSink::new()),
            ShutdownListener::never(),
        );
        (queue, retry)
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_merge_is_order_independent() {
        let config = live_config();
        let older = doc("A", "2020-01-01T00:00:00Z");
        let newer = doc("A", "2020-01-02T00:00:00Z");

        for order in [[older.clone(), newer.clone()], [newer.clone(), older.clone()]] {
            let mut buffer = BulkBuffer::new(&config, Arc::new(MemoryEventSink::new()));
            for d in order {
                buffer.merge(QueueItem::live("A", None), d, None);
            }
            assert_eq!(buffer.len(), 1);
            assert_eq!(
                buffer.get("A").unwrap().date_modified,
                Some(ts("2020-01-02T00:00:00Z"))
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_equal_date_is_a_duplicate() {
        let events = Arc::new(MemoryEventSink::new());
        let mut buffer = BulkBuffer::new(&live_config(), events.clone());
        let d = doc("A", "2020-01-01T00:00:00Z");

        assert_eq!(
            buffer.merge(QueueItem::live("A", None), d.clone(), None),
            MergeOutcome::Inserted
        );
        assert_eq!(
            buffer.merge(QueueItem::live("A", None), d, None),
            MergeOutcome::Ignored
        );
        assert_eq!(
            events.count(|e| matches!(e, SyncEvent::DuplicateIgnored { .. })),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_merge_stamps_store_fields() {
        let mut buffer = BulkBuffer::new(&live_config(), Arc::new(MemoryEventSink::new()));
        buffer.merge(
            QueueItem::live("A", None),
            doc("A", "2020-01-01T00:00:00Z"),
            Some("3-abc".into()),
        );

        let stamped = buffer.get("A").unwrap();
        assert_eq!(stamped.doc_type.as_deref(), Some("Tender"));
        assert_eq!(stamped.store_id.as_deref(), Some("A"));
        assert_eq!(stamped.store_rev.as_deref(), Some("3-abc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_historical_keeps_every_revision() {
        let config = live_config().with_historical(true);
        let mut buffer = BulkBuffer::new(&config, Arc::new(MemoryEventSink::new()));

        for rev in ["1", "2", "3"] {
            let outcome = buffer.merge(
                QueueItem::historical("A", rev),
                Document::new("A").with_rev(rev),
                None,
            );
            assert_eq!(outcome, MergeOutcome::Inserted);
        }

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.get("A-2").unwrap().store_id.as_deref(), Some("A-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_flush_triggers() {
        let mut buffer = BulkBuffer::new(&live_config(), Arc::new(MemoryEventSink::new()));
        assert!(!buffer.should_flush(false));
        assert_eq!(buffer.flush_reason(true), Some(FlushReason::Shutdown));

        for id in ["A", "B"] {
            buffer.merge(QueueItem::live(id, None), Document::new(id), None);
        }
        // At the limit is not over it
        assert!(!buffer.should_flush(false));

        buffer.merge(QueueItem::live("C", None), Document::new("C"), None);
        assert_eq!(buffer.flush_reason(false), Some(FlushReason::Count));

        let fresh = BulkBuffer::new(&live_config(), Arc::new(MemoryEventSink::new()));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(fresh.flush_reason(false), Some(FlushReason::Time));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_saves_and_resets() {
        let config = live_config();
        let events = Arc::new(MemoryEventSink::new());
        let store = InMemoryLocalStore::new();
        let (_, retry) = retry_for(&config);
        let mut buffer = BulkBuffer::new(&config, events.clone());

        tokio::time::advance(Duration::from_secs(6)).await;
        buffer.merge(
            QueueItem::live("A", None),
            doc("A", "2020-01-02T00:00:00Z"),
            None,
        );
        assert!(buffer.should_flush(false));

        let report = buffer.flush(&store, &retry).await;

        assert_eq!(report.saved, 1);
        assert!(buffer.is_empty());
        assert!(!buffer.should_flush(false));
        assert_eq!(events.count_message("save_documents"), 1);
        assert_eq!(events.count_message("document_timeshift"), 1);
        assert_eq!(
            store.document("A").unwrap().doc_type.as_deref(),
            Some("Tender")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_of_existing_document() {
        let config = live_config();
        let store = InMemoryLocalStore::new();
        let rev = store.insert(doc("A", "2020-01-01T00:00:00Z"));
        let (_, retry) = retry_for(&config);
        let mut buffer = BulkBuffer::new(&config, Arc::new(MemoryEventSink::new()));

        buffer.merge(
            QueueItem::live("A", None),
            doc("A", "2020-01-02T00:00:00Z"),
            Some(rev),
        );
        let report = buffer.flush(&store, &retry).await;

        assert_eq!(report.updated, 1);
        assert_eq!(report.saved, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_failure_requeues_every_document() {
        let config = live_config().with_bulk_save_limit(10);
        let store = InMemoryLocalStore::new();
        store.fail_next_bulk(StoreError::Unavailable("connection reset".into()));
        let (queue, retry) = retry_for(&config);
        let mut buffer = BulkBuffer::new(&config, Arc::new(MemoryEventSink::new()));

        for id in ["A", "B", "C"] {
            buffer.merge(
                QueueItem::live(id, None),
                doc(id, "2020-01-01T00:00:00Z"),
                None,
            );
        }
        let report = buffer.flush(&store, &retry).await;

        assert_eq!(report.requeued, 3);
        assert!(report.batch_error.is_some());
        assert!(buffer.is_empty());
        let mut ids: Vec<String> = queue.drain().into_iter().map(|i| i.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["A", "B", "C"]);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_historical_batch_failure_requeues_each_revision() {
        let config = live_config()
            .with_historical(true)
            .with_bulk_save_limit(10)
            .with_retry_default_timeout(Duration::from_secs(1));
        let store = InMemoryLocalStore::new();
        store.fail_next_bulk(StoreError::Unavailable("connection reset".into()));
        let (queue, retry) = retry_for(&config);
        let mut buffer = BulkBuffer::new(&config, Arc::new(MemoryEventSink::new()));

        for rev in ["1", "2", "3"] {
            buffer.merge(
                QueueItem::historical("A", rev),
                Document::new("A").with_rev(rev),
                None,
            );
        }
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(buffer.flush_reason(false), Some(FlushReason::Time));

        let report = buffer.flush(&store, &retry).await;

        assert_eq!(report.requeued, 3);
        assert!(buffer.is_empty());
        // Three 1s retry pauses stay inside the 5s interval
        assert!(!buffer.should_flush(false));

        let mut queued: Vec<(String, Option<String>)> = queue
            .drain()
            .into_iter()
            .map(|item| (item.id, item.rev))
            .collect();
        queued.sort();
        assert_eq!(
            queued,
            vec![
                ("A".to_string(), Some("1".to_string())),
                ("A".to_string(), Some("2".to_string())),
                ("A".to_string(), Some("3".to_string())),
            ]
        );
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_document_failures() {
        let config = live_config().with_bulk_save_limit(10);
        let store = InMemoryLocalStore::new();
        let (queue, retry) = retry_for(&config);
        let mut buffer = BulkBuffer::new(&config, Arc::new(MemoryEventSink::new()));

        store.reject_next_write("A", WriteError::OlderThanStored);
        store.reject_next_write("B", WriteError::RevisionConflict);
        for id in ["A", "B", "C"] {
            buffer.merge(
                QueueItem::live(id, Some(ts("2020-01-01T00:00:00Z"))),
                doc(id, "2020-01-01T00:00:00Z"),
                None,
            );
        }
        let report = buffer.flush(&store, &retry).await;

        assert_eq!(report.superseded, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.saved, 1);
        let queued = queue.drain();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, "B");
        assert_eq!(queued[0].date_modified, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_historical_write_failure_is_not_retried() {
        let config = live_config().with_historical(true);
        let store = InMemoryLocalStore::new();
        let (queue, retry) = retry_for(&config);
        let mut buffer = BulkBuffer::new(&config, Arc::new(MemoryEventSink::new()));

        store.reject_next_write("A-1", WriteError::Rejected("forbidden".into()));
        buffer.merge(
            QueueItem::historical("A", "1"),
            Document::new("A").with_rev("1"),
            None,
        );
        let report = buffer.flush(&store, &retry).await;

        assert_eq!(report.failed, 1);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_flush_skips_store() {
        let config = live_config();
        let store = InMemoryLocalStore::new();
        let (_, retry) = retry_for(&config);
        let mut buffer = BulkBuffer::new(&config, Arc::new(MemoryEventSink::new()));

        let report = buffer.flush(&store, &retry).await;

        assert_eq!(report, FlushReport::default());
        assert_eq!(store.bulk_calls(), 0);
    }
}
