//! Reconciliation and fetch pipeline
//!
//! Given a leased client and a queue item, decide whether the item needs a
//! remote fetch, perform it, and turn the result into a [`Processed`] value
//! the worker loop branches on. Every failure is absorbed here: it either
//! goes through the retry scheduler or is logged and dropped.
//!
//! The pipeline owns the leased handle for the duration of a call and always
//! hands it back to the pool before returning.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, instrument, trace};

use crate::client::{
    ApiError, CallOutcome, ClientHandle, ClientPool, ThrottleAdjustment, ThrottleSteps,
    TOO_MANY_REQUESTS,
};
use crate::config::SyncConfig;
use crate::events::{CookieClearReason, EventSink, SyncEvent};
use crate::item::{Document, QueueItem, SyncMode};
use crate::retry::{RetryDecision, RetryScheduler};
use crate::store::LocalStore;

// ============================================================================
// Outcome classification
// ============================================================================

/// Classified result of one remote call
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// Document at least as fresh as the queue hint
    Fresh(Document),

    /// Remote copy is behind the queue hint (replica lag)
    NotActual { returned: DateTime<Utc> },

    /// Resource was archived
    Archived,

    /// Remote answered with something that is not a document
    Invalid { status_code: u16 },

    /// HTTP 429
    RateLimited,

    /// Any other HTTP failure
    RequestFailed { status_code: u16 },

    NotFound { message: String },

    Failed { message: String },
}

impl FetchOutcome {
    /// Classify a call result against the queue hint.
    ///
    /// Only live mode compares freshness; a historical revision is always
    /// what was asked for.
    pub fn classify(
        result: Result<Document, ApiError>,
        hint: Option<DateTime<Utc>>,
        mode: SyncMode,
    ) -> Self {
        match result {
            Ok(doc) => match (mode, hint, doc.date_modified) {
                (SyncMode::Live, Some(hint), Some(returned)) if returned < hint => {
                    Self::NotActual { returned }
                }
                _ => Self::Fresh(doc),
            },
            Err(ApiError::Gone) => Self::Archived,
            Err(ApiError::InvalidResponse { status_code }) => Self::Invalid { status_code },
            Err(ApiError::RequestFailed {
                status_code: TOO_MANY_REQUESTS,
            }) => Self::RateLimited,
            Err(ApiError::RequestFailed { status_code }) => Self::RequestFailed { status_code },
            Err(ApiError::NotFound(message)) => Self::NotFound { message },
            Err(ApiError::Other(message)) => Self::Failed { message },
        }
    }

    /// How the call counts for client throttling
    pub fn call_outcome(&self) -> CallOutcome {
        match self {
            Self::Fresh(_) | Self::NotActual { .. } => CallOutcome::Success,
            Self::RateLimited => CallOutcome::RateLimited,
            _ => CallOutcome::Failure,
        }
    }

    /// Status code handed to the retry scheduler
    fn retry_status(&self) -> Option<u16> {
        match self {
            Self::RateLimited => Some(TOO_MANY_REQUESTS),
            Self::RequestFailed { status_code } => Some(*status_code),
            _ => None,
        }
    }
}

/// What became of a queue item
#[derive(Debug, Clone, PartialEq)]
pub enum Processed {
    /// Fetched document, ready for the bulk buffer.
    ///
    /// `stored_rev` is the local store revision when the document already
    /// exists locally.
    Ready {
        item: QueueItem,
        document: Document,
        stored_rev: Option<String>,
    },

    /// Local copy already as fresh as the hint
    Skipped,

    /// Resource archived, nothing to do
    Archived,

    /// Handed to the retry scheduler
    Retried,

    /// Exceeded the retry ceiling
    Dropped,
}

impl From<RetryDecision> for Processed {
    fn from(decision: RetryDecision) -> Self {
        match decision {
            RetryDecision::Requeue { .. } => Self::Retried,
            RetryDecision::Drop { .. } => Self::Dropped,
        }
    }
}

// ============================================================================
// FetchPipeline
// ============================================================================

/// Per-worker reconcile and fetch logic
pub struct FetchPipeline {
    mode: SyncMode,
    queue_timeout: Duration,
    steps: ThrottleSteps,
    pool: Arc<ClientPool>,
    store: Arc<dyn LocalStore>,
    events: Arc<dyn EventSink>,
}

impl FetchPipeline {
    pub fn new(
        config: &SyncConfig,
        pool: Arc<ClientPool>,
        store: Arc<dyn LocalStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            mode: config.mode(),
            queue_timeout: config.queue_timeout,
            steps: ThrottleSteps::from(config),
            pool,
            store,
            events,
        }
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Run one item through reconciliation and fetch.
    ///
    /// Consumes the leased handle; it is back in the pool when this returns.
    #[instrument(skip_all, fields(id = %item.id, client_id = handle.id()))]
    pub async fn process(
        &self,
        handle: ClientHandle,
        item: QueueItem,
        retry: &RetryScheduler,
    ) -> Processed {
        match self.mode {
            SyncMode::Live => self.reconcile(handle, item, retry).await,
            SyncMode::Historical => {
                let outcome = self.fetch_remote(handle, &item).await;
                self.settle(item, outcome, None, retry).await
            }
        }
    }

    /// Live mode: compare against the local copy before fetching
    async fn reconcile(
        &self,
        mut handle: ClientHandle,
        mut item: QueueItem,
        retry: &RetryScheduler,
    ) -> Processed {
        let local = match self.store.get(&item.id).await {
            Ok(local) => local,
            Err(e) => {
                self.pool.release(handle);
                self.events.emit(SyncEvent::LocalReadFailed {
                    id: item.id.clone(),
                    error: e.to_string(),
                });
                return retry.schedule(item.for_retry(self.mode), None).await.into();
            }
        };

        if item.date_modified.is_none() {
            // Learn the remote dateModified first; the handle goes back to
            // the pool with the call, so a new one is needed afterwards.
            match self.fetch_remote(handle, &item).await {
                FetchOutcome::Fresh(doc) => item.date_modified = doc.date_modified,
                outcome => return self.settle(item, outcome, None, retry).await,
            }
            handle = match self.pool.lease(self.queue_timeout).await {
                Some(handle) => handle,
                None => {
                    debug!("No api client to continue with, retrying");
                    return retry.schedule(item.for_retry(self.mode), None).await.into();
                }
            };
        }

        if let (Some(local_dm), Some(hint)) = (
            local.as_ref().and_then(|doc| doc.date_modified),
            item.date_modified,
        ) {
            if local_dm >= hint {
                self.pool.release(handle);
                self.events.emit(SyncEvent::Skipped {
                    id: item.id.clone(),
                    queue_hint: hint,
                    local: local_dm,
                });
                return Processed::Skipped;
            }
        }

        let stored_rev = local.and_then(|doc| doc.store_rev);
        let outcome = self.fetch_remote(handle, &item).await;
        self.settle(item, outcome, stored_rev, retry).await
    }

    /// Paced remote call. Reports the outcome to the handle and releases it.
    async fn fetch_remote(&self, mut handle: ClientHandle, item: &QueueItem) -> FetchOutcome {
        let interval = handle.request_interval();
        if !interval.is_zero() {
            trace!(client_id = handle.id(), ?interval, "Pacing request");
            tokio::time::sleep(interval).await;
        }

        let started = Instant::now();
        let result = match (self.mode, item.rev.as_deref()) {
            (SyncMode::Historical, Some(rev)) => {
                handle
                    .client()
                    .get_resource_item_historical(&item.id, rev)
                    .await
            }
            (SyncMode::Historical, None) => {
                Err(ApiError::Other(format!("{} has no revision to fetch", item.id)))
            }
            (SyncMode::Live, _) => handle.client().get_resource_item(&item.id).await,
        };
        let elapsed = started.elapsed();

        let mut outcome = FetchOutcome::classify(result, item.date_modified, self.mode);
        if let (SyncMode::Historical, FetchOutcome::Fresh(doc)) = (self.mode, &mut outcome) {
            doc.rev = item.rev.clone();
        }

        if handle.record_call(outcome.call_outcome(), elapsed, &self.steps)
            == ThrottleAdjustment::CookiesCleared
        {
            self.events.emit(SyncEvent::ClientCookiesCleared {
                client_id: handle.id(),
                reason: CookieClearReason::RateLimited,
            });
        }

        match &outcome {
            FetchOutcome::NotActual { .. } => {
                handle.note_not_actual();
                self.events.emit(SyncEvent::NotActual {
                    id: item.id.clone(),
                    client_id: handle.id(),
                });
            }
            FetchOutcome::NotFound { .. } => {
                handle.clear_cookies();
                self.events.emit(SyncEvent::ClientCookiesCleared {
                    client_id: handle.id(),
                    reason: CookieClearReason::NotFound,
                });
            }
            _ => {}
        }

        debug!(
            id = %item.id,
            client_id = handle.id(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Remote call finished"
        );
        self.pool.release(handle);
        outcome
    }

    /// Route a classified outcome
    async fn settle(
        &self,
        item: QueueItem,
        outcome: FetchOutcome,
        stored_rev: Option<String>,
        retry: &RetryScheduler,
    ) -> Processed {
        let status_code = outcome.retry_status();
        match outcome {
            FetchOutcome::Fresh(document) => {
                return Processed::Ready {
                    item,
                    document,
                    stored_rev,
                };
            }
            FetchOutcome::NotActual { .. } => {
                // Stale hint is lag, not failure: fresh retry lineage
                let requeue = QueueItem::live(item.id.clone(), item.date_modified);
                return retry.schedule(requeue, None).await.into();
            }
            FetchOutcome::Archived => {
                self.events.emit(SyncEvent::Archived { id: item.id });
                return Processed::Archived;
            }
            FetchOutcome::NotFound { message } => {
                self.events.emit(SyncEvent::ResourceNotFound {
                    id: item.id.clone(),
                    version: item.version_label(),
                    error: message,
                });
            }
            FetchOutcome::Invalid { status_code } => {
                self.events.emit(SyncEvent::FetchFailed {
                    id: item.id.clone(),
                    version: item.version_label(),
                    status_code: Some(status_code),
                    error: "invalid response".to_string(),
                });
            }
            FetchOutcome::RateLimited => {
                self.events.emit(SyncEvent::FetchFailed {
                    id: item.id.clone(),
                    version: item.version_label(),
                    status_code: Some(TOO_MANY_REQUESTS),
                    error: "rate limited".to_string(),
                });
            }
            FetchOutcome::RequestFailed { status_code } => {
                self.events.emit(SyncEvent::FetchFailed {
                    id: item.id.clone(),
                    version: item.version_label(),
                    status_code: Some(status_code),
                    error: "request failed".to_string(),
                });
            }
            FetchOutcome::Failed { message } => {
                self.events.emit(SyncEvent::FetchFailed {
                    id: item.id.clone(),
                    version: item.version_label(),
                    status_code: None,
                    error: message,
                });
            }
        }

        retry
            .schedule(item.for_retry(self.mode), status_code)
            .await
            .into()
    }
}
