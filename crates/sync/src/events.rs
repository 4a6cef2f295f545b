// Sync Events
//
// Structured outcome events emitted by workers. Workers receive an
// `Arc<dyn EventSink>` at construction so the core never depends on a
// global logger; `TracingEventSink` is the production sink.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::Level;

// ============================================================================
// Events
// ============================================================================

/// Why a client's session cookies were cleared
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieClearReason {
    /// Request interval grew past the drop threshold under 429s
    RateLimited,
    /// The API answered "not found" for a resource we were told exists
    NotFound,
}

/// Outcome events, one per decision the worker takes
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    ClientLeased {
        client_id: usize,
        request_interval: Duration,
    },
    ClientReleased {
        client_id: usize,
        request_interval: Duration,
    },
    ClientCookiesRenewed {
        client_id: usize,
    },
    ClientRenewalFailed {
        client_id: usize,
        error: String,
    },
    ClientCookiesCleared {
        client_id: usize,
        reason: CookieClearReason,
    },
    /// Local copy is at least as fresh as the queue hint
    Skipped {
        id: String,
        queue_hint: DateTime<Utc>,
        local: DateTime<Utc>,
    },
    /// Buffer already holds an equal-or-newer copy
    DuplicateIgnored {
        id: String,
        buffered: Option<DateTime<Utc>>,
        incoming: Option<DateTime<Utc>>,
    },
    BufferReplaced {
        id: String,
        previous: Option<DateTime<Utc>>,
        current: Option<DateTime<Utc>>,
    },
    Buffered {
        id: String,
        version: String,
    },
    /// The API returned an older copy than the queue hint
    NotActual {
        id: String,
        client_id: usize,
    },
    Archived {
        id: String,
    },
    FetchFailed {
        id: String,
        version: String,
        status_code: Option<u16>,
        error: String,
    },
    ResourceNotFound {
        id: String,
        version: String,
        error: String,
    },
    LocalReadFailed {
        id: String,
        error: String,
    },
    RetryScheduled {
        id: String,
        timeout: Duration,
        retries_count: u32,
    },
    Dropped {
        id: String,
        retries_count: u32,
        max_retries: u32,
    },
    Saved {
        id: String,
    },
    Updated {
        id: String,
    },
    /// A newer copy already landed in the store
    WriteSuperseded {
        id: String,
        reason: String,
    },
    WriteFailed {
        id: String,
        reason: String,
    },
    BulkSaved {
        count: usize,
        duration: Duration,
    },
    BulkFailed {
        count: usize,
        error: String,
    },
    /// Lag between the remote change and its local commit
    Timeshift {
        id: String,
        seconds: f64,
    },
}

impl SyncEvent {
    /// Stable identifier for log aggregation
    pub fn message_id(&self) -> &'static str {
        match self {
            Self::ClientLeased { .. } => "get_client",
            Self::ClientReleased { .. } => "put_client",
            Self::ClientCookiesRenewed { .. } => "renew_cookies",
            Self::ClientRenewalFailed { .. } => "exceptions",
            Self::ClientCookiesCleared { .. } => "clear_cookies",
            Self::Skipped { .. } | Self::DuplicateIgnored { .. } | Self::BufferReplaced { .. } => {
                "skipped"
            }
            Self::WriteSuperseded { .. } => "skipped",
            Self::Buffered { .. } => "add_to_save_bulk",
            Self::NotActual { .. } => "not_actual_docs",
            Self::Archived { .. } => "archived_documents",
            Self::FetchFailed { .. } | Self::LocalReadFailed { .. } | Self::BulkFailed { .. } => {
                "exceptions"
            }
            Self::ResourceNotFound { .. } => "not_found_docs",
            Self::RetryScheduled { .. } => "add_to_retry",
            Self::Dropped { .. } => "dropped_documents",
            Self::Saved { .. } => "save_documents",
            Self::Updated { .. } => "update_documents",
            Self::WriteFailed { .. } => "exceptions",
            Self::BulkSaved { .. } => "save_bulk",
            Self::Timeshift { .. } => "document_timeshift",
        }
    }

    /// Log level used by [`TracingEventSink`]
    pub fn level(&self) -> Level {
        match self {
            Self::ClientLeased { .. }
            | Self::ClientReleased { .. }
            | Self::Skipped { .. }
            | Self::DuplicateIgnored { .. }
            | Self::BufferReplaced { .. }
            | Self::Buffered { .. }
            | Self::WriteSuperseded { .. }
            | Self::BulkSaved { .. }
            | Self::Timeshift { .. } => Level::DEBUG,
            Self::ClientCookiesRenewed { .. }
            | Self::ClientCookiesCleared { .. }
            | Self::NotActual { .. }
            | Self::Archived { .. }
            | Self::RetryScheduled { .. }
            | Self::Saved { .. }
            | Self::Updated { .. } => Level::INFO,
            Self::FetchFailed { .. }
            | Self::ResourceNotFound { .. }
            | Self::LocalReadFailed { .. }
            | Self::ClientRenewalFailed { .. }
            | Self::WriteFailed { .. }
            | Self::BulkFailed { .. } => Level::ERROR,
            Self::Dropped { .. } => Level::WARN,
        }
    }

    /// Resource id the event is about, if any
    pub fn resource_id(&self) -> Option<&str> {
        match self {
            Self::Skipped { id, .. }
            | Self::DuplicateIgnored { id, .. }
            | Self::BufferReplaced { id, .. }
            | Self::Buffered { id, .. }
            | Self::NotActual { id, .. }
            | Self::Archived { id }
            | Self::FetchFailed { id, .. }
            | Self::ResourceNotFound { id, .. }
            | Self::LocalReadFailed { id, .. }
            | Self::RetryScheduled { id, .. }
            | Self::Dropped { id, .. }
            | Self::Saved { id }
            | Self::Updated { id }
            | Self::WriteSuperseded { id, .. }
            | Self::WriteFailed { id, .. }
            | Self::Timeshift { id, .. } => Some(id),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClientLeased {
                client_id,
                request_interval,
            } => write!(f, "got api client {client_id} (interval {request_interval:?})"),
            Self::ClientReleased {
                client_id,
                request_interval,
            } => write!(f, "put api client {client_id} (interval {request_interval:?})"),
            Self::ClientCookiesRenewed { client_id } => {
                write!(f, "renewed cookies of lazy api client {client_id}")
            }
            Self::ClientRenewalFailed { client_id, error } => {
                write!(f, "renewing cookies of api client {client_id} failed: {error}")
            }
            Self::ClientCookiesCleared { client_id, reason } => {
                write!(f, "cleared cookies of api client {client_id} ({reason:?})")
            }
            Self::Skipped {
                id,
                queue_hint,
                local,
            } => write!(f, "ignored {id}: queue {queue_hint}, local {local}"),
            Self::DuplicateIgnored {
                id,
                buffered,
                incoming,
            } => write!(
                f,
                "ignored duplicate {id} in bulk: previous {buffered:?}, current {incoming:?}"
            ),
            Self::BufferReplaced {
                id,
                previous,
                current,
            } => write!(
                f,
                "replaced {id} in bulk: previous {previous:?}, current {current:?}"
            ),
            Self::Buffered { id, version } => write!(f, "put in bulk {id} {version}"),
            Self::NotActual { id, client_id } => {
                write!(f, "api client {client_id} got not actual document {id}")
            }
            Self::Archived { id } => write!(f, "{id} archived"),
            Self::FetchFailed {
                id,
                version,
                status_code,
                error,
            } => match status_code {
                Some(code) => write!(f, "getting {id}-{version} failed with status {code}: {error}"),
                None => write!(f, "getting {id}-{version} failed: {error}"),
            },
            Self::ResourceNotFound { id, version, error } => {
                write!(f, "resource {id}-{version} not found at public api: {error}")
            }
            Self::LocalReadFailed { id, error } => {
                write!(f, "reading {id} from local store failed: {error}")
            }
            Self::RetryScheduled {
                id,
                timeout,
                retries_count,
            } => write!(
                f,
                "put {id} to retry queue (timeout {timeout:?}, retries {retries_count})"
            ),
            Self::Dropped {
                id,
                retries_count,
                max_retries,
            } => write!(
                f,
                "{id} reached retry limit ({retries_count} > {max_retries}) and was dropped"
            ),
            Self::Saved { id } => write!(f, "save {id}"),
            Self::Updated { id } => write!(f, "update {id}"),
            Self::WriteSuperseded { id, reason } => write!(f, "ignored {id}: {reason}"),
            Self::WriteFailed { id, reason } => {
                write!(f, "write of {id} failed: {reason}")
            }
            Self::BulkSaved { count, duration } => {
                write!(f, "saved bulk of {count} docs in {duration:?}")
            }
            Self::BulkFailed { count, error } => {
                write!(f, "saving bulk of {count} docs failed: {error}")
            }
            Self::Timeshift { id, seconds } => write!(f, "{id} timeshift is {seconds:.3} sec"),
        }
    }
}

// ============================================================================
// EventSink Trait
// ============================================================================

/// Receiver of worker outcome events.
///
/// Sinks are called inline from the worker loop and must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SyncEvent);

    /// Human-readable name for logging/debugging.
    fn name(&self) -> &'static str {
        "EventSink"
    }
}

// ============================================================================
// TracingEventSink
// ============================================================================

/// Renders every event as one `tracing` record with a `message_id` field.
#[derive(Debug, Clone)]
pub struct TracingEventSink {
    resource: String,
}

impl TracingEventSink {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
        }
    }
}

impl EventSink for TracingEventSink {
    fn emit(&self, event: SyncEvent) {
        let message_id = event.message_id();
        let resource = self.resource.as_str();
        let id = event.resource_id().unwrap_or("");
        let level = event.level();
        if level == Level::ERROR {
            tracing::error!(message_id, resource, id, "{}", event);
        } else if level == Level::WARN {
            tracing::warn!(message_id, resource, id, "{}", event);
        } else if level == Level::INFO {
            tracing::info!(message_id, resource, id, "{}", event);
        } else {
            tracing::debug!(message_id, resource, id, "{}", event);
        }
    }

    fn name(&self) -> &'static str {
        "TracingEventSink"
    }
}

// ============================================================================
// NoopEventSink
// ============================================================================

/// Discards every event.
#[derive(Debug, Clone, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: SyncEvent) {}

    fn name(&self) -> &'static str {
        "NoopEventSink"
    }
}

// ============================================================================
// MemoryEventSink
// ============================================================================

/// Keeps every event in memory; used by tests and diagnostics.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<SyncEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all events so far
    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().clone()
    }

    /// Number of events matching `predicate`
    pub fn count<F>(&self, predicate: F) -> usize
    where
        F: Fn(&SyncEvent) -> bool,
    {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }

    /// Number of events with the given message id
    pub fn count_message(&self, message_id: &str) -> usize {
        self.count(|e| e.message_id() == message_id)
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: SyncEvent) {
        self.events.lock().push(event);
    }

    fn name(&self) -> &'static str {
        "MemoryEventSink"
    }
}

// ============================================================================
// CompositeEventSink
// ============================================================================

/// Forwards events to multiple sinks, e.g. tracing plus a metrics exporter.
pub struct CompositeEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl CompositeEventSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    pub fn add(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for CompositeEventSink {
    fn emit(&self, event: SyncEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }

    fn name(&self) -> &'static str {
        "CompositeEventSink"
    }
}
