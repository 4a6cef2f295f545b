//! # Edge Sync
//!
//! Workers that keep a local document store in sync with a public resource API.
//!
//! ## Features
//!
//! - **Client pool**: leasable API clients, each with its own adaptive request interval
//! - **Reconciliation**: skips items whose local copy is already as fresh as the queue hint
//! - **Retry scheduling**: exponential backoff with a retry ceiling, 429 handled by the client
//! - **Bulk writes**: per-worker buffer flushed by size, time or shutdown
//! - **Live and historical modes**: last-writer-wins by `dateModified`, or one record per revision
//!
//! ## Architecture
//!
//! ```text
//!        work queue                 retry queue ◄──────────────┐
//!            │                                                 │
//!            ▼                                                 │
//! ┌─────────────────────────────────────────────────────┐      │
//! │                    SyncWorker × N                    │      │
//! │  lease client ─► pop item ─► FetchPipeline ─────────┼──────┤
//! │                                   │                  │      │
//! │                                   ▼                  │      │
//! │                              BulkBuffer ─── flush ───┼──────┘
//! └─────────────────────────────────────────────────────┘
//!        │                                  │
//!        ▼                                  ▼
//! ┌──────────────┐                  ┌──────────────┐
//! │  ClientPool  │                  │  LocalStore  │
//! │ (ResourceApi)│                  │              │
//! └──────────────┘                  └──────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use edge_sync::prelude::*;
//!
//! let config = SyncConfig::from_env();
//! let events: Arc<dyn EventSink> = Arc::new(TracingEventSink::new(&config.resource_name));
//!
//! let resources = WorkerResources {
//!     pool: Arc::new(ClientPool::new(clients, events.clone())),
//!     queue,
//!     retry_queue,
//!     store,
//!     events,
//! };
//!
//! let group = WorkerGroup::spawn(4, &config, resources)?;
//! // ... later
//! let reports = group.shutdown_and_join().await?;
//! ```

pub mod bulk;
pub mod client;
pub mod config;
pub mod events;
pub mod item;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod shutdown;
pub mod store;
pub mod telemetry;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::bulk::{BulkBuffer, FlushReport};
    pub use crate::client::{ApiError, ClientPool, ResourceApi};
    pub use crate::config::{ConfigError, SyncConfig};
    pub use crate::events::{EventSink, SyncEvent, TracingEventSink};
    pub use crate::item::{Document, QueueItem, SyncMode};
    pub use crate::queue::{InMemoryQueue, WorkQueue};
    pub use crate::retry::{RetryPolicy, RetryScheduler};
    pub use crate::shutdown::{shutdown_channel, ShutdownHandle, ShutdownListener};
    pub use crate::store::{BulkWriteResult, InMemoryLocalStore, LocalStore, StoreError, WriteError};
    pub use crate::telemetry::{init_telemetry, TelemetryConfig};
    pub use crate::worker::{SyncWorker, WorkerGroup, WorkerGroupError, WorkerReport, WorkerResources};
}

// Re-export key types at crate root
pub use client::{ApiError, ClientPool, ResourceApi};
pub use config::{ConfigError, SyncConfig};
pub use events::{EventSink, SyncEvent};
pub use item::{Document, QueueItem, SyncMode};
pub use queue::{InMemoryQueue, WorkQueue};
pub use store::{InMemoryLocalStore, LocalStore, StoreError, WriteError};
pub use worker::{SyncWorker, WorkerGroup, WorkerGroupError, WorkerReport, WorkerResources};
