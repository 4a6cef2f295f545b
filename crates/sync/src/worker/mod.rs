//! Sync workers
//!
//! This module provides:
//! - [`SyncWorker`] - one cooperative loop: lease client, take item, fetch, buffer, flush
//! - [`WorkerGroup`] - N workers over shared resources with one shutdown switch
//!
//! Workers share only the client pool, the two queues, the local store and
//! the event sink ([`WorkerResources`]). Everything else, the bulk buffer
//! included, is private to a worker.

mod group;
mod sync_worker;

use std::sync::Arc;

use crate::client::ClientPool;
use crate::events::EventSink;
use crate::queue::WorkQueue;
use crate::store::LocalStore;

pub use group::{WorkerGroup, WorkerGroupError};
pub use sync_worker::{Step, SyncWorker, WorkerReport, WorkerState};

/// Shared resources every worker of a process operates on
#[derive(Clone)]
pub struct WorkerResources {
    pub pool: Arc<ClientPool>,
    /// Main work queue
    pub queue: Arc<dyn WorkQueue>,
    /// Where failed items go; re-merged into `queue` by the producer side
    pub retry_queue: Arc<dyn WorkQueue>,
    pub store: Arc<dyn LocalStore>,
    pub events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for WorkerResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerResources")
            .field("clients", &self.pool.capacity())
            .field("queued", &self.queue.len())
            .field("retry_queued", &self.retry_queue.len())
            .field("events", &self.events.name())
            .finish()
    }
}
