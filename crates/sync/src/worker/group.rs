//! A group of sync workers sharing one set of resources

use tokio::task::JoinHandle;
use tracing::{error, info, instrument};

use super::{SyncWorker, WorkerReport, WorkerResources};
use crate::config::{ConfigError, SyncConfig};
use crate::shutdown::{shutdown_channel, ShutdownHandle};

/// Worker group errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerGroupError {
    /// Configuration rejected before any worker started
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Asked for zero workers
    #[error("worker group needs at least one worker")]
    NoWorkers,

    /// A worker task panicked or was cancelled
    #[error("worker {worker_id} did not finish: {message}")]
    WorkerFailed { worker_id: usize, message: String },
}

/// N [`SyncWorker`] tasks with a shared shutdown switch
///
/// # Example
///
/// ```ignore
/// let group = WorkerGroup::spawn(4, &config, resources)?;
///
/// // ... later
/// let reports = group.shutdown_and_join().await?;
/// ```
pub struct WorkerGroup {
    shutdown: ShutdownHandle,
    workers: Vec<(usize, JoinHandle<WorkerReport>)>,
}

impl WorkerGroup {
    /// Validate `config` and start `count` workers on the current runtime
    #[instrument(skip(config, resources), fields(resource = %config.resource_name))]
    pub fn spawn(
        count: usize,
        config: &SyncConfig,
        resources: WorkerResources,
    ) -> Result<Self, WorkerGroupError> {
        if count == 0 {
            return Err(WorkerGroupError::NoWorkers);
        }
        config.validate()?;

        let (shutdown, listener) = shutdown_channel();
        let workers = (0..count)
            .map(|id| {
                let worker = SyncWorker::new(id, config, resources.clone(), listener.clone());
                (id, tokio::spawn(worker.run()))
            })
            .collect();

        info!(
            workers = count,
            mode = %config.mode(),
            clients = resources.pool.capacity(),
            "Started worker group"
        );
        Ok(Self { shutdown, workers })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Ask every worker to stop after its current iteration
    pub fn shutdown(&self) {
        if !self.shutdown.is_shutdown() {
            info!(workers = self.workers.len(), "Stopping worker group");
        }
        self.shutdown.shutdown();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    /// Wait for every worker to exit, reports ordered by worker id.
    ///
    /// Does not signal shutdown itself.
    pub async fn join(self) -> Result<Vec<WorkerReport>, WorkerGroupError> {
        let (ids, tasks): (Vec<usize>, Vec<_>) = self.workers.into_iter().unzip();
        let results = futures::future::join_all(tasks).await;

        let mut reports = Vec::with_capacity(ids.len());
        let mut failure = None;
        for (worker_id, result) in ids.into_iter().zip(results) {
            match result {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!(worker_id, error = %e, "Worker task failed");
                    failure.get_or_insert(WorkerGroupError::WorkerFailed {
                        worker_id,
                        message: e.to_string(),
                    });
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(reports),
        }
    }

    pub async fn shutdown_and_join(self) -> Result<Vec<WorkerReport>, WorkerGroupError> {
        self.shutdown();
        self.join().await
    }
}

impl std::fmt::Debug for WorkerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerGroup")
            .field("workers", &self.workers.len())
            .field("shutdown", &self.shutdown.is_shutdown())
            .finish()
    }
}
