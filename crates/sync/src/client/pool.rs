//! Client pool
//!
//! Bounded set of client handles shared by all workers. The pool is the
//! mutual-exclusion mechanism: a leased handle is invisible to everyone else
//! until it is released.

use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use tracing::{debug, instrument};

use super::api::ResourceApi;
use super::handle::{ClientHandle, ClientStats};
use crate::events::{EventSink, SyncEvent};
use crate::queue::InMemoryQueue;

/// Pool of API client handles
///
/// # Example
///
/// ```ignore
/// let pool = ClientPool::new(clients, events);
///
/// if let Some(handle) = pool.lease(Duration::from_secs(3)).await {
///     // ... fetch with handle.client()
///     pool.release(handle);
/// }
/// ```
pub struct ClientPool {
    handles: InMemoryQueue<ClientHandle>,
    capacity: usize,
    stats: DashMap<usize, ClientStats>,
    renewals: DashSet<usize>,
    events: Arc<dyn EventSink>,
}

impl ClientPool {
    /// Wrap each client in a fresh handle, ids assigned in order
    pub fn new(clients: Vec<Arc<dyn ResourceApi>>, events: Arc<dyn EventSink>) -> Self {
        let handles = clients
            .into_iter()
            .enumerate()
            .map(|(id, client)| ClientHandle::new(id, client))
            .collect();
        Self::from_handles(handles, events)
    }

    /// Build a pool from existing handles
    pub fn from_handles(handles: Vec<ClientHandle>, events: Arc<dyn EventSink>) -> Self {
        let stats = handles.iter().map(|h| (h.id(), h.stats())).collect();
        let capacity = handles.len();
        Self {
            handles: handles.into_iter().collect(),
            capacity,
            stats,
            renewals: DashSet::new(),
            events,
        }
    }

    /// Lease a handle, waiting at most `timeout` when others race for it.
    ///
    /// A handle flagged for cookie renewal is renewed first. If the renewal
    /// fails the handle goes straight back to the pool and `None` is
    /// returned; the caller retries later.
    #[instrument(skip(self))]
    pub async fn lease(&self, timeout: Duration) -> Option<ClientHandle> {
        let mut handle = self.handles.pop_within(timeout).await?;

        if self.renewals.remove(&handle.id()).is_some() {
            handle.mark_for_renewal();
        }

        if handle.drop_cookies() {
            match handle.renew().await {
                Ok(()) => {
                    self.events.emit(SyncEvent::ClientCookiesRenewed {
                        client_id: handle.id(),
                    });
                }
                Err(e) => {
                    self.events.emit(SyncEvent::ClientRenewalFailed {
                        client_id: handle.id(),
                        error: e.to_string(),
                    });
                    self.release(handle);
                    return None;
                }
            }
        }

        debug!(
            client_id = handle.id(),
            user_agent = %handle.client().user_agent(),
            "Leased api client"
        );
        self.events.emit(SyncEvent::ClientLeased {
            client_id: handle.id(),
            request_interval: handle.request_interval(),
        });
        Some(handle)
    }

    /// Return a handle to the pool. Always succeeds.
    pub fn release(&self, handle: ClientHandle) {
        self.stats.insert(handle.id(), handle.stats());
        self.events.emit(SyncEvent::ClientReleased {
            client_id: handle.id(),
            request_interval: handle.request_interval(),
        });
        self.handles.push_item(handle);
    }

    /// Renew the session of client `id` the next time it is leased
    pub fn request_cookie_renewal(&self, id: usize) {
        self.renewals.insert(id);
    }

    /// Flag every client whose average request duration exceeds `max_avg`
    /// for cookie renewal. Returns the flagged ids.
    pub fn flag_slow_clients(&self, max_avg: Duration) -> Vec<usize> {
        let mut flagged: Vec<usize> = self
            .stats
            .iter()
            .filter(|entry| entry.request_count > 0 && entry.avg_duration > max_avg)
            .map(|entry| *entry.key())
            .collect();
        flagged.sort_unstable();

        for id in &flagged {
            self.request_cookie_renewal(*id);
        }
        flagged
    }

    /// Last published stats for every client, ordered by id
    pub fn stats(&self) -> Vec<ClientStats> {
        let mut stats: Vec<ClientStats> = self.stats.iter().map(|e| e.value().clone()).collect();
        stats.sort_by_key(|s| s.id);
        stats
    }

    /// Handles currently idle in the pool
    pub fn available(&self) -> usize {
        self.handles.size()
    }

    /// Total handles owned by the pool
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ApiError, CallOutcome, ScriptedApi, ThrottleSteps};
    use crate::events::MemoryEventSink;

    fn pool_of(n: usize) -> (Vec<Arc<ScriptedApi>>, Arc<MemoryEventSink>, ClientPool) {
        let apis: Vec<Arc<ScriptedApi>> = (0..n)
            .map(|i| Arc::new(ScriptedApi::new(format!("client-{i}"))))
            .collect();
        let events = Arc::new(MemoryEventSink::new());
        let clients = apis
            .iter()
            .map(|a| a.clone() as Arc<dyn ResourceApi>)
            .collect();
        let pool = ClientPool::new(clients, events.clone());
        (apis, events, pool)
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_and_release() {
        let (_, _, pool) = pool_of(2);
        assert_eq!(pool.capacity(), 2);

        let a = pool.lease(Duration::from_secs(1)).await.unwrap();
        let b = pool.lease(Duration::from_secs(1)).await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.available(), 0);

        // Drained pool yields nothing
        assert!(pool.lease(Duration::from_secs(1)).await.is_none());

        pool.release(a);
        pool.release(b);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_publishes_stats() {
        let (_, _, pool) = pool_of(1);
        let steps = ThrottleSteps {
            inc: Duration::from_millis(100),
            dec: Duration::from_millis(20),
            drop_threshold: Duration::from_secs(2),
        };

        let mut handle = pool.lease(Duration::from_secs(1)).await.unwrap();
        handle.record_call(CallOutcome::RateLimited, Duration::from_millis(40), &steps);
        pool.release(handle);

        let stats = pool.stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].request_interval, Duration::from_millis(100));
        assert_eq!(stats[0].request_count, 1);
        assert_eq!(stats[0].user_agent, "client-0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_flagged_client_renews_on_lease() {
        let (apis, events, pool) = pool_of(1);
        pool.request_cookie_renewal(0);

        let handle = pool.lease(Duration::from_secs(1)).await.unwrap();

        assert_eq!(apis[0].renewals(), 1);
        assert!(!handle.drop_cookies());
        assert_eq!(
            events.count(|e| matches!(e, SyncEvent::ClientCookiesRenewed { client_id: 0 })),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_renewal_returns_handle_and_yields_none() {
        let (apis, events, pool) = pool_of(1);
        apis[0].fail_next_renewal(ApiError::Other("timeout".into()));
        pool.request_cookie_renewal(0);

        assert!(pool.lease(Duration::from_secs(1)).await.is_none());
        assert_eq!(pool.available(), 1);
        assert_eq!(events.count_message("exceptions"), 1);

        // Flag survives, next lease renews successfully
        let handle = pool.lease(Duration::from_secs(1)).await.unwrap();
        assert_eq!(apis[0].renewals(), 1);
        assert!(!handle.drop_cookies());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flag_slow_clients() {
        let (_, _, pool) = pool_of(2);
        let steps = ThrottleSteps {
            inc: Duration::ZERO,
            dec: Duration::ZERO,
            drop_threshold: Duration::ZERO,
        };

        let mut a = pool.lease(Duration::from_secs(1)).await.unwrap();
        let mut b = pool.lease(Duration::from_secs(1)).await.unwrap();
        a.record_call(CallOutcome::Success, Duration::from_secs(5), &steps);
        b.record_call(CallOutcome::Success, Duration::from_millis(50), &steps);
        let slow_id = a.id();
        pool.release(a);
        pool.release(b);

        assert_eq!(pool.flag_slow_clients(Duration::from_secs(1)), vec![slow_id]);
    }
}
