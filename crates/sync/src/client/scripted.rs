//! Scripted in-memory implementation of ResourceApi for testing

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::api::{ApiError, ResourceApi};
use crate::item::Document;

type Script = VecDeque<Result<Document, ApiError>>;

/// A [`ResourceApi`] answering from per-resource scripts.
///
/// Each script is consumed front to back; its last entry repeats forever.
/// Unscripted resources answer [`ApiError::NotFound`].
///
/// # Example
///
/// ```
/// use edge_sync::client::{ApiError, ScriptedApi};
/// use edge_sync::Document;
///
/// let api = ScriptedApi::new("client-0");
/// api.respond("A", Err(ApiError::RequestFailed { status_code: 500 }));
/// api.respond("A", Ok(Document::new("A")));
/// ```
pub struct ScriptedApi {
    name: String,
    live: Mutex<HashMap<String, Script>>,
    historical: Mutex<HashMap<(String, String), Script>>,
    renewal_failures: Mutex<VecDeque<ApiError>>,
    latency: Duration,
    calls: AtomicUsize,
    cookie_clears: AtomicUsize,
    renewals: AtomicUsize,
}

impl ScriptedApi {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            live: Mutex::new(HashMap::new()),
            historical: Mutex::new(HashMap::new()),
            renewal_failures: Mutex::new(VecDeque::new()),
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
            cookie_clears: AtomicUsize::new(0),
            renewals: AtomicUsize::new(0),
        }
    }

    /// Simulated time spent on every fetch
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Append a response to the live script of `id`
    pub fn respond(&self, id: &str, response: Result<Document, ApiError>) {
        self.live
            .lock()
            .entry(id.to_string())
            .or_default()
            .push_back(response);
    }

    /// Append a response to the script of revision `rev` of `id`
    pub fn respond_historical(&self, id: &str, rev: &str, response: Result<Document, ApiError>) {
        self.historical
            .lock()
            .entry((id.to_string(), rev.to_string()))
            .or_default()
            .push_back(response);
    }

    /// Make the next session renewal fail
    pub fn fail_next_renewal(&self, error: ApiError) {
        self.renewal_failures.lock().push_back(error);
    }

    /// Number of fetches served
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn cookie_clears(&self) -> usize {
        self.cookie_clears.load(Ordering::SeqCst)
    }

    /// Number of successful session renewals
    pub fn renewals(&self) -> usize {
        self.renewals.load(Ordering::SeqCst)
    }

    async fn answer<K>(&self, scripts: &Mutex<HashMap<K, Script>>, key: &K, id: &str)
        -> Result<Document, ApiError>
    where
        K: std::hash::Hash + Eq,
    {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut scripts = scripts.lock();
        match scripts.get_mut(key) {
            Some(script) if script.len() > 1 => script
                .pop_front()
                .unwrap_or_else(|| Err(ApiError::NotFound(id.to_string()))),
            Some(script) => script
                .front()
                .cloned()
                .unwrap_or_else(|| Err(ApiError::NotFound(id.to_string()))),
            None => Err(ApiError::NotFound(id.to_string())),
        }
    }
}

#[async_trait]
impl ResourceApi for ScriptedApi {
    async fn get_resource_item(&self, id: &str) -> Result<Document, ApiError> {
        self.answer(&self.live, &id.to_string(), id).await
    }

    async fn get_resource_item_historical(
        &self,
        id: &str,
        rev: &str,
    ) -> Result<Document, ApiError> {
        self.answer(&self.historical, &(id.to_string(), rev.to_string()), id)
            .await
    }

    async fn renew_session(&self) -> Result<(), ApiError> {
        if let Some(error) = self.renewal_failures.lock().pop_front() {
            return Err(error);
        }
        self.renewals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn clear_session_cookies(&self) {
        self.cookie_clears.fetch_add(1, Ordering::SeqCst);
    }

    fn user_agent(&self) -> String {
        self.name.clone()
    }
}
