//! Leasable client handle with adaptive throttle state

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::api::{ApiError, ResourceApi};
use crate::config::SyncConfig;

/// Step sizes driving the request interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleSteps {
    /// Growth on a rate-limit response
    pub inc: Duration,
    /// Decay on success
    pub dec: Duration,
    /// Interval above which a rate-limited client clears its cookies instead of growing
    pub drop_threshold: Duration,
}

impl From<&SyncConfig> for ThrottleSteps {
    fn from(config: &SyncConfig) -> Self {
        Self {
            inc: config.client_inc_step_timeout,
            dec: config.client_dec_step_timeout,
            drop_threshold: config.drop_threshold_client_cookies,
        }
    }
}

/// Result of a remote call, as far as throttling is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    RateLimited,
    Failure,
}

/// What a reported call did to the request interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleAdjustment {
    Decreased,
    Increased,
    CookiesCleared,
    Unchanged,
}

/// Point-in-time view of a client, published by the pool on release
#[derive(Debug, Clone, PartialEq)]
pub struct ClientStats {
    pub id: usize,
    pub user_agent: String,
    pub request_interval: Duration,
    pub avg_duration: Duration,
    pub request_count: usize,
    pub not_actual_count: u32,
    pub drop_cookies: bool,
}

/// A connection plus its throttle state.
///
/// Only the worker currently holding the handle mutates it; the pool hands
/// each handle to at most one worker at a time.
pub struct ClientHandle {
    id: usize,
    client: Arc<dyn ResourceApi>,
    request_interval: Duration,
    request_durations: Vec<(DateTime<Utc>, Duration)>,
    total_duration: Duration,
    avg_duration: Duration,
    drop_cookies: bool,
    not_actual_count: u32,
}

impl ClientHandle {
    pub fn new(id: usize, client: Arc<dyn ResourceApi>) -> Self {
        Self {
            id,
            client,
            request_interval: Duration::ZERO,
            request_durations: Vec::new(),
            total_duration: Duration::ZERO,
            avg_duration: Duration::ZERO,
            drop_cookies: false,
            not_actual_count: 0,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn client(&self) -> &dyn ResourceApi {
        self.client.as_ref()
    }

    /// Current self-imposed delay before each request
    pub fn request_interval(&self) -> Duration {
        self.request_interval
    }

    pub fn request_durations(&self) -> &[(DateTime<Utc>, Duration)] {
        &self.request_durations
    }

    pub fn avg_duration(&self) -> Duration {
        self.avg_duration
    }

    pub fn drop_cookies(&self) -> bool {
        self.drop_cookies
    }

    pub fn not_actual_count(&self) -> u32 {
        self.not_actual_count
    }

    /// Ask for a session renewal on the next lease
    pub fn mark_for_renewal(&mut self) {
        self.drop_cookies = true;
    }

    /// Record the outcome of one remote call.
    ///
    /// The elapsed time is always recorded; the request interval decays on
    /// success and grows on rate limiting until it passes the drop threshold,
    /// at which point the cookies are cleared and the interval starts over.
    pub fn record_call(
        &mut self,
        outcome: CallOutcome,
        elapsed: Duration,
        steps: &ThrottleSteps,
    ) -> ThrottleAdjustment {
        self.record_duration(elapsed);

        match outcome {
            CallOutcome::Success => {
                if self.request_interval.is_zero() {
                    return ThrottleAdjustment::Unchanged;
                }
                self.request_interval = self.request_interval.saturating_sub(steps.dec);
                ThrottleAdjustment::Decreased
            }
            CallOutcome::RateLimited => {
                if self.request_interval > steps.drop_threshold {
                    self.clear_cookies();
                    self.request_interval = Duration::ZERO;
                    ThrottleAdjustment::CookiesCleared
                } else {
                    self.request_interval += steps.inc;
                    ThrottleAdjustment::Increased
                }
            }
            CallOutcome::Failure => ThrottleAdjustment::Unchanged,
        }
    }

    /// Drop the session cookies. The request interval is left alone.
    pub fn clear_cookies(&mut self) {
        self.client.clear_session_cookies();
    }

    /// Count a fetch that returned an older copy than the queue hint
    pub fn note_not_actual(&mut self) {
        self.not_actual_count += 1;
    }

    /// Renew the session and reset all throttle state.
    ///
    /// On failure nothing changes and the handle stays flagged.
    pub async fn renew(&mut self) -> Result<(), ApiError> {
        self.client.renew_session().await?;
        self.request_interval = Duration::ZERO;
        self.request_durations.clear();
        self.total_duration = Duration::ZERO;
        self.avg_duration = Duration::ZERO;
        self.not_actual_count = 0;
        self.drop_cookies = false;
        Ok(())
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            id: self.id,
            user_agent: self.client.user_agent(),
            request_interval: self.request_interval,
            avg_duration: self.avg_duration,
            request_count: self.request_durations.len(),
            not_actual_count: self.not_actual_count,
            drop_cookies: self.drop_cookies,
        }
    }

    fn record_duration(&mut self, elapsed: Duration) {
        self.request_durations.push((Utc::now(), elapsed));
        self.total_duration += elapsed;
        let count = u32::try_from(self.request_durations.len()).unwrap_or(u32::MAX);
        self.avg_duration = self.total_duration / count;
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.id)
            .field("request_interval", &self.request_interval)
            .field("avg_duration", &self.avg_duration)
            .field("drop_cookies", &self.drop_cookies)
            .field("not_actual_count", &self.not_actual_count)
            .finish()
    }
}
