//! Worker configuration
//!
//! One [`SyncConfig`] is shared read-only by every worker of a process.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::item::SyncMode;

/// Process-wide sync configuration
///
/// All timeouts are expressed in (fractional) seconds when serialized.
///
/// # Example
///
/// ```
/// use edge_sync::SyncConfig;
/// use std::time::Duration;
///
/// let config = SyncConfig::new("plans")
///     .with_bulk_save_limit(500)
///     .with_bulk_save_interval(Duration::from_secs(3));
///
/// assert_eq!(config.item_label(), "plan");
/// assert_eq!(config.doc_type(), "Plan");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncConfig {
    /// Plural resource name on the public API (e.g. "tenders")
    pub resource_name: String,

    /// Sync every revision as its own record instead of the current state
    pub historical: bool,

    /// Buffer size above which a flush is forced
    pub bulk_save_limit: usize,

    /// Maximum time between two flushes
    #[serde(with = "duration_secs")]
    pub bulk_save_interval: Duration,

    /// Bounded wait when leasing a client or a queue item
    #[serde(with = "duration_secs")]
    pub queue_timeout: Duration,

    /// Idle sleep when no client or no item is available
    #[serde(with = "duration_secs")]
    pub worker_sleep: Duration,

    /// Backoff used for the first retry of an item
    #[serde(with = "duration_secs")]
    pub retry_default_timeout: Duration,

    /// Items whose retry count exceeds this are dropped
    pub max_retries: u32,

    /// Request interval growth on a rate-limit response
    #[serde(with = "duration_secs")]
    pub client_inc_step_timeout: Duration,

    /// Request interval decay on a successful call
    #[serde(with = "duration_secs")]
    pub client_dec_step_timeout: Duration,

    /// Request interval above which a rate-limited client drops its cookies
    #[serde(with = "duration_secs")]
    pub drop_threshold_client_cookies: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            resource_name: "tenders".to_string(),
            historical: false,
            bulk_save_limit: 1000,
            bulk_save_interval: Duration::from_secs(5),
            queue_timeout: Duration::from_secs(3),
            worker_sleep: Duration::from_secs(5),
            retry_default_timeout: Duration::from_secs(5),
            max_retries: 10,
            client_inc_step_timeout: Duration::from_millis(100),
            client_dec_step_timeout: Duration::from_millis(20),
            drop_threshold_client_cookies: Duration::from_secs(2),
        }
    }
}

impl SyncConfig {
    /// Create a configuration for the given resource with default tuning
    pub fn new(resource_name: impl Into<String>) -> Self {
        Self {
            resource_name: resource_name.into(),
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables (all optional, durations in seconds):
    /// - `EDGE_SYNC_RESOURCE`
    /// - `EDGE_SYNC_HISTORICAL` ("true" to enable)
    /// - `EDGE_SYNC_BULK_SAVE_LIMIT`
    /// - `EDGE_SYNC_BULK_SAVE_INTERVAL`
    /// - `EDGE_SYNC_QUEUE_TIMEOUT`
    /// - `EDGE_SYNC_WORKER_SLEEP`
    /// - `EDGE_SYNC_RETRY_DEFAULT_TIMEOUT`
    /// - `EDGE_SYNC_RETRIES_COUNT`
    /// - `EDGE_SYNC_CLIENT_INC_STEP_TIMEOUT`
    /// - `EDGE_SYNC_CLIENT_DEC_STEP_TIMEOUT`
    /// - `EDGE_SYNC_DROP_THRESHOLD_CLIENT_COOKIES`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// Missing or unparseable values fall back to the defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| {
            lookup(key)
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|v| v.is_finite() && *v >= 0.0)
                .map(Duration::from_secs_f64)
                .unwrap_or(default)
        };

        Self {
            resource_name: lookup("EDGE_SYNC_RESOURCE").unwrap_or(defaults.resource_name),
            historical: lookup("EDGE_SYNC_HISTORICAL")
                .map(|v| v.to_lowercase() == "true")
                .unwrap_or(defaults.historical),
            bulk_save_limit: lookup("EDGE_SYNC_BULK_SAVE_LIMIT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.bulk_save_limit),
            bulk_save_interval: secs("EDGE_SYNC_BULK_SAVE_INTERVAL", defaults.bulk_save_interval),
            queue_timeout: secs("EDGE_SYNC_QUEUE_TIMEOUT", defaults.queue_timeout),
            worker_sleep: secs("EDGE_SYNC_WORKER_SLEEP", defaults.worker_sleep),
            retry_default_timeout: secs(
                "EDGE_SYNC_RETRY_DEFAULT_TIMEOUT",
                defaults.retry_default_timeout,
            ),
            max_retries: lookup("EDGE_SYNC_RETRIES_COUNT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_retries),
            client_inc_step_timeout: secs(
                "EDGE_SYNC_CLIENT_INC_STEP_TIMEOUT",
                defaults.client_inc_step_timeout,
            ),
            client_dec_step_timeout: secs(
                "EDGE_SYNC_CLIENT_DEC_STEP_TIMEOUT",
                defaults.client_dec_step_timeout,
            ),
            drop_threshold_client_cookies: secs(
                "EDGE_SYNC_DROP_THRESHOLD_CLIENT_COOKIES",
                defaults.drop_threshold_client_cookies,
            ),
        }
    }

    /// Switch to historical mode
    pub fn with_historical(mut self, historical: bool) -> Self {
        self.historical = historical;
        self
    }

    /// Set the forced-flush buffer size
    pub fn with_bulk_save_limit(mut self, limit: usize) -> Self {
        self.bulk_save_limit = limit;
        self
    }

    /// Set the maximum interval between flushes
    pub fn with_bulk_save_interval(mut self, interval: Duration) -> Self {
        self.bulk_save_interval = interval;
        self
    }

    /// Set the lease wait for clients and queue items
    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    /// Set the idle sleep
    pub fn with_worker_sleep(mut self, sleep: Duration) -> Self {
        self.worker_sleep = sleep;
        self
    }

    /// Set the first retry backoff
    pub fn with_retry_default_timeout(mut self, timeout: Duration) -> Self {
        self.retry_default_timeout = timeout;
        self
    }

    /// Set the retry ceiling
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the request interval steps (increase on 429, decrease on success)
    pub fn with_client_steps(mut self, inc: Duration, dec: Duration) -> Self {
        self.client_inc_step_timeout = inc;
        self.client_dec_step_timeout = dec;
        self
    }

    /// Set the request interval at which a throttled client drops its cookies
    pub fn with_drop_threshold_client_cookies(mut self, threshold: Duration) -> Self {
        self.drop_threshold_client_cookies = threshold;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resource_name.trim().is_empty() {
            return Err(ConfigError::Invalid("resource_name must not be empty".into()));
        }
        if self.bulk_save_limit == 0 {
            return Err(ConfigError::Invalid(
                "bulk_save_limit must be greater than zero".into(),
            ));
        }
        if self.client_dec_step_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "client_dec_step_timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Operating mode derived from `historical`
    pub fn mode(&self) -> SyncMode {
        if self.historical {
            SyncMode::Historical
        } else {
            SyncMode::Live
        }
    }

    /// Singular resource name used in log lines ("tenders" -> "tender")
    pub fn item_label(&self) -> &str {
        let name = self.resource_name.as_str();
        name.strip_suffix('s').unwrap_or(name)
    }

    /// Document type stamped on stored documents ("tenders" -> "Tender")
    pub fn doc_type(&self) -> String {
        let mut chars = self.item_label().chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Invalid configuration
    #[error("invalid sync configuration: {0}")]
    Invalid(String),
}

/// Serde support for Duration as fractional seconds
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
