//! Queue items and documents

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a worker keeps in sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Only the current state of each resource, ordered by `dateModified`
    Live,
    /// Every revision of a resource as an independent record
    Historical,
}

impl SyncMode {
    pub fn is_historical(self) -> bool {
        self == Self::Historical
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Historical => write!(f, "historical"),
        }
    }
}

/// A unit of work: "check resource `id`"
///
/// `timeout` and `retries_count` are absent on first enqueue and filled in by
/// the retry scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,

    /// Freshness hint (live mode)
    #[serde(rename = "dateModified", default, skip_serializing_if = "Option::is_none")]
    pub date_modified: Option<DateTime<Utc>>,

    /// Revision to fetch (historical mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "option_duration_secs"
    )]
    pub timeout: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries_count: Option<u32>,
}

impl QueueItem {
    /// Item for live mode, optionally carrying a `dateModified` hint
    pub fn live(id: impl Into<String>, date_modified: Option<DateTime<Utc>>) -> Self {
        Self {
            id: id.into(),
            date_modified,
            rev: None,
            timeout: None,
            retries_count: None,
        }
    }

    /// Item for historical mode
    pub fn historical(id: impl Into<String>, rev: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            date_modified: None,
            rev: Some(rev.into()),
            timeout: None,
            retries_count: None,
        }
    }

    /// Attach retry state
    pub fn with_retry_state(mut self, timeout: Option<Duration>, retries_count: Option<u32>) -> Self {
        self.timeout = timeout;
        self.retries_count = retries_count;
        self
    }

    /// Copy carrying only the identity for `mode` (id plus hint or revision)
    /// and the current retry state.
    pub fn for_retry(&self, mode: SyncMode) -> Self {
        let base = match mode {
            SyncMode::Live => Self::live(self.id.clone(), self.date_modified),
            SyncMode::Historical => Self {
                rev: self.rev.clone(),
                ..Self::live(self.id.clone(), None)
            },
        };
        base.with_retry_state(self.timeout, self.retries_count)
    }

    /// Human readable version marker for log lines
    pub fn version_label(&self) -> String {
        match (&self.rev, &self.date_modified) {
            (Some(rev), _) => rev.clone(),
            (None, Some(dm)) => dm.to_rfc3339(),
            (None, None) => "-".to_string(),
        }
    }
}

/// A resource document as returned by the public API and stored locally
///
/// Fields the worker does not interpret are kept in `data` and round-trip
/// untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,

    #[serde(rename = "dateModified", default, skip_serializing_if = "Option::is_none")]
    pub date_modified: Option<DateTime<Utc>>,

    /// Public API revision (historical mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,

    /// Local store identity
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub store_id: Option<String>,

    /// Local store revision, present when updating an existing record
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub store_rev: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,

    #[serde(flatten)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl Document {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            date_modified: None,
            rev: None,
            store_id: None,
            store_rev: None,
            doc_type: None,
            data: serde_json::Map::new(),
        }
    }

    pub fn with_date_modified(mut self, date_modified: DateTime<Utc>) -> Self {
        self.date_modified = Some(date_modified);
        self
    }

    pub fn with_rev(mut self, rev: impl Into<String>) -> Self {
        self.rev = Some(rev.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Local store identity for `mode`: `id` live, `id-rev` historical
    pub fn identity(&self, mode: SyncMode) -> String {
        match (mode, &self.rev) {
            (SyncMode::Historical, Some(rev)) => format!("{}-{}", self.id, rev),
            _ => self.id.clone(),
        }
    }
}

/// Serde support for Option<Duration> as fractional seconds
mod option_duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_secs_f64()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}
