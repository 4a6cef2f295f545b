//! Public API client seam

use async_trait::async_trait;

use crate::item::Document;

/// HTTP status the API uses to signal rate limiting
pub const TOO_MANY_REQUESTS: u16 = 429;

/// Failures reported by a [`ResourceApi`] call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// Resource was archived and will never be served again
    #[error("resource gone")]
    Gone,

    /// Response could not be parsed into a document
    #[error("invalid response (status code {status_code})")]
    InvalidResponse { status_code: u16 },

    /// Non-success HTTP status
    #[error("request failed with status code {status_code}")]
    RequestFailed { status_code: u16 },

    /// Resource unknown to the API
    #[error("resource not found: {0}")]
    NotFound(String),

    /// Anything else (transport errors, timeouts, ...)
    #[error("{0}")]
    Other(String),
}

impl ApiError {
    /// HTTP status carried by the error, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::InvalidResponse { status_code } | Self::RequestFailed { status_code } => {
                Some(*status_code)
            }
            _ => None,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            Self::RequestFailed {
                status_code: TOO_MANY_REQUESTS
            }
        )
    }
}

/// One authenticated connection to the public API.
///
/// Session cookies are interior state of the implementation, so cookie
/// operations take `&self`.
#[async_trait]
pub trait ResourceApi: Send + Sync {
    /// Current state of a resource
    async fn get_resource_item(&self, id: &str) -> Result<Document, ApiError>;

    /// A specific revision of a resource
    async fn get_resource_item_historical(&self, id: &str, rev: &str)
        -> Result<Document, ApiError>;

    /// Obtain a fresh session (new cookies)
    async fn renew_session(&self) -> Result<(), ApiError>;

    /// Forget the current session cookies
    fn clear_session_cookies(&self);

    /// Identifies the connection in logs
    fn user_agent(&self) -> String {
        "edge-sync".to_string()
    }
}
