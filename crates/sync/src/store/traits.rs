//! LocalStore trait definition

use async_trait::async_trait;

use crate::item::Document;

/// Error type for whole-store operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Store could not be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Why a single document in a bulk write was refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    /// The store already holds a newer copy; the write lost a benign race
    #[error("New doc with oldest dateModified.")]
    OlderThanStored,

    /// `_rev` did not match the stored revision
    #[error("Document update conflict.")]
    RevisionConflict,

    /// Any other refusal
    #[error("{0}")]
    Rejected(String),
}

impl WriteError {
    /// A newer document already landed, nothing to retry
    pub fn is_superseded(&self) -> bool {
        matches!(self, Self::OlderThanStored)
    }
}

/// Per-document outcome of [`LocalStore::bulk_update`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkWriteResult {
    /// Store identity (`_id`) of the document
    pub id: String,
    /// New store revision, or why the write was refused
    pub result: Result<String, WriteError>,
}

impl BulkWriteResult {
    pub fn ok(id: impl Into<String>, rev: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: Ok(rev.into()),
        }
    }

    pub fn err(id: impl Into<String>, error: WriteError) -> Self {
        Self {
            id: id.into(),
            result: Err(error),
        }
    }

    pub fn success(&self) -> bool {
        self.result.is_ok()
    }

    /// A successful write that created the document (first revision)
    pub fn is_created(&self) -> bool {
        matches!(&self.result, Ok(rev) if rev.starts_with("1-"))
    }
}

/// The local replica
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Fetch a document by store identity
    async fn get(&self, id: &str) -> Result<Option<Document>, StoreError>;

    /// Write a batch of documents; one result per document, in order
    async fn bulk_update(&self, docs: Vec<Document>) -> Result<Vec<BulkWriteResult>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_created_vs_updated() {
        assert!(BulkWriteResult::ok("A", "1-abc").is_created());
        assert!(!BulkWriteResult::ok("A", "2-def").is_created());
        assert!(!BulkWriteResult::ok("A", "11-def").is_created());
        assert!(!BulkWriteResult::err("A", WriteError::RevisionConflict).is_created());
    }

    #[test]
    fn test_superseded() {
        assert!(WriteError::OlderThanStored.is_superseded());
        assert!(!WriteError::RevisionConflict.is_superseded());
        assert_eq!(
            WriteError::OlderThanStored.to_string(),
            "New doc with oldest dateModified."
        );
    }
}
