//! In-memory implementation of LocalStore for testing

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use super::traits::*;
use crate::item::Document;

/// In-memory implementation of [`LocalStore`]
///
/// Mirrors the document database the workers write to in production:
/// - every write bumps a `N-<hash>` revision, `1-` meaning created
/// - updating an existing document requires its current `_rev`
/// - a document older (by `dateModified`) than the stored copy is refused
///   with [`WriteError::OlderThanStored`]
///
/// Failure injection hooks let tests simulate connectivity loss and
/// per-document refusals.
///
/// # Example
///
/// ```
/// use edge_sync::InMemoryLocalStore;
///
/// let store = InMemoryLocalStore::new();
/// assert!(store.is_empty());
/// ```
pub struct InMemoryLocalStore {
    docs: RwLock<HashMap<String, Document>>,
    unavailable: RwLock<Option<String>>,
    bulk_failures: Mutex<VecDeque<StoreError>>,
    rejections: Mutex<HashMap<String, WriteError>>,
    bulk_calls: AtomicUsize,
}

impl InMemoryLocalStore {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            unavailable: RwLock::new(None),
            bulk_failures: Mutex::new(VecDeque::new()),
            rejections: Mutex::new(HashMap::new()),
            bulk_calls: AtomicUsize::new(0),
        }
    }

    /// Seed a document directly, bypassing write checks. Returns its revision.
    pub fn insert(&self, mut doc: Document) -> String {
        let key = doc.store_id.clone().unwrap_or_else(|| doc.id.clone());
        let mut docs = self.docs.write();
        let rev = next_rev(docs.get(&key).and_then(|d| d.store_rev.as_deref()));
        doc.store_id = Some(key.clone());
        doc.store_rev = Some(rev.clone());
        docs.insert(key, doc);
        rev
    }

    /// Stored copy of a document
    pub fn document(&self, id: &str) -> Option<Document> {
        self.docs.read().get(id).cloned()
    }

    /// Number of stored documents
    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }

    /// Number of bulk writes attempted
    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    /// Make every call fail with [`StoreError::Unavailable`] until reset with `None`
    pub fn set_unavailable(&self, reason: Option<&str>) {
        *self.unavailable.write() = reason.map(str::to_string);
    }

    /// Make the next bulk write fail as a whole
    pub fn fail_next_bulk(&self, error: StoreError) {
        self.bulk_failures.lock().push_back(error);
    }

    /// Refuse the next write of document `id`
    pub fn reject_next_write(&self, id: &str, error: WriteError) {
        self.rejections.lock().insert(id.to_string(), error);
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.docs.write().clear();
    }

    fn check_available(&self) -> Result<(), StoreError> {
        match self.unavailable.read().as_ref() {
            Some(reason) => Err(StoreError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }

    fn write_one(docs: &mut HashMap<String, Document>, mut doc: Document) -> BulkWriteResult {
        let key = doc.store_id.clone().unwrap_or_else(|| doc.id.clone());

        let current_rev = match docs.get(&key) {
            Some(existing) => {
                if let (Some(stored), Some(incoming)) = (existing.date_modified, doc.date_modified)
                {
                    if incoming < stored {
                        return BulkWriteResult::err(key, WriteError::OlderThanStored);
                    }
                }
                if doc.store_rev != existing.store_rev {
                    return BulkWriteResult::err(key, WriteError::RevisionConflict);
                }
                existing.store_rev.clone()
            }
            None if doc.store_rev.is_some() => {
                return BulkWriteResult::err(key, WriteError::RevisionConflict);
            }
            None => None,
        };

        let rev = next_rev(current_rev.as_deref());
        doc.store_id = Some(key.clone());
        doc.store_rev = Some(rev.clone());
        docs.insert(key.clone(), doc);
        BulkWriteResult::ok(key, rev)
    }
}

impl Default for InMemoryLocalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalStore for InMemoryLocalStore {
    async fn get(&self, id: &str) -> Result<Option<Document>, StoreError> {
        self.check_available()?;
        Ok(self.docs.read().get(id).cloned())
    }

    async fn bulk_update(&self, docs: Vec<Document>) -> Result<Vec<BulkWriteResult>, StoreError> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        if let Some(error) = self.bulk_failures.lock().pop_front() {
            return Err(error);
        }

        let mut stored = self.docs.write();
        let mut rejections = self.rejections.lock();
        let results = docs
            .into_iter()
            .map(|doc| {
                let key = doc.store_id.clone().unwrap_or_else(|| doc.id.clone());
                match rejections.remove(&key) {
                    Some(error) => BulkWriteResult::err(key, error),
                    None => Self::write_one(&mut stored, doc),
                }
            })
            .collect();
        Ok(results)
    }
}

/// Revision following `current` ("3-..." -> "4-<hash>")
fn next_rev(current: Option<&str>) -> String {
    let n = current
        .and_then(|rev| rev.split_once('-'))
        .and_then(|(n, _)| n.parse::<u64>().ok())
        .unwrap_or(0);
    format!("{}-{}", n + 1, Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[tokio::test]
    async fn test_create_then_update() {
        let store = InMemoryLocalStore::new();
        let doc = Document::new("A").with_date_modified(ts("2020-01-01T00:00:00Z"));

        let results = store.bulk_update(vec![doc.clone()]).await.unwrap();
        assert!(results[0].is_created());

        let mut update = store.get("A").await.unwrap().unwrap();
        update.date_modified = Some(ts("2020-01-02T00:00:00Z"));
        let results = store.bulk_update(vec![update]).await.unwrap();
        assert!(results[0].success());
        assert!(!results[0].is_created());
        assert!(store
            .document("A")
            .unwrap()
            .store_rev
            .unwrap()
            .starts_with("2-"));
    }

    #[tokio::test]
    async fn test_older_document_is_refused() {
        let store = InMemoryLocalStore::new();
        let rev = store.insert(Document::new("A").with_date_modified(ts("2020-01-02T00:00:00Z")));

        let mut older = Document::new("A").with_date_modified(ts("2020-01-01T00:00:00Z"));
        older.store_rev = Some(rev);
        let results = store.bulk_update(vec![older]).await.unwrap();

        assert_eq!(results[0].result, Err(WriteError::OlderThanStored));
    }

    #[tokio::test]
    async fn test_missing_rev_conflicts() {
        let store = InMemoryLocalStore::new();
        store.insert(Document::new("A"));

        let results = store.bulk_update(vec![Document::new("A")]).await.unwrap();
        assert_eq!(results[0].result, Err(WriteError::RevisionConflict));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = InMemoryLocalStore::new();

        store.fail_next_bulk(StoreError::Unavailable("connection reset".into()));
        assert!(store.bulk_update(vec![Document::new("A")]).await.is_err());
        assert!(store.is_empty());

        store.reject_next_write("B", WriteError::Rejected("forbidden".into()));
        let results = store
            .bulk_update(vec![Document::new("A"), Document::new("B")])
            .await
            .unwrap();
        assert!(results[0].success());
        assert_eq!(
            results[1].result,
            Err(WriteError::Rejected("forbidden".into()))
        );

        store.set_unavailable(Some("down"));
        assert!(matches!(
            store.get("A").await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_unavailable(None);
        assert!(store.get("A").await.unwrap().is_some());
        assert_eq!(store.bulk_calls(), 2);
    }

    #[test]
    fn test_next_rev() {
        assert!(next_rev(None).starts_with("1-"));
        assert!(next_rev(Some("9-abc")).starts_with("10-"));
    }
}
