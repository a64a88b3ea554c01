//! Document store boundary.
//!
//! Indexed records and checkpoints are JSON documents keyed by string id, each
//! optionally carrying named binary attachments (raw header / transaction
//! bytes, serialized locators). Implementations must be safe to share between
//! concurrently running write jobs.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::IndexerError;

/// A JSON document addressed by id.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub body: serde_json::Value,
}

impl Document {
    pub fn new(id: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            body,
        }
    }

    /// Serialize a record into a document.
    pub fn from_record<T: Serialize>(id: impl Into<String>, record: &T) -> Result<Self, IndexerError> {
        Ok(Self::new(id, serde_json::to_value(record)?))
    }

    /// Deserialize the body back into a record.
    pub fn to_record<T: DeserializeOwned>(&self) -> Result<T, IndexerError> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// A named binary blob attached to a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub document_id: String,
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Attachments queued for a single write, mirroring one store session.
///
/// Queuing a second blob under the same `(document, name)` pair is rejected
/// with [`IndexerError::DuplicateAttachment`].
#[derive(Debug, Default)]
pub struct AttachmentBatch {
    attachments: Vec<Attachment>,
    keys: HashSet<(String, String)>,
}

impl AttachmentBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        document_id: impl Into<String>,
        name: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Result<(), IndexerError> {
        let document_id = document_id.into();
        let name = name.into();
        if !self.keys.insert((document_id.clone(), name.clone())) {
            return Err(IndexerError::DuplicateAttachment {
                id: document_id,
                name,
            });
        }
        self.attachments.push(Attachment {
            document_id,
            name,
            bytes,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.attachments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attachments.is_empty()
    }

    pub fn into_inner(self) -> Vec<Attachment> {
        self.attachments
    }
}

/// Trait implemented by document store backends.
///
/// Implementations: [`MemoryDocumentStore`] and the SQLite backend in
/// `chainfeed-storage`.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Load a document by id.
    async fn load(&self, id: &str) -> Result<Option<Document>, IndexerError>;

    /// Insert or replace a single document.
    async fn store(&self, document: Document) -> Result<(), IndexerError>;

    /// Delete a document and its attachments. Returns `false` if it was absent.
    async fn delete(&self, id: &str) -> Result<bool, IndexerError>;

    /// Insert or replace many documents in one round trip.
    async fn bulk_insert(&self, documents: Vec<Document>) -> Result<(), IndexerError>;

    /// Persist a batch of attachments. Every target document must exist.
    async fn store_attachments(&self, batch: AttachmentBatch) -> Result<(), IndexerError>;

    /// Upsert `document` and persist `batch` as one atomic write: either both
    /// land or neither does. Attachments may target `document` itself.
    async fn store_with_attachments(
        &self,
        document: Document,
        batch: AttachmentBatch,
    ) -> Result<(), IndexerError>;

    /// Read an attachment, `None` if the document or attachment is absent.
    async fn get_attachment(&self, id: &str, name: &str) -> Result<Option<Vec<u8>>, IndexerError>;

    /// All documents whose id starts with `prefix`, ordered by id.
    async fn load_starting_with(&self, prefix: &str) -> Result<Vec<Document>, IndexerError>;
}

// ─── In-memory store ──────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryState {
    documents: BTreeMap<String, serde_json::Value>,
    attachments: BTreeMap<(String, String), Vec<u8>>,
}

/// In-memory document store for tests and ephemeral runs.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct MemoryDocumentStore {
    state: Mutex<MemoryState>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents.
    pub fn document_count(&self) -> usize {
        self.lock().documents.len()
    }

    /// Number of stored attachments.
    pub fn attachment_count(&self) -> usize {
        self.lock().attachments.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn load(&self, id: &str) -> Result<Option<Document>, IndexerError> {
        Ok(self
            .lock()
            .documents
            .get(id)
            .map(|body| Document::new(id, body.clone())))
    }

    async fn store(&self, document: Document) -> Result<(), IndexerError> {
        self.lock().documents.insert(document.id, document.body);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, IndexerError> {
        let mut state = self.lock();
        let existed = state.documents.remove(id).is_some();
        state.attachments.retain(|(doc, _), _| doc != id);
        Ok(existed)
    }

    async fn bulk_insert(&self, documents: Vec<Document>) -> Result<(), IndexerError> {
        let mut state = self.lock();
        for doc in documents {
            state.documents.insert(doc.id, doc.body);
        }
        Ok(())
    }

    async fn store_attachments(&self, batch: AttachmentBatch) -> Result<(), IndexerError> {
        let mut state = self.lock();
        let attachments = batch.into_inner();
        if let Some(missing) = attachments
            .iter()
            .find(|a| !state.documents.contains_key(&a.document_id))
        {
            return Err(IndexerError::NotFound {
                id: missing.document_id.clone(),
            });
        }
        for a in attachments {
            state.attachments.insert((a.document_id, a.name), a.bytes);
        }
        Ok(())
    }

    async fn store_with_attachments(
        &self,
        document: Document,
        batch: AttachmentBatch,
    ) -> Result<(), IndexerError> {
        let mut state = self.lock();
        let attachments = batch.into_inner();
        if let Some(missing) = attachments.iter().find(|a| {
            a.document_id != document.id && !state.documents.contains_key(&a.document_id)
        }) {
            return Err(IndexerError::NotFound {
                id: missing.document_id.clone(),
            });
        }
        state.documents.insert(document.id, document.body);
        for a in attachments {
            state.attachments.insert((a.document_id, a.name), a.bytes);
        }
        Ok(())
    }

    async fn get_attachment(&self, id: &str, name: &str) -> Result<Option<Vec<u8>>, IndexerError> {
        Ok(self
            .lock()
            .attachments
            .get(&(id.to_string(), name.to_string()))
            .cloned())
    }

    async fn load_starting_with(&self, prefix: &str) -> Result<Vec<Document>, IndexerError> {
        Ok(self
            .lock()
            .documents
            .range(prefix.to_string()..)
            .take_while(|(id, _)| id.starts_with(prefix))
            .map(|(id, body)| Document::new(id.clone(), body.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn attachment_batch_rejects_duplicates() {
        let mut batch = AttachmentBatch::new();
        batch.add("tx:1", "transaction", vec![1]).unwrap();
        batch.add("tx:1", "other", vec![2]).unwrap();
        let err = batch.add("tx:1", "transaction", vec![3]).unwrap_err();
        assert!(err.is_duplicate_attachment());
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn document_roundtrip_and_delete() {
        let store = MemoryDocumentStore::new();
        store
            .store(Document::new("blk:1", json!({ "height": 1 })))
            .await
            .unwrap();

        let doc = store.load("blk:1").await.unwrap().unwrap();
        assert_eq!(doc.body["height"], 1);

        assert!(store.delete("blk:1").await.unwrap());
        assert!(!store.delete("blk:1").await.unwrap());
        assert!(store.load("blk:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn document_with_attachments_is_all_or_nothing() {
        let store = MemoryDocumentStore::new();
        let mut batch = AttachmentBatch::new();
        batch.add("cp", "locator", vec![1]).unwrap();
        batch.add("blk:missing", "header", vec![2]).unwrap();
        let err = store
            .store_with_attachments(Document::new("cp", json!({ "v": 1 })), batch)
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::NotFound { .. }));
        assert!(store.load("cp").await.unwrap().is_none());
        assert_eq!(store.attachment_count(), 0);

        let mut batch = AttachmentBatch::new();
        batch.add("cp", "locator", vec![1]).unwrap();
        store
            .store_with_attachments(Document::new("cp", json!({ "v": 2 })), batch)
            .await
            .unwrap();
        assert_eq!(store.load("cp").await.unwrap().unwrap().body["v"], 2);
        assert_eq!(store.get_attachment("cp", "locator").await.unwrap(), Some(vec![1]));
    }

    #[tokio::test]
    async fn attachments_require_document() {
        let store = MemoryDocumentStore::new();
        let mut batch = AttachmentBatch::new();
        batch.add("blk:missing", "header", vec![0; 80]).unwrap();
        let err = store.store_attachments(batch).await.unwrap_err();
        assert!(matches!(err, IndexerError::NotFound { .. }));
        assert_eq!(store.attachment_count(), 0);
    }

    #[tokio::test]
    async fn attachments_removed_with_document() {
        let store = MemoryDocumentStore::new();
        store
            .bulk_insert(vec![
                Document::new("blk:1", json!({})),
                Document::new("blk:2", json!({})),
            ])
            .await
            .unwrap();
        let mut batch = AttachmentBatch::new();
        batch.add("blk:1", "header", vec![1]).unwrap();
        batch.add("blk:2", "header", vec![2]).unwrap();
        store.store_attachments(batch).await.unwrap();

        assert_eq!(store.get_attachment("blk:2", "header").await.unwrap(), Some(vec![2]));
        store.delete("blk:1").await.unwrap();
        assert_eq!(store.attachment_count(), 1);
        assert!(store.get_attachment("blk:1", "header").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn prefix_listing_is_scoped() {
        let store = MemoryDocumentStore::new();
        for id in ["Main/Checkpoint/a", "Main/Checkpoint/b", "Test/Checkpoint/a", "blk:1"] {
            store.store(Document::new(id, json!({}))).await.unwrap();
        }
        let docs = store.load_starting_with("Main/Checkpoint/").await.unwrap();
        let ids: Vec<_> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["Main/Checkpoint/a", "Main/Checkpoint/b"]);
    }
}
