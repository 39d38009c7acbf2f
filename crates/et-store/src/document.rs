use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Errors surfaced by a [`DocumentStore`] operation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("revision conflict for {id}")]
    Conflict { id: String },
    #[error("document not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

impl From<StoreError> for et_core::CasError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { .. } => et_core::CasError::Conflict,
            other => et_core::CasError::Other(other.into()),
        }
    }
}

/// One entry in a change-feed batch.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub id: String,
    pub deleted: bool,
}

/// A page of the long-poll change notification stream, carrying the
/// resumption token to re-supply on the next call.
#[derive(Debug, Clone)]
pub struct ChangesBatch {
    pub events: Vec<ChangeEvent>,
    pub since: String,
}

/// The document-store contract the core consumes (spec 6).
///
/// Documents are passed as opaque JSON values; typed entity wrappers live in
/// `et-engine` and (de)serialize through this trait's `Value` boundary,
/// mirroring how the original stored arbitrary CouchDB-shaped documents.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert(&self, doc: Value) -> Result<(String, String), StoreError>;

    async fn insert_with_id(&self, id: &str, doc: Value) -> Result<(String, String), StoreError>;

    /// Returns the new revision token, or `Err(StoreError::Conflict)` if the
    /// document's `_rev` field does not match the store's current revision.
    async fn edit(&self, doc: Value) -> Result<String, StoreError>;

    async fn retrieve(&self, id: &str) -> Result<Value, StoreError>;

    /// Blocks (conceptually — a real backend long-polls) until at least one
    /// change past `since` is available, or returns an empty batch with the
    /// same `since` token on a routine long-poll timeout.
    async fn follow_changes(&self, since: Option<String>) -> Result<ChangesBatch, StoreError>;
}

#[derive(Debug, Clone)]
struct StoredDoc {
    value: Value,
    rev: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChangeLogEntry {
    id: String,
    deleted: bool,
}

struct Inner {
    docs: HashMap<String, StoredDoc>,
    change_log: Vec<ChangeLogEntry>,
    next_id: u64,
}

/// An in-memory [`DocumentStore`] used by tests and by `et-worker` when no
/// real document store is configured.
pub struct MockDocumentStore {
    inner: Mutex<Inner>,
}

impl Default for MockDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDocumentStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                docs: HashMap::new(),
                change_log: Vec::new(),
                next_id: 1,
            }),
        }
    }

    fn rev_token(rev: u64) -> String {
        format!("{rev}-mock")
    }

    fn doc_rev(doc: &Value) -> Option<&str> {
        doc.get("_rev").and_then(Value::as_str)
    }

    fn with_header(mut doc: Value, id: &str, rev: u64) -> Value {
        doc["_id"] = Value::String(id.to_string());
        doc["_rev"] = Value::String(Self::rev_token(rev));
        doc
    }

    fn record_change(inner: &mut Inner, id: &str, deleted: bool) {
        inner.change_log.push(ChangeLogEntry {
            id: id.to_string(),
            deleted,
        });
    }

    /// Marks a document as deleted (for tests exercising the changes-feed
    /// deletion-skip rule); not part of the `DocumentStore` contract.
    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("mock store mutex poisoned");
        if !inner.docs.contains_key(id) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        inner.docs.remove(id);
        Self::record_change(&mut inner, id, true);
        Ok(())
    }
}

#[async_trait::async_trait]
impl DocumentStore for MockDocumentStore {
    async fn insert(&self, doc: Value) -> Result<(String, String), StoreError> {
        let mut inner = self.inner.lock().expect("mock store mutex poisoned");
        let id = format!("doc-{}", inner.next_id);
        inner.next_id += 1;
        let stored = Self::with_header(doc, &id, 1);
        inner.docs.insert(
            id.clone(),
            StoredDoc {
                value: stored,
                rev: 1,
            },
        );
        Self::record_change(&mut inner, &id, false);
        Ok((id, Self::rev_token(1)))
    }

    async fn insert_with_id(&self, id: &str, doc: Value) -> Result<(String, String), StoreError> {
        let mut inner = self.inner.lock().expect("mock store mutex poisoned");
        let stored = Self::with_header(doc, id, 1);
        inner.docs.insert(
            id.to_string(),
            StoredDoc {
                value: stored,
                rev: 1,
            },
        );
        Self::record_change(&mut inner, id, false);
        Ok((id.to_string(), Self::rev_token(1)))
    }

    async fn edit(&self, doc: Value) -> Result<String, StoreError> {
        let id = doc
            .get("_id")
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::Io(anyhow::anyhow!("document missing _id")))?
            .to_string();
        let incoming_rev = Self::doc_rev(&doc).map(str::to_string);

        let mut inner = self.inner.lock().expect("mock store mutex poisoned");
        let current = inner
            .docs
            .get(&id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        if incoming_rev.as_deref() != Some(Self::rev_token(current.rev).as_str()) {
            return Err(StoreError::Conflict { id });
        }

        let new_rev = current.rev + 1;
        let stored = Self::with_header(doc, &id, new_rev);
        inner.docs.insert(
            id.clone(),
            StoredDoc {
                value: stored,
                rev: new_rev,
            },
        );
        Self::record_change(&mut inner, &id, false);
        Ok(Self::rev_token(new_rev))
    }

    async fn retrieve(&self, id: &str) -> Result<Value, StoreError> {
        let inner = self.inner.lock().expect("mock store mutex poisoned");
        inner
            .docs
            .get(id)
            .map(|d| d.value.clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn follow_changes(&self, since: Option<String>) -> Result<ChangesBatch, StoreError> {
        let inner = self.inner.lock().expect("mock store mutex poisoned");
        let from: usize = since.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0);
        let events = inner.change_log[from.min(inner.change_log.len())..]
            .iter()
            .map(|e| ChangeEvent {
                id: e.id.clone(),
                deleted: e.deleted,
            })
            .collect();
        Ok(ChangesBatch {
            events,
            since: inner.change_log.len().to_string(),
        })
    }
}
