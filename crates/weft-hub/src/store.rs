//! Document store seam.
//!
//! The CRDT algebra is an external collaborator: the hub hands it opaque
//! state vectors and updates and never inspects their structure. The store
//! is the sole writer for persisted state per document and serializes its
//! own transactions.
//!
//! [`MemoryStore`] is a reference implementation whose "CRDT" is an
//! append-only update log with the log length as its state vector. It is
//! enough to drive the sync handshake end-to-end in tests and demos.

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::Mutex;

use weft_proto::varint::{Reader, put_varbytes, put_varuint};
use weft_proto::{Context, is_empty_state_vector, is_empty_update};

/// Errors surfaced from the document store
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The document does not exist
    #[error("document not found: {0}")]
    NotFound(String),

    /// Backend failure
    #[error("storage backend failure: {0}")]
    Backend(Cow<'static, str>),
}

/// Reply to sync step 1: the diff and the store's own state vector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReply {
    /// Update bringing the requester up to date
    pub update: Vec<u8>,
    /// The store's current state vector
    pub state_vector: Vec<u8>,
}

/// Document metadata, including optional size thresholds
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentMetadata {
    /// Current persisted size
    pub size_bytes: Option<u64>,
    /// Soft threshold: crossing it emits `document-size-warning`
    pub size_warning_threshold: Option<u64>,
    /// Hard limit: crossing it emits `document-size-limit-exceeded`
    pub size_limit: Option<u64>,
}

/// A stored document with its content
#[derive(Debug, Clone)]
pub struct DocumentContent {
    /// Metadata snapshot
    pub metadata: DocumentMetadata,
    /// Opaque content bytes
    pub content: Vec<u8>,
}

/// Closure run inside a store transaction
pub type TransactionFn =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<(), StoreError>> + Send>;

/// CRDT document store collaborator
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Compute the diff against a peer state vector, and return it together
    /// with this store's own state vector
    async fn handle_sync_step_1(
        &self,
        document_id: &str,
        state_vector: &[u8],
    ) -> Result<SyncReply, StoreError>;

    /// Merge a step-2 diff
    async fn handle_sync_step_2(&self, document_id: &str, update: &[u8])
    -> Result<(), StoreError>;

    /// Merge an incremental update
    async fn handle_update(&self, document_id: &str, update: &[u8]) -> Result<(), StoreError>;

    /// Fetch a document with content; `None` when it does not exist
    async fn get_document(&self, document_id: &str)
    -> Result<Option<DocumentContent>, StoreError>;

    /// Fetch document metadata
    async fn get_document_metadata(&self, document_id: &str)
    -> Result<DocumentMetadata, StoreError>;

    /// Run `f` inside the store's per-document transaction lock
    async fn with_transaction(&self, document_id: &str, f: TransactionFn)
    -> Result<(), StoreError>;
}

/// Creates or locates the store backing a document
///
/// The registry calls this when the first message for an unknown document
/// arrives; the connection context lets implementations pick per-room or
/// per-tenant backends.
#[async_trait]
pub trait StorageFactory: Send + Sync {
    /// Resolve the store for `document` (raw name) / `document_id` (namespaced)
    async fn get_storage(
        &self,
        context: &Context,
        document: &str,
        document_id: &str,
    ) -> Result<Arc<dyn DocumentStore>, StoreError>;
}

/// Factory handing every document the same shared store
pub struct SharedStorageFactory {
    store: Arc<dyn DocumentStore>,
}

impl SharedStorageFactory {
    /// Wrap a single store
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StorageFactory for SharedStorageFactory {
    async fn get_storage(
        &self,
        _context: &Context,
        _document: &str,
        _document_id: &str,
    ) -> Result<Arc<dyn DocumentStore>, StoreError> {
        Ok(Arc::clone(&self.store))
    }
}

#[derive(Debug, Default)]
struct MemoryDoc {
    updates: Vec<Vec<u8>>,
}

impl MemoryDoc {
    fn size_bytes(&self) -> u64 {
        self.updates.iter().map(|u| u.len() as u64).sum()
    }
}

/// In-memory reference store.
///
/// The state vector is the varuint-encoded count of merged updates; the
/// step-1 diff is the varbytes-framed tail of updates the requester has not
/// seen. Opaque to callers, observable in tests.
#[derive(Default)]
pub struct MemoryStore {
    docs: DashMap<String, MemoryDoc>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    size_warning_threshold: Option<u64>,
    size_limit: Option<u64>,
}

impl MemoryStore {
    /// Empty store without size thresholds
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty store that reports the given thresholds in metadata
    #[must_use]
    pub fn with_thresholds(size_warning_threshold: Option<u64>, size_limit: Option<u64>) -> Self {
        Self {
            size_warning_threshold,
            size_limit,
            ..Self::default()
        }
    }

    /// Wrap in an `Arc<dyn DocumentStore>`
    #[must_use]
    pub fn shared() -> Arc<dyn DocumentStore> {
        Arc::new(Self::new())
    }

    /// Number of updates merged for `document_id`
    #[must_use]
    pub fn update_count(&self, document_id: &str) -> usize {
        self.docs.get(document_id).map_or(0, |d| d.updates.len())
    }

    fn encode_state_vector(count: u64) -> Vec<u8> {
        let mut sv = Vec::new();
        put_varuint(&mut sv, count);
        sv
    }

    fn decode_state_vector(sv: &[u8]) -> u64 {
        if is_empty_state_vector(sv) {
            return 0;
        }
        Reader::new(sv).read_varuint().unwrap_or(0)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn handle_sync_step_1(
        &self,
        document_id: &str,
        state_vector: &[u8],
    ) -> Result<SyncReply, StoreError> {
        let seen = Self::decode_state_vector(state_vector) as usize;
        let doc = self.docs.entry(document_id.to_owned()).or_default();

        let missing = doc.updates.get(seen..).unwrap_or(&[]);
        let mut update = Vec::new();
        put_varuint(&mut update, missing.len() as u64);
        for item in missing {
            put_varbytes(&mut update, item);
        }

        Ok(SyncReply {
            update,
            state_vector: Self::encode_state_vector(doc.updates.len() as u64),
        })
    }

    async fn handle_sync_step_2(
        &self,
        document_id: &str,
        update: &[u8],
    ) -> Result<(), StoreError> {
        self.handle_update(document_id, update).await
    }

    async fn handle_update(&self, document_id: &str, update: &[u8]) -> Result<(), StoreError> {
        if is_empty_update(update) {
            return Ok(());
        }
        self.docs
            .entry(document_id.to_owned())
            .or_default()
            .updates
            .push(update.to_vec());
        Ok(())
    }

    async fn get_document(
        &self,
        document_id: &str,
    ) -> Result<Option<DocumentContent>, StoreError> {
        let Some(doc) = self.docs.get(document_id) else {
            return Ok(None);
        };
        Ok(Some(DocumentContent {
            metadata: DocumentMetadata {
                size_bytes: Some(doc.size_bytes()),
                size_warning_threshold: self.size_warning_threshold,
                size_limit: self.size_limit,
            },
            content: doc.updates.concat(),
        }))
    }

    async fn get_document_metadata(
        &self,
        document_id: &str,
    ) -> Result<DocumentMetadata, StoreError> {
        let size_bytes = self.docs.get(document_id).map(|d| d.size_bytes());
        Ok(DocumentMetadata {
            size_bytes,
            size_warning_threshold: self.size_warning_threshold,
            size_limit: self.size_limit,
        })
    }

    async fn with_transaction(
        &self,
        document_id: &str,
        f: TransactionFn,
    ) -> Result<(), StoreError> {
        let lock = self
            .locks
            .entry(document_id.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;
        f().await
    }
}
