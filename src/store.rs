// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistence behind the server: a relational store for snapshots and the
//! operation log, and a blob store for the latest-known file content.
//!
//! The concrete stores stay behind the [`RelationalStore`] and
//! [`BlobClient`] traits. The relational implementation is expected to
//! provide two tables:
//!
//! - `ot_documents(id PK, bucket_id, file_path, current_revision, content,
//!   created_at, updated_at)`
//! - `ot_operations(id PK, document_id, revision, author_id, operations,
//!   created_at)` with a uniqueness constraint and an index on
//!   `(document_id, revision)`
//!
//! and translate its error conditions: a missing row becomes `Ok(None)`, a
//! missing table becomes [`StoreError::SchemaMissing`], and a uniqueness
//! violation on `(document_id, revision)` becomes [`StoreError::Conflict`].

use crate::document::{BucketInfo, DocumentId};
use async_trait::async_trait;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("an operation with this revision is already logged")]
    Conflict,
    #[error("relational schema is not installed")]
    SchemaMissing,
}

/// The `ot_documents` row for one document.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub id: DocumentId,
    pub bucket_id: String,
    pub file_path: String,
    pub revision: u64,
    pub content: String,
    pub updated_at: OffsetDateTime,
}

/// One `ot_operations` row. Append-only; revisions per document are
/// contiguous starting at 1.
#[derive(Clone, Debug)]
pub struct LogEntry {
    pub document_id: DocumentId,
    pub revision: u64,
    pub author_id: String,
    pub operations: serde_json::Value,
    pub created_at: OffsetDateTime,
}

#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn load_snapshot(&self, id: &DocumentId) -> Result<Option<Snapshot>, StoreError>;
    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), StoreError>;
    async fn append_operation(&self, entry: LogEntry) -> Result<(), StoreError>;
    /// Entries with `revision > revision`, ordered by revision ascending.
    async fn operations_since(
        &self,
        id: &DocumentId,
        revision: u64,
    ) -> Result<Vec<LogEntry>, StoreError>;
    async fn clear_operations(&self, id: &DocumentId) -> Result<(), StoreError>;
    /// Drops entries older than the most recent `keep`; noop if there are
    /// no more than `keep` revisions.
    async fn compact(&self, id: &DocumentId, keep: u64) -> Result<(), StoreError>;
    /// Removes the snapshot row and all log entries.
    async fn delete_document(&self, id: &DocumentId) -> Result<(), StoreError>;
}

/// A blob-store client for one region.
#[async_trait]
pub trait BlobClient: Send + Sync {
    /// `Ok(None)` when the key does not exist; that is not a failure.
    async fn read(&self, bucket: &str, key: &str) -> Result<Option<String>, StoreError>;
    async fn write(
        &self,
        bucket: &str,
        key: &str,
        content: &str,
        content_type: &str,
    ) -> Result<(), StoreError>;
}

/// Builds a [`BlobClient`] for a region. Clients are memoized process-wide
/// by [`Persistence`], so this runs once per region.
pub trait BlobClientFactory: Send + Sync {
    fn client_for(&self, region: &str) -> Arc<dyn BlobClient>;
}

/// The persistence adapter the server talks to.
///
/// Wraps the relational store with payload sanitization and with a degraded
/// memory-only mode for deployments where the schema is not installed, and
/// routes blob traffic through a per-region client cache.
#[derive(Clone)]
pub struct Persistence {
    inner: Arc<PersistenceInner>,
}

struct PersistenceInner {
    store: Arc<dyn RelationalStore>,
    blob_factory: Arc<dyn BlobClientFactory>,
    blob_clients: RwLock<HashMap<String, Arc<dyn BlobClient>>>,
    schema_missing: AtomicBool,
}

impl Persistence {
    pub fn new(
        store: Arc<dyn RelationalStore>,
        blob_factory: Arc<dyn BlobClientFactory>,
    ) -> Self {
        Self {
            inner: Arc::new(PersistenceInner {
                store,
                blob_factory,
                blob_clients: RwLock::new(HashMap::new()),
                schema_missing: AtomicBool::new(false),
            }),
        }
    }

    /// A fully in-memory stack, for tests and memory-only deployments.
    pub fn in_memory() -> (Self, Arc<MemoryStore>, Arc<MemoryBlobStore>) {
        let store = Arc::new(MemoryStore::default());
        let blobs = Arc::new(MemoryBlobStore::default());
        let persistence = Self::new(
            store.clone(),
            Arc::new(MemoryBlobFactory::new(blobs.clone())),
        );
        (persistence, store, blobs)
    }

    pub fn is_degraded(&self) -> bool {
        self.inner.schema_missing.load(Ordering::Relaxed)
    }

    fn note_missing_schema(&self) {
        if !self.inner.schema_missing.swap(true, Ordering::Relaxed) {
            warn!(
                "Relational schema for documents is not installed; \
                 continuing in memory-only mode without snapshots or an operation log."
            );
        }
    }

    /// Swallows `SchemaMissing`, switching to degraded mode.
    fn degrading<T>(&self, result: Result<T, StoreError>, fallback: T) -> Result<T, StoreError> {
        match result {
            Err(StoreError::SchemaMissing) => {
                self.note_missing_schema();
                Ok(fallback)
            }
            other => other,
        }
    }

    pub async fn load_snapshot(&self, id: &DocumentId) -> Result<Option<Snapshot>, StoreError> {
        if self.is_degraded() {
            return Ok(None);
        }
        let result = self.inner.store.load_snapshot(id).await;
        self.degrading(result, None)
    }

    pub async fn save_snapshot(
        &self,
        id: &DocumentId,
        bucket_id: &str,
        file_path: &str,
        revision: u64,
        content: &str,
    ) -> Result<(), StoreError> {
        if self.is_degraded() {
            return Ok(());
        }
        let snapshot = Snapshot {
            id: id.clone(),
            bucket_id: bucket_id.to_owned(),
            file_path: file_path.to_owned(),
            revision,
            content: sanitize_text(content).into_owned(),
            updated_at: OffsetDateTime::now_utc(),
        };
        let result = self.inner.store.save_snapshot(snapshot).await;
        self.degrading(result, ())
    }

    pub async fn append_operation(
        &self,
        id: &DocumentId,
        revision: u64,
        author_id: &str,
        operations: serde_json::Value,
    ) -> Result<(), StoreError> {
        if self.is_degraded() {
            return Ok(());
        }
        let entry = LogEntry {
            document_id: id.clone(),
            revision,
            author_id: author_id.to_owned(),
            operations: sanitize_json(operations),
            created_at: OffsetDateTime::now_utc(),
        };
        let result = self.inner.store.append_operation(entry).await;
        self.degrading(result, ())
    }

    pub async fn operations_since(
        &self,
        id: &DocumentId,
        revision: u64,
    ) -> Result<Vec<LogEntry>, StoreError> {
        if self.is_degraded() {
            return Ok(Vec::new());
        }
        let result = self.inner.store.operations_since(id, revision).await;
        self.degrading(result, Vec::new())
    }

    pub async fn clear_operations(&self, id: &DocumentId) -> Result<(), StoreError> {
        if self.is_degraded() {
            return Ok(());
        }
        let result = self.inner.store.clear_operations(id).await;
        self.degrading(result, ())
    }

    pub async fn compact(&self, id: &DocumentId, keep: u64) -> Result<(), StoreError> {
        if self.is_degraded() {
            return Ok(());
        }
        let result = self.inner.store.compact(id, keep).await;
        self.degrading(result, ())
    }

    pub async fn delete_document(&self, id: &DocumentId) -> Result<(), StoreError> {
        if self.is_degraded() {
            return Ok(());
        }
        let result = self.inner.store.delete_document(id).await;
        self.degrading(result, ())
    }

    fn blob_client(&self, region: &str) -> Arc<dyn BlobClient> {
        if let Some(client) = self
            .inner
            .blob_clients
            .read()
            .expect("blob client cache lock poisoned")
            .get(region)
        {
            return client.clone();
        }
        let mut clients = self
            .inner
            .blob_clients
            .write()
            .expect("blob client cache lock poisoned");
        clients
            .entry(region.to_owned())
            .or_insert_with(|| self.inner.blob_factory.client_for(region))
            .clone()
    }

    pub async fn read_blob(
        &self,
        bucket_info: &BucketInfo,
        path: &str,
    ) -> Result<Option<String>, StoreError> {
        self.blob_client(&bucket_info.region)
            .read(&bucket_info.bucket_name, path)
            .await
    }

    pub async fn write_blob(
        &self,
        bucket_info: &BucketInfo,
        path: &str,
        content: &str,
    ) -> Result<(), StoreError> {
        self.blob_client(&bucket_info.region)
            .write(
                &bucket_info.bucket_name,
                path,
                content,
                content_type_for(path),
            )
            .await
    }
}

/// Strips U+0000, which some relational stores reject in text columns.
/// The other half of the sanitization contract, replacing lone surrogate
/// code units, is static here: a `String` is always valid UTF-8.
fn sanitize_text(content: &str) -> Cow<'_, str> {
    if content.contains('\u{0}') {
        Cow::Owned(content.replace('\u{0}', ""))
    } else {
        Cow::Borrowed(content)
    }
}

fn sanitize_json(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => {
            serde_json::Value::String(sanitize_text(&s).into_owned())
        }
        serde_json::Value::Array(elements) => {
            serde_json::Value::Array(elements.into_iter().map(sanitize_json).collect())
        }
        serde_json::Value::Object(members) => serde_json::Value::Object(
            members
                .into_iter()
                .map(|(key, member)| (key, sanitize_json(member)))
                .collect(),
        ),
        other => other,
    }
}

fn content_type_for(path: &str) -> &'static str {
    match path.rsplit('.').next() {
        Some("md") => "text/markdown",
        Some("html") => "text/html",
        Some("json") => "application/json",
        Some("csv") => "text/csv",
        _ => "text/plain",
    }
}

/// Relational store backed by process memory. Enforces the same
/// `(document_id, revision)` uniqueness the real schema does.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    snapshots: HashMap<DocumentId, Snapshot>,
    operations: HashMap<DocumentId, Vec<LogEntry>>,
}

impl MemoryStore {
    pub fn snapshot(&self, id: &DocumentId) -> Option<Snapshot> {
        self.lock().snapshots.get(id).cloned()
    }

    pub fn operation_count(&self, id: &DocumentId) -> usize {
        self.lock().operations.get(id).map_or(0, Vec::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().expect("memory store lock poisoned")
    }
}

#[async_trait]
impl RelationalStore for MemoryStore {
    async fn load_snapshot(&self, id: &DocumentId) -> Result<Option<Snapshot>, StoreError> {
        Ok(self.lock().snapshots.get(id).cloned())
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        self.lock().snapshots.insert(snapshot.id.clone(), snapshot);
        Ok(())
    }

    async fn append_operation(&self, entry: LogEntry) -> Result<(), StoreError> {
        let mut state = self.lock();
        let log = state.operations.entry(entry.document_id.clone()).or_default();
        if log.iter().any(|existing| existing.revision == entry.revision) {
            return Err(StoreError::Conflict);
        }
        log.push(entry);
        log.sort_by_key(|existing| existing.revision);
        Ok(())
    }

    async fn operations_since(
        &self,
        id: &DocumentId,
        revision: u64,
    ) -> Result<Vec<LogEntry>, StoreError> {
        Ok(self
            .lock()
            .operations
            .get(id)
            .map(|log| {
                log.iter()
                    .filter(|entry| entry.revision > revision)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn clear_operations(&self, id: &DocumentId) -> Result<(), StoreError> {
        self.lock().operations.remove(id);
        Ok(())
    }

    async fn compact(&self, id: &DocumentId, keep: u64) -> Result<(), StoreError> {
        let mut state = self.lock();
        if let Some(log) = state.operations.get_mut(id) {
            let current = log.iter().map(|entry| entry.revision).max().unwrap_or(0);
            if current > keep {
                log.retain(|entry| entry.revision >= current - keep);
            }
        }
        Ok(())
    }

    async fn delete_document(&self, id: &DocumentId) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.snapshots.remove(id);
        state.operations.remove(id);
        Ok(())
    }
}

/// Blob store backed by process memory, keyed by `(bucket, key)`.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<(String, String), String>>,
}

impl MemoryBlobStore {
    pub fn get(&self, bucket: &str, key: &str) -> Option<String> {
        self.blobs
            .lock()
            .expect("blob store lock poisoned")
            .get(&(bucket.to_owned(), key.to_owned()))
            .cloned()
    }

    pub fn put(&self, bucket: &str, key: &str, content: &str) {
        self.blobs
            .lock()
            .expect("blob store lock poisoned")
            .insert((bucket.to_owned(), key.to_owned()), content.to_owned());
    }
}

#[async_trait]
impl BlobClient for MemoryBlobStore {
    async fn read(&self, bucket: &str, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.get(bucket, key))
    }

    async fn write(
        &self,
        bucket: &str,
        key: &str,
        content: &str,
        _content_type: &str,
    ) -> Result<(), StoreError> {
        self.put(bucket, key, content);
        Ok(())
    }
}

/// Hands the same in-memory blob store to every region.
pub struct MemoryBlobFactory {
    blobs: Arc<MemoryBlobStore>,
}

impl MemoryBlobFactory {
    pub fn new(blobs: Arc<MemoryBlobStore>) -> Self {
        Self { blobs }
    }
}

impl BlobClientFactory for MemoryBlobFactory {
    fn client_for(&self, _region: &str) -> Arc<dyn BlobClient> {
        self.blobs.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(id: &DocumentId, revision: u64) -> LogEntry {
        LogEntry {
            document_id: id.clone(),
            revision,
            author_id: "u1".into(),
            operations: serde_json::json!([1]),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    mod memory_store {
        use super::*;
        use pretty_assertions::assert_eq;

        #[tokio::test]
        async fn duplicate_revision_conflicts() {
            let store = MemoryStore::default();
            let id = DocumentId::new("b", "f");
            store.append_operation(entry(&id, 1)).await.unwrap();
            assert!(matches!(
                store.append_operation(entry(&id, 1)).await,
                Err(StoreError::Conflict)
            ));
        }

        #[tokio::test]
        async fn operations_since_is_exclusive_and_ordered() {
            let store = MemoryStore::default();
            let id = DocumentId::new("b", "f");
            for revision in 1..=4 {
                store.append_operation(entry(&id, revision)).await.unwrap();
            }
            let since = store.operations_since(&id, 2).await.unwrap();
            let revisions: Vec<u64> = since.iter().map(|e| e.revision).collect();
            assert_eq!(revisions, vec![3, 4]);
        }

        #[tokio::test]
        async fn compact_keeps_the_most_recent_window() {
            let store = MemoryStore::default();
            let id = DocumentId::new("b", "f");
            for revision in 1..=10 {
                store.append_operation(entry(&id, revision)).await.unwrap();
            }
            store.compact(&id, 3).await.unwrap();
            let remaining = store.operations_since(&id, 0).await.unwrap();
            let revisions: Vec<u64> = remaining.iter().map(|e| e.revision).collect();
            assert_eq!(revisions, vec![7, 8, 9, 10]);
        }

        #[tokio::test]
        async fn compact_below_window_is_a_noop() {
            let store = MemoryStore::default();
            let id = DocumentId::new("b", "f");
            for revision in 1..=3 {
                store.append_operation(entry(&id, revision)).await.unwrap();
            }
            store.compact(&id, 5).await.unwrap();
            assert_eq!(store.operation_count(&id), 3);
        }
    }

    mod adapter {
        use super::*;
        use pretty_assertions::assert_eq;

        /// A store whose schema was never installed.
        struct SchemalessStore;

        #[async_trait]
        impl RelationalStore for SchemalessStore {
            async fn load_snapshot(
                &self,
                _id: &DocumentId,
            ) -> Result<Option<Snapshot>, StoreError> {
                Err(StoreError::SchemaMissing)
            }
            async fn save_snapshot(&self, _snapshot: Snapshot) -> Result<(), StoreError> {
                Err(StoreError::SchemaMissing)
            }
            async fn append_operation(&self, _entry: LogEntry) -> Result<(), StoreError> {
                Err(StoreError::SchemaMissing)
            }
            async fn operations_since(
                &self,
                _id: &DocumentId,
                _revision: u64,
            ) -> Result<Vec<LogEntry>, StoreError> {
                Err(StoreError::SchemaMissing)
            }
            async fn clear_operations(&self, _id: &DocumentId) -> Result<(), StoreError> {
                Err(StoreError::SchemaMissing)
            }
            async fn compact(&self, _id: &DocumentId, _keep: u64) -> Result<(), StoreError> {
                Err(StoreError::SchemaMissing)
            }
            async fn delete_document(&self, _id: &DocumentId) -> Result<(), StoreError> {
                Err(StoreError::SchemaMissing)
            }
        }

        #[tracing_test::traced_test]
        #[tokio::test]
        async fn missing_schema_degrades_to_memory_only() {
            let blobs = Arc::new(MemoryBlobStore::default());
            let persistence = Persistence::new(
                Arc::new(SchemalessStore),
                Arc::new(MemoryBlobFactory::new(blobs)),
            );
            let id = DocumentId::new("b", "f");

            assert!(persistence.load_snapshot(&id).await.unwrap().is_none());
            assert!(persistence.is_degraded());
            assert!(logs_contain("memory-only mode"));

            // Writes are silently skipped from here on.
            persistence
                .save_snapshot(&id, "b", "f", 1, "content")
                .await
                .unwrap();
            persistence
                .append_operation(&id, 1, "u1", serde_json::json!(["x"]))
                .await
                .unwrap();
            assert!(persistence.operations_since(&id, 0).await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn snapshot_content_is_sanitized() {
            let (persistence, store, _blobs) = Persistence::in_memory();
            let id = DocumentId::new("b", "f");
            persistence
                .save_snapshot(&id, "b", "f", 1, "a\u{0}b")
                .await
                .unwrap();
            assert_eq!(store.snapshot(&id).unwrap().content, "ab");
        }

        #[tokio::test]
        async fn operation_payload_is_sanitized() {
            let (persistence, store, _blobs) = Persistence::in_memory();
            let id = DocumentId::new("b", "f");
            persistence
                .append_operation(&id, 1, "u1", serde_json::json!([1, "x\u{0}y", -1]))
                .await
                .unwrap();
            let log = store.operations_since(&id, 0).await.unwrap();
            assert_eq!(log[0].operations, serde_json::json!([1, "xy", -1]));
        }

        #[tokio::test]
        async fn blob_roundtrip_through_the_region_cache() {
            let (persistence, _store, blobs) = Persistence::in_memory();
            let bucket_info = BucketInfo {
                bucket_name: "workspace".into(),
                region: "eu-central-1".into(),
            };
            persistence
                .write_blob(&bucket_info, "notes.md", "# hi")
                .await
                .unwrap();
            assert_eq!(blobs.get("workspace", "notes.md").unwrap(), "# hi");
            assert_eq!(
                persistence
                    .read_blob(&bucket_info, "notes.md")
                    .await
                    .unwrap()
                    .as_deref(),
                Some("# hi")
            );
            assert!(persistence
                .read_blob(&bucket_info, "absent.md")
                .await
                .unwrap()
                .is_none());
        }
    }

    #[test]
    fn content_types_follow_the_extension() {
        assert_eq!(content_type_for("a/b/readme.md"), "text/markdown");
        assert_eq!(content_type_for("data.json"), "application/json");
        assert_eq!(content_type_for("no-extension"), "text/plain");
    }
}
