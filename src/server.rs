// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The document server: the authoritative side of collaborative editing.
//!
//! Every cached document is owned by its own task. Callers talk to it
//! through an mpsc channel, and that channel is the per-document
//! serializer: commands run one at a time, in submission order, each
//! answering through its own oneshot. A failed command reports to its
//! caller and the next one simply runs against the document's current
//! state. Documents never share a task, so different documents proceed in
//! parallel.
//!
//! A client submits an operation together with the revision it was based
//! on. If the server has moved past that revision, the operation is
//! transformed against everything the client missed (read back from the
//! operation log), applied, logged under the next revision, and returned
//! so the transport can rebroadcast it.

use crate::config::ServerConfig;
use crate::document::{normalize_line_endings, BucketInfo, Document, DocumentId};
use crate::ot::{OtError, TextOperation};
use crate::store::{Persistence, StoreError};
use futures::future::join_all;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("document {0} is not cached")]
    NotFound(DocumentId),
    #[error("client revision {client} is ahead of server revision {server}")]
    ClientAhead { client: u64, server: u64 },
    #[error(
        "operation log has a gap: expected {expected} entries after revision {since}, found {found}"
    )]
    LogGap {
        since: u64,
        expected: u64,
        found: u64,
    },
    #[error("failed to apply operation to the document: {0}")]
    ApplyFailed(OtError),
    #[error(transparent)]
    Ot(#[from] OtError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How a bucket's blob writes are scheduled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SaveMode {
    /// Snapshot and blob are both written on the debounce tick.
    #[default]
    Debounced,
    /// The debounce tick writes only the snapshot; a bucket-wide background
    /// timer flushes blobs.
    Interval,
}

/// A caller's view of a cached document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocumentState {
    pub id: DocumentId,
    pub revision: u64,
    pub content: String,
}

// These commands are sent to the task that owns a document.
enum DocCommand {
    Receive {
        client_revision: u64,
        operation: TextOperation,
        author_id: String,
        response_tx: oneshot::Sender<Result<(u64, TextOperation), ServerError>>,
    },
    SetContent {
        content: String,
        author_id: String,
        response_tx: oneshot::Sender<Result<Option<(u64, TextOperation)>, ServerError>>,
    },
    GetState {
        response_tx: oneshot::Sender<(String, u64)>,
    },
    SaveTick {
        generation: u64,
    },
    WriteBlob,
    ForceSave {
        response_tx: oneshot::Sender<Result<(), ServerError>>,
    },
}

impl fmt::Debug for DocCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let repr = match self {
            DocCommand::Receive { .. } => "receive operation",
            DocCommand::SetContent { .. } => "full content sync",
            DocCommand::GetState { .. } => "get state",
            DocCommand::SaveTick { .. } => "debounced save tick",
            DocCommand::WriteBlob => "background blob write",
            DocCommand::ForceSave { .. } => "force save",
        };
        write!(f, "{repr}")
    }
}

#[derive(Clone)]
struct DocHandle {
    command_tx: mpsc::Sender<DocCommand>,
    bucket_id: String,
    file_path: String,
}

struct Shared {
    persistence: Persistence,
    config: ServerConfig,
    documents: Mutex<HashMap<DocumentId, DocHandle>>,
    bucket_modes: std::sync::Mutex<HashMap<String, SaveMode>>,
    bucket_timers: std::sync::Mutex<HashMap<String, CancellationToken>>,
    cleanup_timers: std::sync::Mutex<HashMap<DocumentId, CancellationToken>>,
}

impl Shared {
    fn bucket_mode(&self, bucket_id: &str) -> SaveMode {
        self.bucket_modes
            .lock()
            .expect("bucket mode lock poisoned")
            .get(bucket_id)
            .copied()
            .unwrap_or_default()
    }

    async fn evict(&self, id: &DocumentId, save_first: bool) {
        let handle = self.documents.lock().await.remove(id);
        self.cleanup_timers
            .lock()
            .expect("cleanup timer lock poisoned")
            .remove(id);
        let Some(handle) = handle else {
            return;
        };
        if save_first {
            let (response_tx, response_rx) = oneshot::channel();
            if handle
                .command_tx
                .send(DocCommand::ForceSave { response_tx })
                .await
                .is_ok()
            {
                if let Ok(Err(e)) = response_rx.await {
                    warn!("Saving {id} before eviction failed: {e}");
                }
            }
        }
        info!("Evicted document {id} from the cache.");
    }

    async fn write_bucket_blobs(&self, bucket_id: &str) {
        let senders: Vec<mpsc::Sender<DocCommand>> = self
            .documents
            .lock()
            .await
            .values()
            .filter(|handle| handle.bucket_id == bucket_id)
            .map(|handle| handle.command_tx.clone())
            .collect();
        for sender in senders {
            let _ = sender.send(DocCommand::WriteBlob).await;
        }
    }
}

struct DocActor {
    doc: Document,
    command_rx: mpsc::Receiver<DocCommand>,
    /// Weak so a sleeping save tick doesn't keep an evicted document alive.
    self_tx: mpsc::WeakSender<DocCommand>,
    shared: Arc<Shared>,
    save_generation: u64,
}

impl DocActor {
    async fn run(mut self) {
        while let Some(command) = self.command_rx.recv().await {
            self.handle_command(command).await;
        }
        debug!("Document task for {} finished.", self.doc.id);
    }

    async fn handle_command(&mut self, command: DocCommand) {
        debug!("Handling doc command for {}: {command:?}", self.doc.id);
        match command {
            DocCommand::Receive {
                client_revision,
                operation,
                author_id,
                response_tx,
            } => {
                let result = self
                    .receive_operation(client_revision, operation, &author_id)
                    .await;
                let _ = response_tx.send(result);
            }
            DocCommand::SetContent {
                content,
                author_id,
                response_tx,
            } => {
                let result = self.set_content(content, &author_id).await;
                let _ = response_tx.send(result);
            }
            DocCommand::GetState { response_tx } => {
                let _ = response_tx.send((self.doc.content.clone(), self.doc.revision));
            }
            DocCommand::SaveTick { generation } => {
                // A later mutation supersedes this tick.
                if generation == self.save_generation {
                    self.debounced_save().await;
                }
            }
            DocCommand::WriteBlob => {
                if let Err(e) = self.write_blob().await {
                    warn!("Background blob write for {} failed: {e}", self.doc.id);
                }
            }
            DocCommand::ForceSave { response_tx } => {
                let _ = response_tx.send(self.force_save().await);
            }
        }
    }

    async fn receive_operation(
        &mut self,
        client_revision: u64,
        operation: TextOperation,
        author_id: &str,
    ) -> Result<(u64, TextOperation), ServerError> {
        if client_revision > self.doc.revision {
            return Err(ServerError::ClientAhead {
                client: client_revision,
                server: self.doc.revision,
            });
        }

        let mut operation = operation;
        if client_revision < self.doc.revision {
            let missed = self
                .shared
                .persistence
                .operations_since(&self.doc.id, client_revision)
                .await?;
            let expected = self.doc.revision - client_revision;
            if missed.len() as u64 != expected {
                // The client has to resync; guessing here would fork the
                // document.
                return Err(ServerError::LogGap {
                    since: client_revision,
                    expected,
                    found: missed.len() as u64,
                });
            }
            for entry in missed {
                let server_operation = TextOperation::from_json(&entry.operations)?;
                let (transformed, _) = operation.transform(&server_operation)?;
                operation = transformed;
            }
        }

        self.commit(operation, author_id).await
    }

    async fn set_content(
        &mut self,
        content: String,
        author_id: &str,
    ) -> Result<Option<(u64, TextOperation)>, ServerError> {
        let desired = normalize_line_endings(&content);
        if desired == self.doc.content {
            return Ok(None);
        }
        let operation: TextOperation = dissimilar::diff(&self.doc.content, &desired).into();
        if operation.is_noop() {
            return Ok(None);
        }
        self.commit(operation, author_id).await.map(Some)
    }

    /// Applies, logs, and commits one transformed operation. The in-memory
    /// document only moves once the log append went through, so a failed
    /// append leaves content and revision untouched.
    async fn commit(
        &mut self,
        operation: TextOperation,
        author_id: &str,
    ) -> Result<(u64, TextOperation), ServerError> {
        let new_content = operation
            .apply(&self.doc.content)
            .map_err(ServerError::ApplyFailed)?;
        let next_revision = self.doc.revision + 1;
        self.shared
            .persistence
            .append_operation(&self.doc.id, next_revision, author_id, operation.to_json())
            .await?;
        self.doc.content = new_content;
        self.doc.revision = next_revision;
        self.schedule_save();

        let compact_interval = self.shared.config.compact_interval;
        if compact_interval > 0 && next_revision % compact_interval == 0 {
            let persistence = self.shared.persistence.clone();
            let id = self.doc.id.clone();
            let keep = self.shared.config.keep_window;
            tokio::spawn(async move {
                if let Err(e) = persistence.compact(&id, keep).await {
                    warn!("Compacting the log of {id} failed: {e}");
                }
            });
        }

        Ok((next_revision, operation))
    }

    fn schedule_save(&mut self) {
        self.save_generation += 1;
        let generation = self.save_generation;
        let self_tx = self.self_tx.clone();
        let delay = self.shared.config.save_debounce;
        tokio::spawn(async move {
            sleep(delay).await;
            if let Some(command_tx) = self_tx.upgrade() {
                let _ = command_tx.send(DocCommand::SaveTick { generation }).await;
            }
        });
    }

    async fn debounced_save(&mut self) {
        if let Err(e) = self.write_snapshot().await {
            warn!("Debounced snapshot write for {} failed: {e}", self.doc.id);
        }
        if self.shared.bucket_mode(&self.doc.bucket_id) == SaveMode::Debounced {
            if let Err(e) = self.write_blob().await {
                warn!("Debounced blob write for {} failed: {e}", self.doc.id);
            }
        }
    }

    async fn force_save(&mut self) -> Result<(), ServerError> {
        // Whatever tick is pending is superseded by this write.
        self.save_generation += 1;
        self.write_snapshot().await?;
        self.write_blob().await?;
        Ok(())
    }

    async fn write_snapshot(&self) -> Result<(), ServerError> {
        self.shared
            .persistence
            .save_snapshot(
                &self.doc.id,
                &self.doc.bucket_id,
                &self.doc.file_path,
                self.doc.revision,
                &self.doc.content,
            )
            .await?;
        Ok(())
    }

    async fn write_blob(&self) -> Result<(), ServerError> {
        self.shared
            .persistence
            .write_blob(&self.doc.bucket_info, &self.doc.file_path, &self.doc.content)
            .await?;
        Ok(())
    }
}

async fn state_of(handle: &DocHandle) -> Option<(String, u64)> {
    let (response_tx, response_rx) = oneshot::channel();
    handle
        .command_tx
        .send(DocCommand::GetState { response_tx })
        .await
        .ok()?;
    response_rx.await.ok()
}

/// The server. Cheap to clone; all clones share one document cache.
#[derive(Clone)]
pub struct DocServer {
    shared: Arc<Shared>,
}

impl DocServer {
    pub fn new(persistence: Persistence, config: ServerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                persistence,
                config,
                documents: Mutex::new(HashMap::new()),
                bucket_modes: std::sync::Mutex::new(HashMap::new()),
                bucket_timers: std::sync::Mutex::new(HashMap::new()),
                cleanup_timers: std::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns the cached document, materializing it first if needed: from
    /// its stored snapshot if one exists, else from the blob store, else
    /// empty.
    pub async fn get_or_create(
        &self,
        bucket_id: &str,
        file_path: &str,
        bucket_info: BucketInfo,
    ) -> Result<DocumentState, ServerError> {
        let id = DocumentId::new(bucket_id, file_path);
        let mut documents = self.shared.documents.lock().await;
        if let Some(handle) = documents.get(&id) {
            let (content, revision) = state_of(handle)
                .await
                .ok_or_else(|| ServerError::NotFound(id.clone()))?;
            return Ok(DocumentState {
                id,
                revision,
                content,
            });
        }

        let persistence = &self.shared.persistence;
        let content = match persistence.load_snapshot(&id).await? {
            Some(snapshot) => {
                let content = normalize_line_endings(&snapshot.content);
                // A reload means there are no current editors. Stale log
                // entries would collide with the restarted revision counter,
                // so they go now.
                persistence.clear_operations(&id).await?;
                persistence
                    .save_snapshot(&id, bucket_id, file_path, 0, &content)
                    .await?;
                content
            }
            None => {
                let blob = match persistence.read_blob(&bucket_info, file_path).await {
                    Ok(blob) => blob,
                    Err(e) => {
                        warn!("Reading the blob behind {id} failed, starting empty: {e}");
                        None
                    }
                };
                let content = normalize_line_endings(&blob.unwrap_or_default());
                persistence
                    .save_snapshot(&id, bucket_id, file_path, 0, &content)
                    .await?;
                content
            }
        };

        let doc = Document::new(bucket_id, file_path, bucket_info, content.clone());
        let (command_tx, command_rx) = mpsc::channel(256);
        let actor = DocActor {
            doc,
            command_rx,
            self_tx: command_tx.downgrade(),
            shared: self.shared.clone(),
            save_generation: 0,
        };
        tokio::spawn(actor.run());
        documents.insert(
            id.clone(),
            DocHandle {
                command_tx,
                bucket_id: bucket_id.to_owned(),
                file_path: file_path.to_owned(),
            },
        );
        info!("Materialized document {id} at revision 0.");
        Ok(DocumentState {
            id,
            revision: 0,
            content,
        })
    }

    /// Accepts one client operation based on `client_revision`, transforms
    /// it against everything the client missed, applies and logs it, and
    /// returns the new revision together with the transformed operation for
    /// rebroadcast.
    pub async fn receive_operation(
        &self,
        id: &DocumentId,
        client_revision: u64,
        operation: TextOperation,
        author_id: &str,
    ) -> Result<(u64, TextOperation), ServerError> {
        let handle = self.handle_for(id).await?;
        let (response_tx, response_rx) = oneshot::channel();
        handle
            .command_tx
            .send(DocCommand::Receive {
                client_revision,
                operation,
                author_id: author_id.to_owned(),
                response_tx,
            })
            .await
            .map_err(|_| ServerError::NotFound(id.clone()))?;
        response_rx
            .await
            .map_err(|_| ServerError::NotFound(id.clone()))?
    }

    /// Replaces the document with `content` by logging the minimal diff as
    /// a regular operation. Returns `None` when nothing changed.
    pub async fn apply_full_content(
        &self,
        id: &DocumentId,
        content: &str,
        author_id: &str,
    ) -> Result<Option<(u64, TextOperation)>, ServerError> {
        let handle = self.handle_for(id).await?;
        let (response_tx, response_rx) = oneshot::channel();
        handle
            .command_tx
            .send(DocCommand::SetContent {
                content: content.to_owned(),
                author_id: author_id.to_owned(),
                response_tx,
            })
            .await
            .map_err(|_| ServerError::NotFound(id.clone()))?;
        response_rx
            .await
            .map_err(|_| ServerError::NotFound(id.clone()))?
    }

    /// Writes snapshot and blob now, regardless of the bucket's save mode.
    pub async fn force_save(&self, id: &DocumentId) -> Result<(), ServerError> {
        let handle = self.handle_for(id).await?;
        let (response_tx, response_rx) = oneshot::channel();
        handle
            .command_tx
            .send(DocCommand::ForceSave { response_tx })
            .await
            .map_err(|_| ServerError::NotFound(id.clone()))?;
        response_rx
            .await
            .map_err(|_| ServerError::NotFound(id.clone()))?
    }

    /// After the grace period, force-saves and evicts the document unless
    /// the cleanup was cancelled in the meantime.
    pub fn schedule_cleanup(&self, id: &DocumentId) {
        let token = CancellationToken::new();
        if let Some(previous) = self
            .shared
            .cleanup_timers
            .lock()
            .expect("cleanup timer lock poisoned")
            .insert(id.clone(), token.clone())
        {
            previous.cancel();
        }
        let shared = self.shared.clone();
        let id = id.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = sleep(shared.config.cleanup_grace) => {
                    shared.evict(&id, true).await;
                }
            }
        });
    }

    /// Cancels a pending cleanup, e.g. because a subscriber reconnected.
    pub fn cancel_cleanup(&self, id: &DocumentId) {
        if let Some(token) = self
            .shared
            .cleanup_timers
            .lock()
            .expect("cleanup timer lock poisoned")
            .remove(id)
        {
            token.cancel();
        }
    }

    /// Evicts without saving and removes snapshot and log from the stores.
    pub async fn delete_permanently(&self, id: &DocumentId) -> Result<(), ServerError> {
        self.cancel_cleanup(id);
        self.shared.evict(id, false).await;
        self.shared.persistence.delete_document(id).await?;
        info!("Permanently deleted document {id}.");
        Ok(())
    }

    /// Switches how the bucket's blobs are written; switching to
    /// [`SaveMode::Interval`] starts the bucket's background writer,
    /// switching back stops it.
    pub fn set_bucket_mode(&self, bucket_id: &str, mode: SaveMode) {
        self.shared
            .bucket_modes
            .lock()
            .expect("bucket mode lock poisoned")
            .insert(bucket_id.to_owned(), mode);
        let mut timers = self
            .shared
            .bucket_timers
            .lock()
            .expect("bucket timer lock poisoned");
        match mode {
            SaveMode::Interval => {
                if timers.contains_key(bucket_id) {
                    return;
                }
                let token = CancellationToken::new();
                timers.insert(bucket_id.to_owned(), token.clone());
                let shared = self.shared.clone();
                let bucket_id = bucket_id.to_owned();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            () = token.cancelled() => break,
                            () = sleep(shared.config.mode_b_interval) => {
                                shared.write_bucket_blobs(&bucket_id).await;
                            }
                        }
                    }
                });
            }
            SaveMode::Debounced => {
                if let Some(token) = timers.remove(bucket_id) {
                    token.cancel();
                }
            }
        }
    }

    pub async fn has_document(&self, id: &DocumentId) -> bool {
        self.shared.documents.lock().await.contains_key(id)
    }

    pub async fn list_document_ids(&self) -> Vec<DocumentId> {
        self.shared.documents.lock().await.keys().cloned().collect()
    }

    /// Current content of a cached document, or `None` if it isn't cached.
    pub async fn get_content(&self, bucket_id: &str, file_path: &str) -> Option<String> {
        let id = DocumentId::new(bucket_id, file_path);
        let handle = self.shared.documents.lock().await.get(&id).cloned()?;
        state_of(&handle).await.map(|(content, _)| content)
    }

    /// `(file_path, content)` of every cached document in the bucket.
    pub async fn list_contents_for_bucket(&self, bucket_id: &str) -> Vec<(String, String)> {
        let handles: Vec<DocHandle> = self
            .shared
            .documents
            .lock()
            .await
            .values()
            .filter(|handle| handle.bucket_id == bucket_id)
            .cloned()
            .collect();
        let states = join_all(handles.iter().map(state_of)).await;
        handles
            .into_iter()
            .zip(states)
            .filter_map(|(handle, state)| state.map(|(content, _)| (handle.file_path, content)))
            .collect()
    }

    /// Force-saves every cached document in the bucket; returns the file
    /// paths that were saved.
    pub async fn force_save_for_bucket(&self, bucket_id: &str) -> Vec<String> {
        let handles: Vec<DocHandle> = self
            .shared
            .documents
            .lock()
            .await
            .values()
            .filter(|handle| handle.bucket_id == bucket_id)
            .cloned()
            .collect();
        let mut saved = Vec::new();
        let results = join_all(handles.iter().map(|handle| async move {
            let (response_tx, response_rx) = oneshot::channel();
            handle
                .command_tx
                .send(DocCommand::ForceSave { response_tx })
                .await
                .ok()?;
            response_rx.await.ok()
        }))
        .await;
        for (handle, result) in handles.iter().zip(results) {
            match result {
                Some(Ok(())) => saved.push(handle.file_path.clone()),
                Some(Err(e)) => warn!(
                    "Saving {}:{} failed: {e}",
                    handle.bucket_id, handle.file_path
                ),
                None => {}
            }
        }
        saved
    }

    /// Force-saves every cached document, e.g. on shutdown.
    pub async fn save_all(&self) {
        let handles: Vec<DocHandle> = self
            .shared
            .documents
            .lock()
            .await
            .values()
            .cloned()
            .collect();
        let results = join_all(handles.iter().map(|handle| async move {
            let (response_tx, response_rx) = oneshot::channel();
            handle
                .command_tx
                .send(DocCommand::ForceSave { response_tx })
                .await
                .ok()?;
            response_rx.await.ok()
        }))
        .await;
        for (handle, result) in handles.iter().zip(results) {
            if let Some(Err(e)) = result {
                warn!(
                    "Saving {}:{} failed: {e}",
                    handle.bucket_id, handle.file_path
                );
            }
        }
    }

    async fn handle_for(&self, id: &DocumentId) -> Result<DocHandle, ServerError> {
        self.shared
            .documents
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ServerError::NotFound(id.clone()))
    }
}
