//! Per-path CRDT document registry with host-gated persistence.
//!
//! Architecture:
//! ```text
//!             local edit                 remote packet
//!                 │                            │
//!                 ▼                            ▼
//!   ┌─────────────────────────────────────────────────────┐
//!   │ DocumentStore: path → Yrs Doc (+ synced flag, timer)│
//!   └───────┬──────────────────┬──────────────────┬───────┘
//!   origin  │ Local            │ Peer             │ Disk
//!           ▼                  ▼                  ▼
//!      broadcast          mark synced          (nothing)
//!      save if host       save if host
//! ```
//!
//! Persistence is gated on the role the coordinator last set, never on the
//! origin of the update: a host saves what it receives from guests as well as
//! its own edits. Saves are debounced per document; every new update restarts
//! the quiet window.
//!
//! Binary assets (see [`is_asset_path`]) skip the CRDT entirely and travel as
//! raw bytes.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, TransactionMut, Update, WriteTxn};

use crate::config::DocumentConfig;
use crate::filestore::{FileStoreError, FileStoreSync};
use crate::protocol::{is_asset_path, ProjectSnapshot, SyncPacket, HEARTBEAT_PATH};
use crate::transport::{PeerTransport, TransportError};

/// Name of the shared text root inside every document.
pub const TEXT_ROOT: &str = "content";

/// Where an update came from. Decides broadcast and persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// Loaded from the project tree.
    Disk,
    /// Received from another peer.
    Peer,
    /// Produced by this process.
    Local,
}

/// Change notifications for editors and other observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocChange {
    Updated {
        path: String,
        origin: UpdateOrigin,
        update: Vec<u8>,
    },
    Saved {
        path: String,
    },
    AssetReceived {
        path: String,
        bytes: Vec<u8>,
    },
    /// The project root changed and every document was dropped.
    Cleared,
}

/// Document errors.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("No project root set")]
    NoRoot,
    #[error("Invalid update for {path}: {reason}")]
    InvalidUpdate { path: String, reason: String },
    #[error("{0} is not a path inside the project")]
    InvalidPath(String),
    #[error("{0} is a binary asset, not a document")]
    NotADocument(String),
    #[error("Only the host persists documents")]
    NotHost,
    #[error("Persistence error: {0}")]
    Persistence(#[from] FileStoreError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

pub type DocumentResult<T> = Result<T, DocumentError>;

/// Document store statistics.
#[derive(Debug, Clone, Default)]
pub struct DocumentStats {
    pub documents_open: usize,
    pub updates_applied: u64,
    pub saves_written: u64,
    pub save_failures: u64,
    pub packets_broadcast: u64,
}

struct AtomicDocumentStats {
    updates_applied: AtomicU64,
    saves_written: AtomicU64,
    save_failures: AtomicU64,
    packets_broadcast: AtomicU64,
}

struct DocumentEntry {
    doc: Doc,
    is_synced: bool,
    pending_save: Option<JoinHandle<()>>,
    save_seq: u64,
}

impl DocumentEntry {
    fn new() -> Self {
        Self {
            doc: Doc::new(),
            is_synced: false,
            pending_save: None,
            save_seq: 0,
        }
    }

    fn cancel_save(&mut self) {
        if let Some(handle) = self.pending_save.take() {
            handle.abort();
        }
    }
}

struct Inner {
    config: DocumentConfig,
    files: Arc<dyn FileStoreSync>,
    transport: Arc<dyn PeerTransport>,
    entries: Mutex<HashMap<String, DocumentEntry>>,
    root: RwLock<Option<PathBuf>>,
    is_host: AtomicBool,
    events: broadcast::Sender<DocChange>,
    save_seq: AtomicU64,
    stats: AtomicDocumentStats,
}

impl Inner {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, DocumentEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, change: DocChange) {
        let _ = self.events.send(change);
    }

    fn absolute_path(&self, relative: &str) -> DocumentResult<PathBuf> {
        let root = self.root.read().unwrap_or_else(PoisonError::into_inner);
        resolve(root.as_deref().ok_or(DocumentError::NoRoot)?, relative)
    }

    async fn write(&self, path: &str, bytes: &[u8]) -> DocumentResult<()> {
        let abs = self.absolute_path(path)?;
        match self.files.write_file(&abs, bytes).await {
            Ok(()) => {
                self.stats.saves_written.fetch_add(1, Ordering::Relaxed);
                log::debug!("Saved {path} ({} bytes)", bytes.len());
                self.emit(DocChange::Saved {
                    path: path.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                self.stats.save_failures.fetch_add(1, Ordering::Relaxed);
                log::error!("Failed to save {path}: {e}");
                Err(e.into())
            }
        }
    }

    /// Write the document if `seq` is still its latest scheduled save.
    async fn flush_if_current(&self, path: &str, seq: u64) {
        let state = {
            let mut entries = self.entries();
            match entries.get_mut(path) {
                Some(entry) if entry.save_seq == seq => {
                    entry.pending_save = None;
                    Some(encode_state(&entry.doc))
                }
                _ => None,
            }
        };
        if let Some(state) = state {
            let _ = self.write(path, &state).await;
        }
    }
}

/// Registry of open documents.
pub struct DocumentStore {
    inner: Arc<Inner>,
}

impl DocumentStore {
    pub fn new(
        config: DocumentConfig,
        files: Arc<dyn FileStoreSync>,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        Self {
            inner: Arc::new(Inner {
                config,
                files,
                transport,
                entries: Mutex::new(HashMap::new()),
                root: RwLock::new(None),
                is_host: AtomicBool::new(true),
                events,
                save_seq: AtomicU64::new(0),
                stats: AtomicDocumentStats {
                    updates_applied: AtomicU64::new(0),
                    saves_written: AtomicU64::new(0),
                    save_failures: AtomicU64::new(0),
                    packets_broadcast: AtomicU64::new(0),
                },
            }),
        }
    }

    /// Subscribe to document changes.
    pub fn subscribe(&self) -> broadcast::Receiver<DocChange> {
        self.inner.events.subscribe()
    }

    /// Set by the coordinator on every role transition.
    pub fn set_role(&self, is_host: bool) {
        self.inner.is_host.store(is_host, Ordering::SeqCst);
    }

    pub fn is_host(&self) -> bool {
        self.inner.is_host.load(Ordering::SeqCst)
    }

    /// Switch projects. Every document is dropped and pending saves are
    /// cancelled before this returns.
    pub fn set_project_root(&self, root: Option<PathBuf>) {
        {
            let mut entries = self.inner.entries();
            for entry in entries.values_mut() {
                entry.cancel_save();
            }
            entries.clear();
        }
        *self.inner.root.write().unwrap_or_else(PoisonError::into_inner) = root;
        self.inner.emit(DocChange::Cleared);
    }

    pub fn project_root(&self) -> Option<PathBuf> {
        self.inner
            .root
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// `relative` resolved against the project root. `None` without a root
    /// or for a path outside it.
    pub fn absolute_path(&self, relative: &str) -> Option<PathBuf> {
        self.inner.absolute_path(relative).ok()
    }

    /// Open documents, sorted by path.
    pub fn open_documents(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.inner.entries().keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn get_doc(&self, path: &str) -> Option<Doc> {
        self.inner.entries().get(path).map(|e| e.doc.clone())
    }

    /// Whether `path` has received at least one peer update.
    pub fn is_synced(&self, path: &str) -> bool {
        self.inner.entries().get(path).is_some_and(|e| e.is_synced)
    }

    /// Return the document for `path`, creating it on first use.
    ///
    /// A new document gets one load attempt from disk, applied with
    /// [`UpdateOrigin::Disk`].
    pub async fn get_or_create_doc(&self, path: &str) -> DocumentResult<Doc> {
        validate_path(path)?;
        if is_asset_path(path) || path == HEARTBEAT_PATH {
            return Err(DocumentError::NotADocument(path.to_string()));
        }
        let doc = {
            let mut entries = self.inner.entries();
            if let Some(entry) = entries.get(path) {
                return Ok(entry.doc.clone());
            }
            let entry = DocumentEntry::new();
            let doc = entry.doc.clone();
            entries.insert(path.to_string(), entry);
            doc
        };
        self.load_from_disk(path, &doc).await;
        Ok(doc)
    }

    async fn load_from_disk(&self, path: &str, doc: &Doc) {
        let Ok(abs) = self.inner.absolute_path(path) else {
            return;
        };
        let bytes = match self.inner.files.read_file(&abs).await {
            Ok(bytes) => bytes,
            Err(FileStoreError::NotFound(_)) => {
                log::debug!("{path} not on disk yet, starting empty");
                return;
            }
            Err(e) => {
                log::warn!("Failed to load {path}: {e}");
                return;
            }
        };
        if bytes.is_empty() {
            return;
        }
        let update = if merge(doc, path, &bytes).is_ok() {
            bytes
        } else {
            // Not a CRDT state: import the file as plain text.
            let Ok(text) = std::str::from_utf8(&bytes) else {
                log::warn!("{path} on disk is neither a document state nor text, ignoring");
                return;
            };
            let imported = import_text(path, text);
            if let Err(e) = merge(doc, path, &imported) {
                log::warn!("Failed to import {path}: {e}");
                return;
            }
            log::info!("Imported {path} from plain text");
            imported
        };
        self.inner.stats.updates_applied.fetch_add(1, Ordering::Relaxed);
        self.dispatch(path, UpdateOrigin::Disk, update).await;
    }

    /// Merge an update received from a peer. Heartbeats are ignored, assets
    /// are handed to observers (and written when hosting). Never rebroadcast.
    pub async fn apply_remote_update(&self, path: &str, bytes: &[u8]) -> DocumentResult<()> {
        if path == HEARTBEAT_PATH {
            return Ok(());
        }
        validate_path(path)?;
        if is_asset_path(path) {
            self.receive_asset(path, bytes).await;
            return Ok(());
        }
        self.apply_update(path, bytes, UpdateOrigin::Peer).await
    }

    /// Merge an update produced by a local editor.
    pub async fn apply_local_update(&self, path: &str, bytes: &[u8]) -> DocumentResult<()> {
        self.apply_update(path, bytes, UpdateOrigin::Local).await
    }

    /// Merge `bytes` into `path` with an explicit origin.
    pub async fn apply_update(&self, path: &str, bytes: &[u8], origin: UpdateOrigin) -> DocumentResult<()> {
        let doc = self.get_or_create_doc(path).await?;
        merge(&doc, path, bytes)?;
        self.inner.stats.updates_applied.fetch_add(1, Ordering::Relaxed);
        self.dispatch(path, origin, bytes.to_vec()).await;
        Ok(())
    }

    /// Run a local edit against `path` and dispatch the resulting update.
    ///
    /// Returns the encoded update.
    pub async fn edit<F>(&self, path: &str, f: F) -> DocumentResult<Vec<u8>>
    where
        F: FnOnce(&mut TransactionMut),
    {
        let doc = self.get_or_create_doc(path).await?;
        let before = doc.transact().state_vector();
        {
            let mut txn = doc.transact_mut();
            f(&mut txn);
        }
        let update = doc.transact().encode_diff_v1(&before);
        self.inner.stats.updates_applied.fetch_add(1, Ordering::Relaxed);
        self.dispatch(path, UpdateOrigin::Local, update.clone()).await;
        Ok(update)
    }

    /// Insert `chunk` into the document's text at `index`.
    pub async fn insert_text(&self, path: &str, index: u32, chunk: &str) -> DocumentResult<Vec<u8>> {
        self.edit(path, |txn| {
            let text = txn.get_or_insert_text(TEXT_ROOT);
            text.insert(txn, index, chunk);
        })
        .await
    }

    /// Remove `len` characters starting at `index`.
    pub async fn remove_text(&self, path: &str, index: u32, len: u32) -> DocumentResult<Vec<u8>> {
        self.edit(path, |txn| {
            let text = txn.get_or_insert_text(TEXT_ROOT);
            text.remove_range(txn, index, len);
        })
        .await
    }

    /// Current text of an open document.
    pub fn text(&self, path: &str) -> Option<String> {
        self.get_doc(path).map(|doc| text_of(&doc))
    }

    /// Full encoded state of an open document.
    pub fn encode_state(&self, path: &str) -> Option<Vec<u8>> {
        self.get_doc(path).map(|doc| encode_state(&doc))
    }

    async fn dispatch(&self, path: &str, origin: UpdateOrigin, update: Vec<u8>) {
        match origin {
            UpdateOrigin::Local => {
                self.broadcast(path, update.clone()).await;
                if self.is_host() {
                    self.schedule_save(path);
                }
            }
            UpdateOrigin::Peer => {
                if let Some(entry) = self.inner.entries().get_mut(path) {
                    entry.is_synced = true;
                }
                if self.is_host() {
                    self.schedule_save(path);
                }
            }
            UpdateOrigin::Disk => {}
        }
        self.inner.emit(DocChange::Updated {
            path: path.to_string(),
            origin,
            update,
        });
    }

    async fn broadcast(&self, path: &str, data: Vec<u8>) {
        match self.inner.transport.broadcast(SyncPacket::update(path, data)).await {
            Ok(n) => {
                self.inner.stats.packets_broadcast.fetch_add(1, Ordering::Relaxed);
                log::trace!("Broadcast {path} to {n} peers");
            }
            Err(e) => log::warn!("Broadcast of {path} failed: {e}"),
        }
    }

    /// (Re)start the quiet window for `path`.
    fn schedule_save(&self, path: &str) {
        let seq = self.inner.save_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let mut entries = self.inner.entries();
        let Some(entry) = entries.get_mut(path) else {
            return;
        };
        entry.cancel_save();
        entry.save_seq = seq;

        let inner = self.inner.clone();
        let path = path.to_string();
        let debounce = self.inner.config.save_debounce;
        entry.pending_save = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            inner.flush_if_current(&path, seq).await;
        }));
    }

    pub fn has_pending_save(&self, path: &str) -> bool {
        self.inner
            .entries()
            .get(path)
            .is_some_and(|e| e.pending_save.is_some())
    }

    /// Write `path` now, cancelling its debounce. Host only.
    pub async fn save_now(&self, path: &str) -> DocumentResult<()> {
        if !self.is_host() {
            return Err(DocumentError::NotHost);
        }
        let state = {
            let mut entries = self.inner.entries();
            let Some(entry) = entries.get_mut(path) else {
                return Ok(());
            };
            entry.cancel_save();
            encode_state(&entry.doc)
        };
        self.inner.write(path, &state).await
    }

    /// Drop a document. A pending save is flushed first when hosting.
    pub async fn close_doc(&self, path: &str) {
        let pending = {
            let mut entries = self.inner.entries();
            entries.remove(path).and_then(|mut entry| {
                entry.pending_save.take().map(|handle| {
                    handle.abort();
                    encode_state(&entry.doc)
                })
            })
        };
        if let Some(state) = pending {
            if self.is_host() {
                let _ = self.inner.write(path, &state).await;
            }
        }
    }

    /// Full state of every open document, for a joining guest.
    pub fn snapshot(&self) -> ProjectSnapshot {
        let entries = self.inner.entries();
        let mut snapshot = ProjectSnapshot::new();
        for (path, entry) in entries.iter() {
            snapshot.insert(path.clone(), encode_state(&entry.doc));
        }
        snapshot
    }

    /// Merge a host's snapshot, every document with [`UpdateOrigin::Peer`].
    pub async fn apply_snapshot(&self, snapshot: &ProjectSnapshot) -> DocumentResult<usize> {
        let mut applied = 0;
        for (path, state) in &snapshot.documents {
            match self.apply_update(path, state, UpdateOrigin::Peer).await {
                Ok(()) => applied += 1,
                Err(e) => log::warn!("Skipping {path} from snapshot: {e}"),
            }
        }
        Ok(applied)
    }

    /// Push the full state of every open document to the session.
    ///
    /// Edits made while no host was reachable reach the new host this way.
    pub async fn broadcast_all_states(&self) -> usize {
        let states: Vec<(String, Vec<u8>)> = self
            .inner
            .entries()
            .iter()
            .map(|(path, entry)| (path.clone(), encode_state(&entry.doc)))
            .collect();
        let count = states.len();
        for (path, state) in states {
            self.broadcast(&path, state).await;
        }
        count
    }

    /// Answer a peer's sync request with our full state, if we hold `path`.
    pub async fn answer_sync_request(&self, path: &str) -> bool {
        match self.encode_state(path) {
            Some(state) => {
                self.broadcast(path, state).await;
                true
            }
            None => false,
        }
    }

    /// Ask the session for the full state of `path`.
    pub async fn request_sync(&self, path: &str) -> DocumentResult<()> {
        self.inner.transport.request_file_sync(path).await?;
        Ok(())
    }

    /// Share a local asset: broadcast the raw bytes, write them when hosting.
    pub async fn write_asset(&self, path: &str, bytes: &[u8]) -> DocumentResult<()> {
        validate_path(path)?;
        if !is_asset_path(path) {
            return Err(DocumentError::InvalidUpdate {
                path: path.to_string(),
                reason: "not an asset path".into(),
            });
        }
        self.broadcast(path, bytes.to_vec()).await;
        if self.is_host() {
            self.inner.write(path, bytes).await?;
        }
        Ok(())
    }

    pub async fn read_asset(&self, path: &str) -> DocumentResult<Vec<u8>> {
        let abs = self.inner.absolute_path(path)?;
        Ok(self.inner.files.read_file(&abs).await?)
    }

    async fn receive_asset(&self, path: &str, bytes: &[u8]) {
        self.inner.emit(DocChange::AssetReceived {
            path: path.to_string(),
            bytes: bytes.to_vec(),
        });
        if self.is_host() {
            let _ = self.inner.write(path, bytes).await;
        }
    }

    pub fn stats(&self) -> DocumentStats {
        let s = &self.inner.stats;
        DocumentStats {
            documents_open: self.inner.entries().len(),
            updates_applied: s.updates_applied.load(Ordering::Relaxed),
            saves_written: s.saves_written.load(Ordering::Relaxed),
            save_failures: s.save_failures.load(Ordering::Relaxed),
            packets_broadcast: s.packets_broadcast.load(Ordering::Relaxed),
        }
    }
}

impl Drop for DocumentStore {
    fn drop(&mut self) {
        for entry in self.inner.entries().values_mut() {
            entry.cancel_save();
        }
    }
}

fn merge(doc: &Doc, path: &str, bytes: &[u8]) -> DocumentResult<()> {
    let update = Update::decode_v1(bytes).map_err(|e| DocumentError::InvalidUpdate {
        path: path.to_string(),
        reason: e.to_string(),
    })?;
    let mut txn = doc.transact_mut();
    if let Err(e) = txn.apply_update(update) {
        return Err(DocumentError::InvalidUpdate {
            path: path.to_string(),
            reason: e.to_string(),
        });
    }
    Ok(())
}

/// Plain text as a document state authored by a client id derived from the
/// path and the text. Every peer importing the same file produces the same
/// update, so merging two imports does not duplicate the text.
pub fn import_text(path: &str, text: &str) -> Vec<u8> {
    let digest = Sha256::new()
        .chain_update(path.trim_start_matches(['/', '\\']).as_bytes())
        .chain_update([0u8])
        .chain_update(text.as_bytes())
        .finalize();
    let mut id = [0u8; 8];
    id.copy_from_slice(&digest[..8]);
    // Yrs client ids must fit in 53 bits
    let client_id = u64::from_le_bytes(id) & ((1 << 53) - 1);

    let doc = Doc::with_client_id(client_id);
    {
        let mut txn = doc.transact_mut();
        let root = txn.get_or_insert_text(TEXT_ROOT);
        root.insert(&mut txn, 0, text);
    }
    encode_state(&doc)
}

/// Full document state as a single update.
pub fn encode_state(doc: &Doc) -> Vec<u8> {
    doc.transact()
        .encode_state_as_update_v1(&StateVector::default())
}

/// Text under [`TEXT_ROOT`].
pub fn text_of(doc: &Doc) -> String {
    let mut txn = doc.transact_mut();
    let text = txn.get_or_insert_text(TEXT_ROOT);
    text.get_string(&txn)
}

/// Encoded state vector, for diffing against a remote replica.
pub fn state_vector(doc: &Doc) -> Vec<u8> {
    doc.transact().state_vector().encode_v1()
}

/// Resolve `relative` against `root` the way the store does.
pub fn resolve(root: &Path, relative: &str) -> DocumentResult<PathBuf> {
    Ok(root.join(validate_path(relative)?))
}

/// Strip leading separators and refuse anything that could leave the root:
/// empty paths, `..` segments, drive prefixes.
pub fn validate_path(relative: &str) -> DocumentResult<&str> {
    let trimmed = relative.trim_start_matches(['/', '\\']);
    let escapes = trimmed.is_empty()
        || trimmed.split(['/', '\\']).any(|segment| segment == "..")
        || Path::new(trimmed)
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(DocumentError::InvalidPath(relative.to_string()));
    }
    Ok(trimmed)
}
