//! Shared fixtures for the scenario tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use weft_collab::{
    CryptoVault, DocumentConfig, DocumentStore, MemoryFileStore, MemoryNetwork, MemoryRemote,
    MemoryTransport, NoPrompt, PasswordPrompt, PeerTransport, Services, SessionConfig,
    SessionCoordinator, SessionEvent, SessionMetadata, StaticPlugins, VaultConfig,
};

pub const ROOT: &str = "/project";

pub fn meta_path() -> PathBuf {
    Path::new(ROOT).join(".collab_meta.json")
}

/// Answers password prompts from a fixed script, then cancels.
#[derive(Default)]
pub struct ScriptedPrompt {
    answers: Mutex<VecDeque<Option<String>>>,
    asked: AtomicUsize,
}

impl ScriptedPrompt {
    pub fn new<I>(answers: I) -> Self
    where
        I: IntoIterator<Item = Option<&'static str>>,
    {
        Self {
            answers: Mutex::new(answers.into_iter().map(|a| a.map(String::from)).collect()),
            asked: AtomicUsize::new(0),
        }
    }

    pub fn times_asked(&self) -> usize {
        self.asked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PasswordPrompt for ScriptedPrompt {
    async fn request_password(&self, _message: &str) -> Option<String> {
        self.asked.fetch_add(1, Ordering::SeqCst);
        self.answers.lock().unwrap().pop_front().flatten()
    }
}

pub struct PeerOptions {
    pub session: SessionConfig,
    pub documents: DocumentConfig,
    pub plugins: Vec<&'static str>,
    pub prompt: Arc<dyn PasswordPrompt>,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            session: SessionConfig::for_testing(),
            documents: DocumentConfig::for_testing(),
            plugins: Vec::new(),
            prompt: Arc::new(NoPrompt),
        }
    }
}

/// One simulated process.
pub struct Peer {
    pub id: String,
    pub coordinator: Arc<SessionCoordinator>,
    pub documents: Arc<DocumentStore>,
    pub transport: Arc<MemoryTransport>,
    pub files: MemoryFileStore,
    pub vault: Arc<CryptoVault>,
}

impl Peer {
    pub fn spawn(net: &MemoryNetwork, remote: &MemoryRemote, id: &str) -> Self {
        Self::spawn_with(net, remote, id, PeerOptions::default())
    }

    pub fn spawn_with(net: &MemoryNetwork, remote: &MemoryRemote, id: &str, opts: PeerOptions) -> Self {
        let transport = Arc::new(net.join_as(id));
        let files = remote.checkout();
        let documents = Arc::new(DocumentStore::new(
            opts.documents,
            Arc::new(files.clone()),
            transport.clone(),
        ));
        let vault = Arc::new(CryptoVault::new(VaultConfig::for_testing()));
        let services = Services {
            transport: transport.clone(),
            files: Arc::new(files.clone()),
            documents: documents.clone(),
            vault: vault.clone(),
            prompt: opts.prompt,
            plugins: Arc::new(StaticPlugins::new(opts.plugins)),
        };
        Self {
            id: id.to_string(),
            coordinator: SessionCoordinator::new(opts.session, services),
            documents,
            transport,
            files,
            vault,
        }
    }

    pub fn peer_id(&self) -> String {
        self.transport.local_peer_id().unwrap()
    }
}

/// Poll `cond` every few milliseconds until it holds or `limit` passes.
pub async fn wait_until<F>(limit: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Every warning received so far.
pub fn drain_warnings(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let SessionEvent::Warning(msg) = event {
            out.push(msg);
        }
    }
    out
}

pub fn remote_metadata(remote: &MemoryRemote) -> Option<SessionMetadata> {
    remote
        .get(&meta_path())
        .and_then(|bytes| SessionMetadata::parse(&bytes).ok())
}
