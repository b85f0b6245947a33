//! Project file access and version-control distribution.
//!
//! The session contract file travels between peers only through
//! [`FileStoreSync::pull`] / [`FileStoreSync::push`]; documents are read and
//! written through the same store so tests can swap in [`MemoryRemote`].
//!
//! ```text
//!   peer A working tree ──push──► remote ──pull──► peer B working tree
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::process::Command;

/// File store errors.
#[derive(Debug, thiserror::Error)]
pub enum FileStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("File not found: {0}")]
    NotFound(PathBuf),
    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },
    #[error("Push rejected: {0}")]
    PushRejected(String),
}

pub type FileStoreResult<T> = Result<T, FileStoreError>;

/// File access plus pull/push of the project tree.
///
/// Every operation fails independently; callers decide which failures are
/// fatal.
#[async_trait]
pub trait FileStoreSync: Send + Sync {
    /// Fetch the latest remote state into `root`.
    async fn pull(&self, root: &Path, credentials: Option<&str>) -> FileStoreResult<()>;
    /// Publish local changes under `root`.
    async fn push(&self, root: &Path, credentials: Option<&str>) -> FileStoreResult<()>;
    async fn read_file(&self, path: &Path) -> FileStoreResult<Vec<u8>>;
    /// Write `bytes`, creating parent directories as needed.
    async fn write_file(&self, path: &Path, bytes: &[u8]) -> FileStoreResult<()>;
}

// ─────────────────────────────────────────────────────────────────
// Git-backed store
// ─────────────────────────────────────────────────────────────────

/// Local disk plus the `git` CLI.
///
/// `credentials`, when present, is the path of an SSH private key used for
/// the remote operations.
#[derive(Debug, Clone)]
pub struct GitFileStore {
    git_path: PathBuf,
    commit_message: String,
}

impl Default for GitFileStore {
    fn default() -> Self {
        Self {
            git_path: PathBuf::from("git"),
            commit_message: "Update collaboration session".to_string(),
        }
    }
}

impl GitFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_commit_message(mut self, message: impl Into<String>) -> Self {
        self.commit_message = message.into();
        self
    }

    fn command(&self, root: &Path, credentials: Option<&str>) -> Command {
        let mut cmd = Command::new(&self.git_path);
        cmd.current_dir(root);
        if let Some(key) = credentials.filter(|k| !k.is_empty()) {
            cmd.env(
                "GIT_SSH_COMMAND",
                format!("ssh -i \"{key}\" -o IdentitiesOnly=yes -o StrictHostKeyChecking=accept-new"),
            );
        }
        cmd
    }

    async fn git(&self, root: &Path, credentials: Option<&str>, args: &[&str]) -> FileStoreResult<String> {
        log::debug!("git {} (in {})", args.join(" "), root.display());
        let output = self.command(root, credentials).args(args).output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // `git commit` with a clean tree reports on stdout and exits 1
            if args.first() == Some(&"commit") && stdout.contains("nothing to commit") {
                return Ok(stdout);
            }
            return Err(FileStoreError::Git {
                command: args.join(" "),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(stdout)
    }
}

#[async_trait]
impl FileStoreSync for GitFileStore {
    async fn pull(&self, root: &Path, credentials: Option<&str>) -> FileStoreResult<()> {
        self.git(root, credentials, &["pull", "--no-edit"]).await?;
        Ok(())
    }

    async fn push(&self, root: &Path, credentials: Option<&str>) -> FileStoreResult<()> {
        self.git(root, credentials, &["add", "-A"]).await?;
        self.git(root, credentials, &["commit", "-m", &self.commit_message]).await?;
        self.git(root, credentials, &["push"]).await?;
        Ok(())
    }

    async fn read_file(&self, path: &Path) -> FileStoreResult<Vec<u8>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FileStoreError::NotFound(path.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(&self, path: &Path, bytes: &[u8]) -> FileStoreResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────
// In-memory store
// ─────────────────────────────────────────────────────────────────

type FileMap = Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>;

/// Shared "remote" that in-memory working trees pull from and push to.
#[derive(Clone, Default)]
pub struct MemoryRemote {
    files: FileMap,
    pushes: Arc<AtomicU64>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh, empty working tree attached to this remote.
    pub fn checkout(&self) -> MemoryFileStore {
        MemoryFileStore {
            remote: self.clone(),
            local: FileMap::default(),
            writes: Arc::new(Mutex::new(HashMap::new())),
            fail_push: Arc::new(AtomicBool::new(false)),
            fail_pull: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Seed the remote directly.
    pub fn insert(&self, path: impl Into<PathBuf>, bytes: Vec<u8>) {
        lock(&self.files).insert(path.into(), bytes);
    }

    pub fn get(&self, path: &Path) -> Option<Vec<u8>> {
        lock(&self.files).get(path).cloned()
    }

    pub fn push_count(&self) -> u64 {
        self.pushes.load(Ordering::Relaxed)
    }
}

/// One peer's working tree over a [`MemoryRemote`].
#[derive(Clone)]
pub struct MemoryFileStore {
    remote: MemoryRemote,
    local: FileMap,
    writes: Arc<Mutex<HashMap<PathBuf, u64>>>,
    fail_push: Arc<AtomicBool>,
    fail_pull: Arc<AtomicBool>,
}

impl MemoryFileStore {
    /// Standalone store with its own private remote.
    pub fn new() -> Self {
        MemoryRemote::new().checkout()
    }

    pub fn remote(&self) -> &MemoryRemote {
        &self.remote
    }

    /// Make subsequent pushes fail.
    pub fn set_push_failure(&self, fail: bool) {
        self.fail_push.store(fail, Ordering::Relaxed);
    }

    /// Make subsequent pulls fail.
    pub fn set_pull_failure(&self, fail: bool) {
        self.fail_pull.store(fail, Ordering::Relaxed);
    }

    /// Local contents of `path` without going through the trait.
    pub fn get(&self, path: &Path) -> Option<Vec<u8>> {
        lock(&self.local).get(path).cloned()
    }

    /// Number of `write_file` calls for `path`.
    pub fn write_count(&self, path: &Path) -> u64 {
        lock(&self.writes).get(path).copied().unwrap_or(0)
    }

    /// Number of `write_file` calls for any path except those under `exclude`.
    pub fn total_writes_excluding(&self, exclude: &[&Path]) -> u64 {
        lock(&self.writes)
            .iter()
            .filter(|(path, _)| !exclude.iter().any(|e| path.as_path() == *e))
            .map(|(_, count)| count)
            .sum()
    }
}

impl Default for MemoryFileStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileStoreSync for MemoryFileStore {
    async fn pull(&self, root: &Path, _credentials: Option<&str>) -> FileStoreResult<()> {
        if self.fail_pull.load(Ordering::Relaxed) {
            return Err(FileStoreError::Io(std::io::Error::other("remote unreachable")));
        }
        let incoming = scoped(&self.remote.files, root);
        lock(&self.local).extend(incoming);
        Ok(())
    }

    async fn push(&self, root: &Path, _credentials: Option<&str>) -> FileStoreResult<()> {
        if self.fail_push.load(Ordering::Relaxed) {
            return Err(FileStoreError::PushRejected("remote unreachable".into()));
        }
        let outgoing = scoped(&self.local, root);
        lock(&self.remote.files).extend(outgoing);
        self.remote.pushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn read_file(&self, path: &Path) -> FileStoreResult<Vec<u8>> {
        self.get(path)
            .ok_or_else(|| FileStoreError::NotFound(path.to_path_buf()))
    }

    async fn write_file(&self, path: &Path, bytes: &[u8]) -> FileStoreResult<()> {
        lock(&self.local).insert(path.to_path_buf(), bytes.to_vec());
        *lock(&self.writes).entry(path.to_path_buf()).or_insert(0) += 1;
        Ok(())
    }
}

/// Copy of every entry under `root`, taken without holding the lock afterwards.
fn scoped(files: &FileMap, root: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    lock(files)
        .iter()
        .filter(|(path, _)| path.starts_with(root))
        .map(|(path, bytes)| (path.clone(), bytes.clone()))
        .collect()
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
