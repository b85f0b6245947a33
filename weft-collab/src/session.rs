//! Session coordination: host election, liveness and takeover.
//!
//! State machine:
//! ```text
//!                 negotiate_host(root)
//!   idle ──────────────► negotiating ──── claim ────► connected (Host)
//!                            │
//!                            └── join request ──► syncing ──► connected (Guest)
//!                                                                   │
//!            host lost (heartbeat timeout / HostDisconnected)       │
//!   negotiating ◄───────────────────────────────────────────────────┘
//!        │ backoff, re-read metadata
//!        ├── someone else claimed ──► join them
//!        └── nobody did ────────────► claim
//! ```
//!
//! The election is "first to push wins" on the metadata file. There is no
//! lock around the file; a randomized backoff followed by a re-read is the
//! only protection, and a rare double claim resolves on the next pass.
//!
//! Every role change goes through [`SessionCoordinator::transition`], which
//! sets the document store's persistence gate and runs exactly one side of
//! the heartbeat.

use rand::Rng;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::AbortHandle;

use crate::config::SessionConfig;
use crate::crypto::{self, CryptoError, CryptoVault};
use crate::documents::{DocumentError, DocumentStore};
use crate::filestore::{FileStoreError, FileStoreSync};
use crate::heartbeat::{DeadHost, Heartbeat};
use crate::metadata::{HostAddrs, SessionMetadata};
use crate::plugins::PluginRegistry;
use crate::prompt::PasswordPrompt;
use crate::protocol::{PeerId, ProjectSnapshot, ProtocolError};
use crate::status::{SessionEvent, SessionRole, SessionStatus, StatusReport};
use crate::transport::{PeerTransport, TransportError, TransportEvent};

const DECRYPTION_PROMPT: &str = "🔒 Project Encrypted.\nEnter decryption key:";
const PUBLISH_WARNING: &str = "Session started, but failed to publish to remote. \
    Peers may not be able to discover you automatically.";

/// Session errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("No project root set")]
    NoProject,
    #[error("Network Identity not ready")]
    IdentityUnavailable,
    #[error("Missing required plugins: {}", missing.join(", "))]
    PluginMismatch { missing: Vec<String> },
    #[error("Decryption failed: {0}")]
    Decryption(#[from] CryptoError),
    #[error("Cancelled by user")]
    Cancelled,
    #[error("Key derivation task failed: {0}")]
    KeyDerivation(String),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Persistence error: {0}")]
    Persistence(#[from] FileStoreError),
    #[error("Document error: {0}")]
    Document(#[from] DocumentError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// What a negotiation pass ended in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationOutcome {
    /// This process is the host. `published` is false when the metadata
    /// could not be pushed and the session is local-only.
    Hosting { published: bool },
    /// A join request went out; `JoinAccepted` finishes the switch to guest.
    JoinRequested { host_id: PeerId },
    /// Another negotiation was already running.
    AlreadyNegotiating,
}

/// Collaborators injected into the coordinator.
#[derive(Clone)]
pub struct Services {
    pub transport: Arc<dyn PeerTransport>,
    pub files: Arc<dyn FileStoreSync>,
    pub documents: Arc<DocumentStore>,
    pub vault: Arc<CryptoVault>,
    pub prompt: Arc<dyn PasswordPrompt>,
    pub plugins: Arc<dyn PluginRegistry>,
}

struct SessionState {
    role: SessionRole,
    status: SessionStatus,
    message: Option<String>,
    host_id: Option<PeerId>,
    /// Host we asked to join and are waiting on.
    awaiting: Option<PeerId>,
    dead_host: DeadHost,
    /// Host we were attached to when it went silent.
    lost_host: Option<PeerId>,
    connected_peers: usize,
}

impl SessionState {
    fn is_dead(&self, id: &str) -> bool {
        self.dead_host.is(id)
            || (self.dead_host == DeadHost::HeartbeatTimeout && self.lost_host.as_deref() == Some(id))
    }
}

/// Resets the negotiation flag when a pass ends, however it ends.
struct NegotiationGuard<'a>(&'a AtomicBool);

impl Drop for NegotiationGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Owns the session role and drives everything that depends on it.
pub struct SessionCoordinator {
    config: SessionConfig,
    services: Services,
    me: Weak<SessionCoordinator>,
    state: Mutex<SessionState>,
    negotiating: AtomicBool,
    heartbeat: Mutex<Heartbeat>,
    pending_joins: Mutex<BTreeSet<PeerId>>,
    events: broadcast::Sender<SessionEvent>,
    pump: Mutex<Option<AbortHandle>>,
}

impl SessionCoordinator {
    /// Create the coordinator and start consuming transport events.
    ///
    /// Must be called inside a tokio runtime. The process starts as a
    /// local-only host with no timers running.
    pub fn new(config: SessionConfig, services: Services) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_capacity);
        let transport_rx = services.transport.subscribe();
        services.documents.set_role(true);
        let heartbeat = Heartbeat::new(config.heartbeat_interval, config.heartbeat_timeout);

        let coordinator = Arc::new_cyclic(|me| Self {
            config,
            services,
            me: me.clone(),
            state: Mutex::new(SessionState {
                role: SessionRole::Host,
                status: SessionStatus::Idle,
                message: None,
                host_id: None,
                awaiting: None,
                dead_host: DeadHost::None,
                lost_host: None,
                connected_peers: 0,
            }),
            negotiating: AtomicBool::new(false),
            heartbeat: Mutex::new(heartbeat),
            pending_joins: Mutex::new(BTreeSet::new()),
            events,
            pump: Mutex::new(None),
        });

        let task = tokio::spawn(Self::pump(Arc::downgrade(&coordinator), transport_rx));
        *lock(&coordinator.pump) = Some(task.abort_handle());
        coordinator
    }

    /// Subscribe to status, role and admission events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn documents(&self) -> &Arc<DocumentStore> {
        &self.services.documents
    }

    pub fn role(&self) -> SessionRole {
        self.state().role
    }

    pub fn host_id(&self) -> Option<PeerId> {
        self.state().host_id.clone()
    }

    pub fn dead_host(&self) -> DeadHost {
        self.state().dead_host.clone()
    }

    pub fn is_negotiating(&self) -> bool {
        self.negotiating.load(Ordering::SeqCst)
    }

    pub fn report(&self) -> StatusReport {
        let st = self.state();
        StatusReport {
            status: st.status,
            message: st.message.clone(),
            role: st.role,
            connected_peers: st.connected_peers,
            host_id: st.host_id.clone(),
        }
    }

    /// Join requests waiting for [`approve_join`](Self::approve_join).
    pub fn pending_joins(&self) -> Vec<PeerId> {
        lock(&self.pending_joins).iter().cloned().collect()
    }

    // ─────────────────────────────────────────────────────────────
    // Negotiation
    // ─────────────────────────────────────────────────────────────

    /// Open `root` and find out who hosts it: join the host named in the
    /// metadata, or become the host.
    ///
    /// A call made while another negotiation is running returns
    /// [`NegotiationOutcome::AlreadyNegotiating`] immediately.
    pub async fn negotiate_host(&self, root: impl Into<PathBuf>) -> SessionResult<NegotiationOutcome> {
        let Some(_guard) = self.begin_negotiation() else {
            log::debug!("Negotiation already in progress");
            return Ok(NegotiationOutcome::AlreadyNegotiating);
        };
        let root = root.into();
        if self.services.documents.project_root().as_deref() != Some(root.as_path()) {
            self.services.documents.set_project_root(Some(root.clone()));
        }

        let result = self.negotiate(&root).await;
        if let Err(e) = &result {
            log::warn!("Negotiation failed: {e}");
            if self.state().status != SessionStatus::Error {
                self.set_status(SessionStatus::Error, e.to_string());
            }
        }
        result
    }

    async fn negotiate(&self, root: &Path) -> SessionResult<NegotiationOutcome> {
        let Some(me) = self.services.transport.local_peer_id() else {
            self.set_status(SessionStatus::Error, "Network Identity not ready");
            return Err(SessionError::IdentityUnavailable);
        };
        self.set_status(SessionStatus::Negotiating, "Checking session...");

        let meta = self.fetch_metadata(root).await;
        if let Some(meta) = &meta {
            if meta.encrypted {
                if let Err(e) = self.handle_decryption(&meta.security_check).await {
                    let message = match e {
                        SessionError::Cancelled => "Decryption cancelled",
                        _ => "Decryption failed",
                    };
                    self.set_status(SessionStatus::Error, message);
                    return Err(e);
                }
            }
        }

        if let Some(meta) = meta {
            if let Some(host) = meta.host_id.clone().filter(|h| !h.is_empty()) {
                let dead = self.state().is_dead(&host);
                if host != me && !dead {
                    if let Some(outcome) = self.join_host(&host, &meta).await? {
                        return Ok(outcome);
                    }
                } else if dead {
                    log::info!("Metadata still names dead host {host}, claiming");
                }
            }
        }

        let published = self.claim_host(root, &me).await?;
        Ok(NegotiationOutcome::Hosting { published })
    }

    /// Pull, then read the metadata. Pull failures are not fatal.
    async fn fetch_metadata(&self, root: &Path) -> Option<SessionMetadata> {
        let credentials = self.config.credentials.as_deref();
        if let Err(e) = self.services.files.pull(root, credentials).await {
            log::warn!("Pull failed, using local metadata: {e}");
        }
        let path = self.metadata_path(root);
        SessionMetadata::read(self.services.files.as_ref(), &path).await
    }

    /// Resolve an encrypted session: the known key first, then the prompt
    /// until the token validates or the user cancels.
    async fn handle_decryption(&self, security_check: &str) -> SessionResult<()> {
        if let Some(key) = self.services.vault.active_key() {
            if crypto::validate_token(security_check, &key) {
                return Ok(());
            }
            log::debug!("Active key does not open this session");
        }

        loop {
            let answer = self.services.prompt.request_password(DECRYPTION_PROMPT).await;
            let Some(password) = answer.filter(|p| !p.is_empty()) else {
                log::info!("Decryption cancelled");
                return Err(SessionError::Cancelled);
            };

            let vault = self.services.vault.clone();
            let token = security_check.to_string();
            let accepted = run_blocking(move || {
                let key = vault.derive_key(&password);
                let ok = crypto::validate_token(&token, &key);
                if ok {
                    vault.install(&password, key);
                }
                ok
            })
            .await?;

            if accepted {
                log::info!("Session key accepted");
                return Ok(());
            }
            log::warn!("Incorrect session key");
            self.warn("Incorrect Key");
        }
    }

    /// Ask `host` to admit us. `Ok(None)` means the host could not be
    /// reached and has been recorded as dead.
    async fn join_host(&self, host: &PeerId, meta: &SessionMetadata) -> SessionResult<Option<NegotiationOutcome>> {
        let missing = self.services.plugins.missing_requirements(&meta.required_plugins);
        if !missing.is_empty() {
            self.set_status(SessionStatus::Error, "Missing required plugins");
            self.warn(format!(
                "This project requires plugins that are not enabled: {}",
                missing.join(", ")
            ));
            return Err(SessionError::PluginMismatch { missing });
        }

        let key = self.services.vault.active_key();
        let addrs = match meta.host_addrs.open(key.as_ref()) {
            Ok(addrs) => addrs,
            Err(e) => {
                self.set_status(SessionStatus::Error, "Failed to decrypt host addresses");
                return Err(e.into());
            }
        };

        self.set_status(SessionStatus::Negotiating, format!("Joining {}...", short(host)));
        self.state().awaiting = Some(host.clone());
        match self.services.transport.send_join_request(host, &addrs).await {
            Ok(()) => {
                log::info!("Join request sent to {host}");
                Ok(Some(NegotiationOutcome::JoinRequested { host_id: host.clone() }))
            }
            Err(e) => {
                log::warn!("Host {host} unreachable ({e}), claiming instead");
                let mut st = self.state();
                st.awaiting = None;
                st.dead_host = DeadHost::Peer(host.clone());
                Ok(None)
            }
        }
    }

    /// Become the host of `root` and publish the metadata.
    ///
    /// Returns whether the metadata reached the remote.
    async fn claim_host(&self, root: &Path, me: &PeerId) -> SessionResult<bool> {
        let meta = self.build_metadata(me)?;
        self.transition(SessionRole::Host, Some(me.clone()));
        self.set_status(SessionStatus::Negotiating, "Publishing session...");

        let published = match self.publish(root, &meta).await {
            Ok(()) => true,
            Err(e) => {
                log::error!("Failed to publish session metadata: {e}");
                self.warn(PUBLISH_WARNING);
                false
            }
        };
        log::info!("Hosting session for {} as {me}", root.display());
        self.set_status(SessionStatus::Connected, "Hosting Session");
        Ok(published)
    }

    fn build_metadata(&self, me: &PeerId) -> SessionResult<SessionMetadata> {
        let key = self.services.vault.active_key();
        let addrs = self.services.transport.addresses();
        let security_check = match &key {
            Some(key) => crypto::generate_validation_token(key)?,
            None => String::new(),
        };
        Ok(SessionMetadata {
            host_id: Some(me.clone()),
            host_addrs: HostAddrs::seal(&addrs, key.as_ref())?,
            encrypted: key.is_some(),
            security_check,
            required_plugins: self.services.plugins.enabled_plugins(),
        })
    }

    /// Pull, write the metadata, push.
    async fn publish(&self, root: &Path, meta: &SessionMetadata) -> SessionResult<()> {
        let files = self.services.files.as_ref();
        let credentials = self.config.credentials.as_deref();
        if let Err(e) = files.pull(root, credentials).await {
            log::warn!("Pull before publishing failed: {e}");
        }
        meta.write(files, &self.metadata_path(root)).await?;
        files.push(root, credentials).await?;
        log::debug!("Session metadata published");
        Ok(())
    }

    /// Rewrite the metadata with the current key, addresses and plugins.
    /// Only a connected host publishes; otherwise this is a no-op.
    pub async fn republish(&self) -> SessionResult<()> {
        let hosting = {
            let st = self.state();
            st.role.is_host() && st.status == SessionStatus::Connected
        };
        if !hosting || self.is_negotiating() {
            return Ok(());
        }
        let Some(root) = self.services.documents.project_root() else {
            return Ok(());
        };
        let me = self
            .services
            .transport
            .local_peer_id()
            .ok_or(SessionError::IdentityUnavailable)?;
        let meta = self.build_metadata(&me)?;
        self.publish(&root, &meta).await
    }

    /// Set or clear the session password. A host republishes right away so
    /// the metadata matches the new key.
    pub async fn set_encryption_key(&self, password: Option<&str>) -> SessionResult<()> {
        match password.filter(|p| !p.is_empty()) {
            Some(password) => {
                let vault = self.services.vault.clone();
                let password = password.to_string();
                // PBKDF2 blocks for a while
                run_blocking(move || vault.set_key(&password)).await?;
            }
            None => self.services.vault.clear_key(),
        }
        self.republish().await
    }

    /// Run negotiation again for the current project, e.g. after an error.
    pub async fn renegotiate(&self) -> SessionResult<NegotiationOutcome> {
        let root = self
            .services
            .documents
            .project_root()
            .ok_or(SessionError::NoProject)?;
        self.negotiate_host(root).await
    }

    // ─────────────────────────────────────────────────────────────
    // Takeover
    // ─────────────────────────────────────────────────────────────

    /// React to the host going away.
    ///
    /// Ignored while hosting, negotiating or in an error state.
    pub async fn handle_host_loss(&self, dead: DeadHost) {
        {
            let st = self.state();
            if st.role.is_host() || matches!(st.status, SessionStatus::Negotiating | SessionStatus::Error) {
                log::debug!("Ignoring host loss ({dead:?}) as {} / {}", st.role, st.status);
                return;
            }
        }
        let Some(_guard) = self.begin_negotiation() else {
            return;
        };

        lock(&self.heartbeat).stop();
        {
            let mut st = self.state();
            st.lost_host = st.host_id.take();
            st.awaiting = None;
            st.dead_host = dead.clone();
        }
        log::warn!("Host lost ({dead:?}), starting takeover");
        let me = self.services.transport.local_peer_id();

        let Some(root) = self.services.documents.project_root() else {
            self.transition(SessionRole::Host, me);
            self.set_status(SessionStatus::Error, "Host disconnected. No project to takeover.");
            return;
        };

        self.set_status(
            SessionStatus::Negotiating,
            "Host disconnected. Attempting to recover session...",
        );
        let backoff = self.backoff();
        log::debug!("Takeover backoff {backoff:?}");
        tokio::time::sleep(backoff).await;

        if let Err(e) = self.recover(&root).await {
            log::error!("Takeover failed: {e}");
            self.transition(SessionRole::Host, me);
            self.set_status(SessionStatus::Error, "Failed to recover session. You are now offline.");
        }
    }

    async fn recover(&self, root: &Path) -> SessionResult<NegotiationOutcome> {
        let me = self
            .services
            .transport
            .local_peer_id()
            .ok_or(SessionError::IdentityUnavailable)?;
        let meta = self.fetch_metadata(root).await;
        let new_host = meta
            .and_then(|m| m.host_id)
            .filter(|h| !h.is_empty() && *h != me && !self.state().is_dead(h));

        match new_host {
            Some(host) => {
                log::info!("{host} already took over, joining");
                self.set_status(SessionStatus::Negotiating, "Switching to new host...");
                self.negotiate(root).await
            }
            None => {
                let published = self.claim_host(root, &me).await?;
                Ok(NegotiationOutcome::Hosting { published })
            }
        }
    }

    /// Uniform draw from `[backoff_min, backoff_max]`.
    fn backoff(&self) -> Duration {
        let min = self.config.backoff_min.as_millis() as u64;
        let max = (self.config.backoff_max.as_millis() as u64).max(min);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    // ─────────────────────────────────────────────────────────────
    // Admission
    // ─────────────────────────────────────────────────────────────

    /// Admit `peer`, sending it a snapshot of every open document.
    pub async fn approve_join(&self, peer: &PeerId) -> SessionResult<()> {
        lock(&self.pending_joins).remove(peer);
        let snapshot = self.services.documents.snapshot();
        let bytes = snapshot.encode()?;
        self.services.transport.approve_join(peer, bytes).await?;
        log::info!("Admitted {peer} ({} documents)", snapshot.len());
        Ok(())
    }

    pub async fn reject_join(&self, peer: &PeerId) -> SessionResult<()> {
        lock(&self.pending_joins).remove(peer);
        self.services.transport.reject_join(peer).await?;
        log::info!("Rejected join request from {peer}");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────
    // Transport events
    // ─────────────────────────────────────────────────────────────

    async fn pump(me: Weak<Self>, mut rx: broadcast::Receiver<TransportEvent>) {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(n)) => {
                    log::warn!("Session lagged behind transport by {n} events");
                    continue;
                }
                Err(RecvError::Closed) => return,
            };
            let Some(this) = me.upgrade() else {
                return;
            };
            this.handle_transport_event(event).await;
        }
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Sync { from, packet } => {
                if packet.is_heartbeat() {
                    if !self.role().is_host() {
                        lock(&self.heartbeat).beat();
                    }
                    return;
                }
                log::trace!("Sync from {from}: {} ({} bytes)", packet.path, packet.data.len());
                if let Err(e) = self
                    .services
                    .documents
                    .apply_remote_update(&packet.path, &packet.data)
                    .await
                {
                    log::warn!("Dropping update for {} from {from}: {e}", packet.path);
                }
            }
            TransportEvent::SyncRequested { from, path } => {
                if self.services.documents.answer_sync_request(&path).await {
                    log::debug!("Answered sync request from {from} for {path}");
                }
            }
            TransportEvent::PeerConnected(peer) => {
                log::info!("Peer connected: {peer}");
                self.refresh_peer_count();
            }
            TransportEvent::PeerDisconnected(peer) => {
                log::info!("Peer disconnected: {peer}");
                self.refresh_peer_count();
            }
            TransportEvent::JoinRequested(peer) => self.on_join_requested(peer).await,
            TransportEvent::JoinAccepted { host_id, snapshot } => self.on_join_accepted(host_id, snapshot).await,
            TransportEvent::JoinRejected(host) => {
                let expected = self.state().awaiting.take();
                if expected.as_ref() == Some(&host) {
                    log::warn!("Join rejected by {host}");
                    self.set_status(SessionStatus::Error, "Join request rejected by host");
                }
            }
            TransportEvent::HostDisconnected(host) => {
                self.refresh_peer_count();
                if let Some(this) = self.me.upgrade() {
                    tokio::spawn(async move {
                        this.handle_host_loss(DeadHost::Peer(host)).await;
                    });
                }
            }
            TransportEvent::AddressAdded(addr) => {
                log::debug!("New local address {addr}");
                if let Err(e) = self.republish().await {
                    log::warn!("Failed to republish addresses: {e}");
                }
            }
        }
    }

    async fn on_join_requested(&self, peer: PeerId) {
        if !self.role().is_host() {
            log::debug!("Not hosting, rejecting join request from {peer}");
            let _ = self.services.transport.reject_join(&peer).await;
            return;
        }
        if self.config.auto_approve_joins {
            if let Err(e) = self.approve_join(&peer).await {
                log::warn!("Failed to admit {peer}: {e}");
            }
            return;
        }
        lock(&self.pending_joins).insert(peer.clone());
        log::info!("Join request from {peer}");
        let _ = self.events.send(SessionEvent::JoinRequested(peer));
    }

    async fn on_join_accepted(&self, host: PeerId, snapshot: Vec<u8>) {
        let awaited = self.state().awaiting.take();
        if awaited.as_ref() != Some(&host) {
            log::debug!("Ignoring unsolicited join acceptance from {host}");
            return;
        }

        self.transition(SessionRole::Guest, Some(host.clone()));
        self.set_status(SessionStatus::Syncing, "Joined! Syncing project...");

        let documents = &self.services.documents;
        match ProjectSnapshot::decode(&snapshot) {
            Ok(snapshot) => match documents.apply_snapshot(&snapshot).await {
                Ok(n) => log::debug!("Applied {n} documents from {host}"),
                Err(e) => log::warn!("Snapshot from {host} failed to apply: {e}"),
            },
            Err(e) => log::warn!("Unreadable snapshot from {host}: {e}"),
        }
        // Anything edited while no host was reachable goes to the new one
        documents.broadcast_all_states().await;

        self.refresh_peer_count();
        log::info!("Joined session hosted by {host}");
        self.set_status(SessionStatus::Connected, format!("Connected to {}", short(&host)));
    }

    // ─────────────────────────────────────────────────────────────
    // Role and status
    // ─────────────────────────────────────────────────────────────

    /// Switch role: persistence gate, heartbeat side, observable role.
    fn transition(&self, role: SessionRole, host_id: Option<PeerId>) {
        self.services.documents.set_role(role.is_host());
        {
            let mut heartbeat = lock(&self.heartbeat);
            match role {
                SessionRole::Host => heartbeat.start_emitter(self.services.transport.clone()),
                SessionRole::Guest => {
                    let me = self.me.clone();
                    heartbeat.start_listener(move || {
                        if let Some(this) = me.upgrade() {
                            tokio::spawn(async move {
                                this.handle_host_loss(DeadHost::HeartbeatTimeout).await;
                            });
                        }
                    });
                }
            }
        }
        let changed = {
            let mut st = self.state();
            let changed = st.role != role;
            st.role = role;
            st.host_id = host_id;
            changed
        };
        if changed {
            log::info!("Role changed to {role}");
            let _ = self.events.send(SessionEvent::RoleChanged(role));
        }
    }

    fn set_status(&self, status: SessionStatus, message: impl Into<String>) {
        let message = message.into();
        log::info!("Session {status}: {message}");
        {
            let mut st = self.state();
            st.status = status;
            st.message = Some(message);
        }
        let _ = self.events.send(SessionEvent::StatusChanged(self.report()));
    }

    fn refresh_peer_count(&self) {
        let count = self.services.transport.connected_peers();
        {
            let mut st = self.state();
            if st.connected_peers == count {
                return;
            }
            st.connected_peers = count;
        }
        let _ = self.events.send(SessionEvent::StatusChanged(self.report()));
    }

    fn warn(&self, message: impl Into<String>) {
        let _ = self.events.send(SessionEvent::Warning(message.into()));
    }

    /// Stop timers and event handling. The role is left as is.
    pub fn shutdown(&self) {
        lock(&self.heartbeat).stop();
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
        self.set_status(SessionStatus::Offline, "Session closed");
    }

    fn begin_negotiation(&self) -> Option<NegotiationGuard<'_>> {
        if self.negotiating.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(NegotiationGuard(&self.negotiating))
        }
    }

    fn metadata_path(&self, root: &Path) -> PathBuf {
        SessionMetadata::path(root, &self.config.metadata_filename)
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        lock(&self.state)
    }
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run CPU-bound key work off the runtime threads.
async fn run_blocking<T, F>(f: F) -> SessionResult<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        log::error!("Key derivation task failed: {e}");
        SessionError::KeyDerivation(e.to_string())
    })
}

fn short(id: &str) -> String {
    id.chars().take(8).collect()
}
