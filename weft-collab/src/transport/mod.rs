//! Peer transport abstraction.
//!
//! A session is a star around the host: guests hold one link to the host,
//! the host holds one link per guest. [`PeerTransport::broadcast`] reaches
//! every other member of the caller's session (the transport relays guest
//! traffic through the host), so document code never forwards packets
//! itself.
//!
//! ```text
//!            ┌──────── Host ────────┐
//!            │          ▲           │
//!   Sync ◄───┘          │ Sync      └───► Sync
//!  Guest B          Guest A            Guest C
//! ```

pub mod memory;
pub mod ws;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::protocol::{PeerId, ProtocolError, SyncPacket};

pub use memory::{MemoryNetwork, MemoryTransport};
pub use ws::WsTransport;

/// Events surfaced by a transport to its single consumer, the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A link to `PeerId` came up.
    PeerConnected(PeerId),
    /// A link to `PeerId` went away.
    PeerDisconnected(PeerId),
    /// A guest asked us (the host) to admit it.
    JoinRequested(PeerId),
    /// The host admitted us and shipped its project snapshot.
    JoinAccepted { host_id: PeerId, snapshot: Vec<u8> },
    /// The host refused us.
    JoinRejected(PeerId),
    /// Our host's link dropped.
    HostDisconnected(PeerId),
    /// Document update or heartbeat from a session member.
    Sync { from: PeerId, packet: SyncPacket },
    /// A session member asked for the full state of `path`.
    SyncRequested { from: PeerId, path: String },
    /// A new local listen address became available.
    AddressAdded(String),
}

/// Transport errors. Never fatal to a session; the next heartbeat or
/// negotiation cycle retries.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Peer unreachable: {0}")]
    Unreachable(String),
    #[error("No pending join request from {0}")]
    NotPending(PeerId),
    #[error("Transport closed")]
    Closed,
    #[error("Network identity not ready")]
    NotReady,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(String),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

pub type TransportResult<T> = Result<T, TransportError>;

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::WebSocket(e.to_string())
    }
}

/// Point-to-point messaging and presence between peers.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Local identity, `None` until the transport is ready.
    fn local_peer_id(&self) -> Option<PeerId>;

    /// Addresses other peers can dial to reach us.
    fn addresses(&self) -> Vec<String>;

    /// Number of live links.
    fn connected_peers(&self) -> usize;

    /// Event stream. Subscribe before driving the transport; earlier events
    /// are not replayed.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Ask `host` (reachable at `addrs`) to admit us.
    async fn send_join_request(&self, host: &PeerId, addrs: &[String]) -> TransportResult<()>;

    /// Admit a pending guest, handing it `snapshot`.
    async fn approve_join(&self, peer: &PeerId, snapshot: Vec<u8>) -> TransportResult<()>;

    /// Refuse a pending guest.
    async fn reject_join(&self, peer: &PeerId) -> TransportResult<()>;

    /// Deliver `packet` to every other session member. Returns the number of
    /// recipients it was handed to.
    async fn broadcast(&self, packet: SyncPacket) -> TransportResult<usize>;

    /// Ask session members for the full state of `path`.
    async fn request_file_sync(&self, path: &str) -> TransportResult<()>;
}
