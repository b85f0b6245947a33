//! # weft-collab: Serverless collaborative session engine
//!
//! A small group of peers edits one project without a dedicated server. One
//! peer is elected host: it persists documents and admits newcomers. The
//! others are guests whose edits merge through Yrs CRDT documents.
//!
//! ## Architecture
//!
//! ```text
//!   ┌────────────────────┐   pull/push   ┌──────────────────┐
//!   │ SessionCoordinator │ ◄───────────► │ FileStoreSync    │
//!   │ role, heartbeat,   │  .collab_meta │ (git / memory)   │
//!   │ takeover           │               └──────────────────┘
//!   └──┬──────────────┬──┘
//!      │ role gate    │ events
//!      ▼              ▼
//!   ┌──────────────┐ ┌──────────────────┐
//!   │ DocumentStore│◄┤ PeerTransport    │
//!   │ path → Doc   │─►(ws / memory)     │
//!   └──────────────┘ └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`session`]: host negotiation, takeover, join admission
//! - [`documents`]: per-path CRDT registry with host-gated persistence
//! - [`heartbeat`]: host liveness timers
//! - [`metadata`]: the persisted session contract
//! - [`crypto`]: passphrase-derived AES-GCM and validation tokens
//! - [`protocol`]: wire packets and project snapshots
//! - [`transport`]: peer transports (in-process and WebSocket)
//! - [`filestore`]: metadata distribution (git and in-memory)

pub mod config;
pub mod crypto;
pub mod documents;
pub mod filestore;
pub mod heartbeat;
pub mod metadata;
pub mod plugins;
pub mod prompt;
pub mod protocol;
pub mod session;
pub mod status;
pub mod transport;

// Re-exports for convenience
pub use config::{DocumentConfig, SessionConfig, TransportConfig, VaultConfig, METADATA_FILENAME};
pub use crypto::{CryptoError, CryptoVault, SessionKey};
pub use documents::{DocChange, DocumentError, DocumentStats, DocumentStore, UpdateOrigin};
pub use filestore::{FileStoreError, FileStoreSync, GitFileStore, MemoryFileStore, MemoryRemote};
pub use heartbeat::{DeadHost, Heartbeat, HeartbeatMode};
pub use metadata::{HostAddrs, SessionMetadata};
pub use plugins::{PluginRegistry, StaticPlugins};
pub use prompt::{NoPrompt, PasswordPrompt};
pub use protocol::{PeerId, ProjectSnapshot, ProtocolError, SyncPacket, HEARTBEAT_PATH};
pub use session::{NegotiationOutcome, Services, SessionCoordinator, SessionError, SessionResult};
pub use status::{SessionEvent, SessionRole, SessionStatus, StatusReport};
pub use transport::{
    MemoryNetwork, MemoryTransport, PeerTransport, TransportError, TransportEvent, WsTransport,
};
