//! Wire types shared by every transport.
//!
//! Document traffic is a flat `{path, data}` packet. The reserved path
//! [`HEARTBEAT_PATH`] marks a host liveness beat and carries no data; every
//! other path carries either a Yrs update or raw asset bytes, told apart by
//! the file extension (see [`is_asset_path`]).
//!
//! Peer-to-peer frames (join handshake, sync traffic) are bincode-encoded:
//! ```text
//! ┌───────────┬──────────────────────────────────────────────┐
//! │ variant   │ body                                         │
//! │ varint    │ JoinRequest{peer_id} | JoinAccepted{..} | …  │
//! └───────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Join snapshots are a bincode map of `path → full Yrs state`, LZ4
//! compressed with the uncompressed size prepended.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Opaque, stable peer identifier assigned by the transport.
pub type PeerId = String;

/// Reserved sync path used for host heartbeats.
pub const HEARTBEAT_PATH: &str = ".heartbeat";

/// File extensions that bypass CRDT merge and travel as raw bytes.
pub const ASSET_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "svg", "webp", "ico", "bmp", "pdf"];

/// Whether `path` names a binary asset (case-insensitive extension match).
pub fn is_asset_path(path: &str) -> bool {
    match path.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.contains(['/', '\\']) => {
            let ext = ext.to_ascii_lowercase();
            ASSET_EXTENSIONS.contains(&ext.as_str())
        }
        _ => false,
    }
}

/// Document sync payload: one update (or asset body) for one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPacket {
    pub path: String,
    pub data: Vec<u8>,
}

impl SyncPacket {
    /// Create an update packet for `path`.
    pub fn update(path: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            data,
        }
    }

    /// Create a zero-payload heartbeat.
    pub fn heartbeat() -> Self {
        Self {
            path: HEARTBEAT_PATH.to_string(),
            data: Vec::new(),
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.path == HEARTBEAT_PATH
    }
}

/// Frames exchanged between two connected peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Guest asks the host to admit it.
    JoinRequest { peer_id: PeerId },
    /// Host admits the guest and ships its project snapshot.
    JoinAccepted { host_id: PeerId, snapshot: Vec<u8> },
    /// Host refuses the guest.
    JoinRejected { host_id: PeerId },
    /// Document update or heartbeat.
    Sync(SyncPacket),
    /// Ask the receiver for the full state of one document.
    RequestSync { path: String },
}

impl Frame {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }
}

/// Largest uncompressed snapshot a peer will accept.
pub const MAX_SNAPSHOT_SIZE: usize = 256 * 1024 * 1024;

/// Upper bound on the LZ4 block expansion ratio.
const LZ4_MAX_RATIO: usize = 256;

/// Full project state handed to a guest when the host admits it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    /// Relative path → full Yrs state (`encode_state_as_update_v1`).
    pub documents: BTreeMap<String, Vec<u8>>,
}

impl ProjectSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, state: Vec<u8>) {
        self.documents.insert(path.into(), state);
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// bincode, then LZ4 with the uncompressed size prepended.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let raw = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    /// Inverse of [`encode`](Self::encode). The prepended size is checked
    /// before anything is allocated for it.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let Some((prefix, body)) = bytes.split_first_chunk::<4>() else {
            return Err(ProtocolError::Compression("missing size prefix".into()));
        };
        let size = u32::from_le_bytes(*prefix) as usize;
        let limit = MAX_SNAPSHOT_SIZE.min(body.len().saturating_mul(LZ4_MAX_RATIO) + 64);
        if size > limit {
            return Err(ProtocolError::TooLarge { size, limit });
        }
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| ProtocolError::Compression(e.to_string()))?;
        let (snapshot, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(snapshot)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Snapshot claims {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_packet() {
        let beat = SyncPacket::heartbeat();
        assert!(beat.is_heartbeat());
        assert!(beat.data.is_empty());
        assert!(!SyncPacket::update("notes.md", vec![1]).is_heartbeat());
    }

    #[test]
    fn test_asset_detection() {
        assert!(is_asset_path("img/logo.png"));
        assert!(is_asset_path("Photo.JPG"));
        assert!(is_asset_path("diagram.svg"));
        assert!(!is_asset_path("notes.md"));
        assert!(!is_asset_path("png"));
        assert!(!is_asset_path(".png"));
        assert!(!is_asset_path("dir.png/readme"));
        assert!(!is_asset_path(HEARTBEAT_PATH));
    }

    #[test]
    fn test_sync_frame_survives_encoding() {
        let frame = Frame::Sync(SyncPacket::update("src/main.md", vec![7, 8, 9]));
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_join_accepted_carries_snapshot() {
        let mut snapshot = ProjectSnapshot::new();
        snapshot.insert("a.md", vec![1, 2, 3]);
        snapshot.insert("b.md", vec![4; 2048]);
        let frame = Frame::JoinAccepted {
            host_id: "host".into(),
            snapshot: snapshot.encode().unwrap(),
        };

        match Frame::decode(&frame.encode().unwrap()).unwrap() {
            Frame::JoinAccepted { host_id, snapshot: bytes } => {
                assert_eq!(host_id, "host");
                let restored = ProjectSnapshot::decode(&bytes).unwrap();
                assert_eq!(restored, snapshot);
            }
            other => panic!("Expected JoinAccepted, got {other:?}"),
        }
    }

    #[test]
    fn test_snapshot_compresses_repetitive_state() {
        let mut snapshot = ProjectSnapshot::new();
        snapshot.insert("big.md", vec![42u8; 64 * 1024]);
        let encoded = snapshot.encode().unwrap();
        assert!(encoded.len() < 4 * 1024, "encoded {} bytes", encoded.len());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(Frame::decode(&[0xFF, 0xFE, 0xFD]).is_err());
        assert!(ProjectSnapshot::decode(&[1, 2]).is_err());
    }

    #[test]
    fn test_snapshot_size_prefix_is_bounded() {
        let mut forged = u32::MAX.to_le_bytes().to_vec();
        forged.extend_from_slice(&[0x10, b'x']);
        assert!(matches!(
            ProjectSnapshot::decode(&forged),
            Err(ProtocolError::TooLarge { size, .. }) if size == u32::MAX as usize
        ));

        // A real snapshot with a high compression ratio still decodes
        let mut snapshot = ProjectSnapshot::new();
        snapshot.insert("big.md", vec![0u8; 1024 * 1024]);
        let encoded = snapshot.encode().unwrap();
        assert_eq!(ProjectSnapshot::decode(&encoded).unwrap(), snapshot);
    }
}
