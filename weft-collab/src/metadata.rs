//! The persisted session contract, `<root>/.collab_meta.json`.
//!
//! ```json
//! {
//!   "hostId": "3f0c…",
//!   "hostAddrs": ["ws://10.0.0.4:7000"],   // or a sealed string when encrypted
//!   "encrypted": false,
//!   "securityCheck": "",
//!   "requiredPlugins": ["mermaid"]
//! }
//! ```
//!
//! Any peer may read or overwrite it; it travels between peers only through
//! file store pull/push. A missing or unparseable file means "unclaimed".

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::crypto::{self, CryptoError, CryptoResult, SessionKey};
use crate::filestore::{FileStoreResult, FileStoreSync};
use crate::protocol::PeerId;

/// Host addresses, in the clear or sealed under the session key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HostAddrs {
    Plain(Vec<String>),
    /// `encrypt(json(addresses))`
    Sealed(String),
}

impl Default for HostAddrs {
    fn default() -> Self {
        HostAddrs::Plain(Vec::new())
    }
}

impl HostAddrs {
    /// Seal `addrs` under `key`, or leave them plain without one.
    pub fn seal(addrs: &[String], key: Option<&SessionKey>) -> CryptoResult<Self> {
        match key {
            Some(key) => {
                let json = serde_json::to_string(addrs)
                    .map_err(|e| CryptoError::Encryption(e.to_string()))?;
                Ok(HostAddrs::Sealed(crypto::encrypt(&json, key)?))
            }
            None => Ok(HostAddrs::Plain(addrs.to_vec())),
        }
    }

    /// Recover the address list.
    pub fn open(&self, key: Option<&SessionKey>) -> CryptoResult<Vec<String>> {
        match self {
            HostAddrs::Plain(addrs) => Ok(addrs.clone()),
            HostAddrs::Sealed(sealed) => {
                let key = key.ok_or_else(|| CryptoError::Decryption("no session key".into()))?;
                let json = crypto::decrypt(sealed, key)?;
                serde_json::from_str(&json)
                    .map_err(|e| CryptoError::Decryption(format!("sealed addresses are not a list: {e}")))
            }
        }
    }
}

/// Session contract record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    #[serde(default)]
    pub host_id: Option<PeerId>,
    #[serde(default)]
    pub host_addrs: HostAddrs,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub security_check: String,
    #[serde(default)]
    pub required_plugins: Vec<String>,
}

impl SessionMetadata {
    pub fn path(root: &Path, filename: &str) -> PathBuf {
        root.join(filename)
    }

    /// Whether the record names a host.
    pub fn is_claimed(&self) -> bool {
        self.host_id.as_deref().is_some_and(|id| !id.is_empty())
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    /// Read the record at `path`. Absent or corrupt files yield `None`.
    pub async fn read(files: &dyn FileStoreSync, path: &Path) -> Option<Self> {
        let bytes = match files.read_file(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                log::debug!("No session metadata at {}: {e}", path.display());
                return None;
            }
        };
        match Self::parse(&bytes) {
            Ok(meta) => Some(meta),
            Err(e) => {
                log::debug!("Ignoring corrupt session metadata at {}: {e}", path.display());
                None
            }
        }
    }

    pub async fn write(&self, files: &dyn FileStoreSync, path: &Path) -> FileStoreResult<()> {
        let json = self.to_json().map_err(std::io::Error::other)?;
        files.write_file(path, &json).await
    }
}
