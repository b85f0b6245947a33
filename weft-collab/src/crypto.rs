//! Passphrase-derived encryption for session metadata.
//!
//! ```text
//! password ──PBKDF2-HMAC-SHA256(fixed salt, N rounds)──► 256-bit key
//!
//! encrypt: hex(nonce[12]) ":" base64(AES-256-GCM(ciphertext ‖ tag))
//! ```
//!
//! The salt is fixed so every peer holding the password derives the same key
//! without any extra exchange. A validation token (the encryption of a known
//! constant) lets a peer check a password before trusting decrypted addresses.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use crate::config::VaultConfig;

/// Salt shared by every peer.
pub const KEY_SALT: &[u8] = b"COLLAB_FIXED_SALT_V1";

/// Plaintext sealed inside every validation token.
pub const VALIDATION_PLAINTEXT: &str = "COLLAB_ACCESS_GRANTED_V1";

const NONCE_LEN: usize = 12;

/// Derived AES-256 key.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Crypto errors.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    Encryption(String),
    #[error("Decryption failed: {0}")]
    Decryption(String),
    #[error("Preferences I/O error: {0}")]
    Preferences(#[from] std::io::Error),
    #[error("Preferences format error: {0}")]
    PreferencesFormat(#[from] serde_json::Error),
}

pub type CryptoResult<T> = Result<T, CryptoError>;

/// Derive the session key for `password`.
pub fn derive_key(password: &str, iterations: u32) -> SessionKey {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), KEY_SALT, iterations, &mut key);
    SessionKey(key)
}

/// Encrypt `plaintext` under `key` with a fresh random nonce.
pub fn encrypt(plaintext: &str, key: &SessionKey) -> CryptoResult<String> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
    let nonce_bytes: [u8; NONCE_LEN] = rand::random();
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    Ok(format!(
        "{}:{}",
        hex::encode(nonce_bytes),
        general_purpose::STANDARD.encode(ciphertext)
    ))
}

/// Decrypt a `hex(nonce):base64(ciphertext)` string.
pub fn decrypt(encoded: &str, key: &SessionKey) -> CryptoResult<String> {
    let (nonce_hex, body) = encoded
        .split_once(':')
        .ok_or_else(|| CryptoError::Decryption("missing nonce separator".into()))?;

    let nonce_bytes =
        hex::decode(nonce_hex).map_err(|e| CryptoError::Decryption(format!("invalid nonce: {e}")))?;
    if nonce_bytes.len() != NONCE_LEN {
        return Err(CryptoError::Decryption(format!(
            "nonce must be {NONCE_LEN} bytes, got {}",
            nonce_bytes.len()
        )));
    }
    let ciphertext = general_purpose::STANDARD
        .decode(body)
        .map_err(|e| CryptoError::Decryption(format!("invalid base64: {e}")))?;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
        .map_err(|_| CryptoError::Decryption("authentication failed".into()))?;

    String::from_utf8(plaintext).map_err(|_| CryptoError::Decryption("plaintext is not UTF-8".into()))
}

/// Encrypt the known validation constant.
pub fn generate_validation_token(key: &SessionKey) -> CryptoResult<String> {
    encrypt(VALIDATION_PLAINTEXT, key)
}

/// True iff `token` decrypts under `key` to the validation constant.
pub fn validate_token(token: &str, key: &SessionKey) -> bool {
    matches!(decrypt(token, key), Ok(plain) if plain == VALIDATION_PLAINTEXT)
}

#[derive(Clone)]
struct ActiveKey {
    password: String,
    key: SessionKey,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyPreferences {
    #[serde(default)]
    session_password: Option<String>,
}

/// Holds at most one active key for the running session.
pub struct CryptoVault {
    config: VaultConfig,
    active: RwLock<Option<ActiveKey>>,
}

impl CryptoVault {
    pub fn new(config: VaultConfig) -> Self {
        Self {
            config,
            active: RwLock::new(None),
        }
    }

    pub fn iterations(&self) -> u32 {
        self.config.iterations
    }

    pub fn derive_key(&self, password: &str) -> SessionKey {
        derive_key(password, self.config.iterations)
    }

    /// Encrypt with the active key, if any.
    pub fn encrypt_active(&self, plaintext: &str) -> Option<CryptoResult<String>> {
        self.active_key().map(|key| encrypt(plaintext, &key))
    }

    /// Install `password` as the active key.
    ///
    /// When a preferences path is configured the password is remembered there
    /// too; a failed write is logged and otherwise ignored.
    pub fn set_key(&self, password: &str) -> SessionKey {
        let key = self.derive_key(password);
        self.install(password, key.clone());
        if let Some(path) = &self.config.preferences_path {
            if let Err(e) = store_preferences(path, Some(password)) {
                log::warn!("Failed to remember session key: {e}");
            }
        }
        key
    }

    /// Install an already-derived key (skips the preferences file).
    pub fn install(&self, password: &str, key: SessionKey) {
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        *active = Some(ActiveKey {
            password: password.to_string(),
            key,
        });
    }

    /// Forget the active key and any remembered password.
    pub fn clear_key(&self) {
        self.active.write().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(path) = &self.config.preferences_path {
            if let Err(e) = store_preferences(path, None) {
                log::warn!("Failed to clear remembered session key: {e}");
            }
        }
    }

    pub fn active_key(&self) -> Option<SessionKey> {
        let active = self.active.read().unwrap_or_else(PoisonError::into_inner);
        active.as_ref().map(|a| a.key.clone())
    }

    pub fn active_password(&self) -> Option<String> {
        let active = self.active.read().unwrap_or_else(PoisonError::into_inner);
        active.as_ref().map(|a| a.password.clone())
    }

    pub fn has_key(&self) -> bool {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Restore a remembered password from the preferences file.
    ///
    /// Returns `Ok(true)` if a key was installed.
    pub fn load_preferences(&self) -> CryptoResult<bool> {
        let Some(path) = &self.config.preferences_path else {
            return Ok(false);
        };
        if !path.exists() {
            return Ok(false);
        }
        let prefs: KeyPreferences = serde_json::from_slice(&std::fs::read(path)?)?;
        match prefs.session_password {
            Some(password) if !password.is_empty() => {
                let key = self.derive_key(&password);
                self.install(&password, key);
                log::debug!("Restored remembered session key from {}", path.display());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

impl fmt::Debug for CryptoVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoVault")
            .field("iterations", &self.config.iterations)
            .field("has_key", &self.has_key())
            .finish()
    }
}

fn store_preferences(path: &Path, password: Option<&str>) -> CryptoResult<()> {
    let prefs = KeyPreferences {
        session_password: password.map(str::to_string),
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, serde_json::to_vec_pretty(&prefs)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(password: &str) -> SessionKey {
        derive_key(password, 1_000)
    }

    #[test]
    fn test_derivation_is_deterministic() {
        assert_eq!(key("hunter2"), key("hunter2"));
        assert_ne!(key("hunter2"), key("hunter3"));
    }

    #[test]
    fn test_encrypt_decrypt() {
        let k = key("secret");
        let sealed = encrypt("ws://10.0.0.4:7000", &k).unwrap();
        assert_eq!(decrypt(&sealed, &k).unwrap(), "ws://10.0.0.4:7000");
    }

    #[test]
    fn test_ciphertext_format() {
        let sealed = encrypt("payload", &key("secret")).unwrap();
        let (nonce, body) = sealed.split_once(':').unwrap();
        assert_eq!(nonce.len(), 24);
        assert!(hex::decode(nonce).is_ok());
        // 7 bytes plaintext + 16 bytes tag
        assert_eq!(general_purpose::STANDARD.decode(body).unwrap().len(), 23);
    }

    #[test]
    fn test_nonce_is_fresh() {
        let k = key("secret");
        assert_ne!(encrypt("same", &k).unwrap(), encrypt("same", &k).unwrap());
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = encrypt("payload", &key("right")).unwrap();
        assert!(matches!(decrypt(&sealed, &key("wrong")), Err(CryptoError::Decryption(_))));
    }

    #[test]
    fn test_malformed_inputs() {
        let k = key("secret");
        assert!(decrypt("no-separator", &k).is_err());
        assert!(decrypt("zz:AAAA", &k).is_err());
        assert!(decrypt("00ff:AAAA", &k).is_err());
        assert!(decrypt("000000000000000000000000:!!!", &k).is_err());
        assert!(decrypt("", &k).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let k = key("secret");
        let sealed = encrypt("payload", &k).unwrap();
        let (nonce, body) = sealed.split_once(':').unwrap();
        let mut raw = general_purpose::STANDARD.decode(body).unwrap();
        raw[0] ^= 0x01;
        let tampered = format!("{nonce}:{}", general_purpose::STANDARD.encode(raw));
        assert!(decrypt(&tampered, &k).is_err());
    }

    #[test]
    fn test_validation_token() {
        let k = key("secret");
        let token = generate_validation_token(&k).unwrap();
        assert!(validate_token(&token, &k));
        assert!(!validate_token(&token, &key("other")));
        assert!(!validate_token("", &k));
        assert!(!validate_token("garbage", &k));

        let not_a_token = encrypt("something else", &k).unwrap();
        assert!(!validate_token(&not_a_token, &k));
    }

    #[test]
    fn test_vault_active_key() {
        let vault = CryptoVault::new(VaultConfig::for_testing());
        assert!(!vault.has_key());
        assert!(vault.encrypt_active("x").is_none());

        let k = vault.set_key("pw");
        assert!(vault.has_key());
        assert_eq!(vault.active_key(), Some(k.clone()));
        assert_eq!(vault.active_password().as_deref(), Some("pw"));

        let sealed = vault.encrypt_active("x").unwrap().unwrap();
        assert_eq!(decrypt(&sealed, &k).unwrap(), "x");

        vault.clear_key();
        assert!(!vault.has_key());
    }

    #[test]
    fn test_debug_redacts_key() {
        let rendered = format!("{:?}", key("secret"));
        assert_eq!(rendered, "SessionKey(..)");
    }

    #[test]
    fn test_preferences_remember_key() {
        let dir = tempfile::tempdir().unwrap();
        let config = VaultConfig {
            preferences_path: Some(dir.path().join("prefs").join("key.json")),
            ..VaultConfig::for_testing()
        };

        let first = CryptoVault::new(config.clone());
        let k = first.set_key("remembered");

        let second = CryptoVault::new(config.clone());
        assert!(second.load_preferences().unwrap());
        assert_eq!(second.active_key(), Some(k));

        second.clear_key();
        let third = CryptoVault::new(config);
        assert!(!third.load_preferences().unwrap());
        assert!(!third.has_key());
    }

    #[test]
    fn test_preferences_absent() {
        let vault = CryptoVault::new(VaultConfig::for_testing());
        assert!(!vault.load_preferences().unwrap());
    }
}
