//! Tunables for every service in the crate.
//!
//! Each struct has production defaults and a `for_testing()` constructor
//! with short timers so scenario tests finish quickly.

use std::path::PathBuf;
use std::time::Duration;

/// Default file name of the persisted session contract.
pub const METADATA_FILENAME: &str = ".collab_meta.json";

/// Session coordinator configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Host heartbeat period (default: 1s)
    pub heartbeat_interval: Duration,
    /// Guest tolerance before declaring the host dead (default: 2.5s)
    pub heartbeat_timeout: Duration,
    /// Lower bound of the takeover backoff (default: 500ms)
    pub backoff_min: Duration,
    /// Upper bound of the takeover backoff (default: 2s)
    pub backoff_max: Duration,
    /// Metadata file name, relative to the project root
    pub metadata_filename: String,
    /// Credentials handed to the file store on pull/push
    pub credentials: Option<String>,
    /// Admit every join request without asking
    pub auto_approve_joins: bool,
    /// Session event channel capacity
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(1000),
            heartbeat_timeout: Duration::from_millis(2500),
            backoff_min: Duration::from_millis(500),
            backoff_max: Duration::from_millis(2000),
            metadata_filename: METADATA_FILENAME.to_string(),
            credentials: None,
            auto_approve_joins: false,
            event_capacity: 256,
        }
    }
}

impl SessionConfig {
    /// Create config for testing (short timers, auto-approve).
    pub fn for_testing() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(50),
            heartbeat_timeout: Duration::from_millis(150),
            backoff_min: Duration::from_millis(10),
            backoff_max: Duration::from_millis(40),
            auto_approve_joins: true,
            ..Self::default()
        }
    }

    /// Pin the takeover backoff to a single value.
    pub fn with_fixed_backoff(mut self, backoff: Duration) -> Self {
        self.backoff_min = backoff;
        self.backoff_max = backoff;
        self
    }
}

/// Document store configuration.
#[derive(Debug, Clone)]
pub struct DocumentConfig {
    /// Quiet window before a dirty document is flushed (default: 1s)
    pub save_debounce: Duration,
    /// Change event channel capacity
    pub event_capacity: usize,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            save_debounce: Duration::from_millis(1000),
            event_capacity: 256,
        }
    }
}

impl DocumentConfig {
    pub fn for_testing() -> Self {
        Self {
            save_debounce: Duration::from_millis(20),
            event_capacity: 256,
        }
    }
}

/// Crypto vault configuration.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    /// PBKDF2 rounds (default: 100 000)
    pub iterations: u32,
    /// Local file remembering the active password (None = never persisted)
    pub preferences_path: Option<PathBuf>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            iterations: 100_000,
            preferences_path: None,
        }
    }
}

impl VaultConfig {
    /// Cheap key derivation for tests.
    pub fn for_testing() -> Self {
        Self {
            iterations: 1_000,
            preferences_path: None,
        }
    }
}

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Host name advertised to peers (None = detect the LAN address)
    pub advertise_host: Option<String>,
    /// Event / outbound channel capacity
    pub channel_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:0".to_string(),
            advertise_host: None,
            channel_capacity: 256,
        }
    }
}

impl TransportConfig {
    /// Loopback only, ephemeral port.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            advertise_host: Some("127.0.0.1".to_string()),
            channel_capacity: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.heartbeat_timeout, Duration::from_millis(2500));
        assert_eq!(config.backoff_min, Duration::from_millis(500));
        assert_eq!(config.backoff_max, Duration::from_secs(2));
        assert_eq!(config.metadata_filename, ".collab_meta.json");
        assert!(!config.auto_approve_joins);
    }

    #[test]
    fn test_testing_timers_keep_ordering() {
        let config = SessionConfig::for_testing();
        assert!(config.heartbeat_interval < config.heartbeat_timeout);
        assert!(config.backoff_min <= config.backoff_max);
    }

    #[test]
    fn test_fixed_backoff() {
        let config = SessionConfig::for_testing().with_fixed_backoff(Duration::from_millis(7));
        assert_eq!(config.backoff_min, config.backoff_max);
    }

    #[test]
    fn test_vault_defaults() {
        assert_eq!(VaultConfig::default().iterations, 100_000);
        assert!(VaultConfig::default().preferences_path.is_none());
    }
}
