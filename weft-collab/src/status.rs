//! Observable session state.

use std::fmt;

use crate::protocol::PeerId;

/// Which side of the session this process is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Host,
    Guest,
}

impl SessionRole {
    pub fn is_host(self) -> bool {
        self == SessionRole::Host
    }
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionRole::Host => f.write_str("host"),
            SessionRole::Guest => f.write_str("guest"),
        }
    }
}

/// Coarse session state, for display only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Negotiating,
    Syncing,
    Connected,
    Error,
    Offline,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Negotiating => "negotiating",
            SessionStatus::Syncing => "syncing",
            SessionStatus::Connected => "connected",
            SessionStatus::Error => "error",
            SessionStatus::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub status: SessionStatus,
    pub message: Option<String>,
    pub role: SessionRole,
    pub connected_peers: usize,
    pub host_id: Option<PeerId>,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.role, self.status)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        write!(f, " ({} peers)", self.connected_peers)
    }
}

/// Notifications for UIs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StatusChanged(StatusReport),
    RoleChanged(SessionRole),
    /// Non-blocking warning for the user.
    Warning(String),
    /// A guest is waiting for admission.
    JoinRequested(PeerId),
}
