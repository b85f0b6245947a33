//! Password prompt seam. The UI decides how to ask.

use async_trait::async_trait;

/// Asks the user for the session password.
#[async_trait]
pub trait PasswordPrompt: Send + Sync {
    /// `None` (or an empty answer) cancels.
    async fn request_password(&self, message: &str) -> Option<String>;
}

/// Never answers; encrypted sessions are cancelled unless a key is already known.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPrompt;

#[async_trait]
impl PasswordPrompt for NoPrompt {
    async fn request_password(&self, _message: &str) -> Option<String> {
        None
    }
}
