//! Terminal input shared between the password prompt and the command loop.
//!
//! A single task owns stdin. A line typed while a password prompt is open
//! answers the prompt; any other line is a command.

use async_trait::async_trait;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use weft_collab::PasswordPrompt;

type PendingAnswer = Arc<Mutex<Option<oneshot::Sender<String>>>>;

/// [`PasswordPrompt`] reading from the terminal. An empty line cancels.
#[derive(Clone)]
pub struct StdinPrompt {
    pending: PendingAnswer,
}

impl StdinPrompt {
    /// Start reading stdin. Returns the prompt and the stream of command lines.
    pub fn spawn() -> (Self, mpsc::Receiver<String>) {
        let pending: PendingAnswer = Arc::new(Mutex::new(None));
        let (commands_tx, commands_rx) = mpsc::channel(16);

        let reader_pending = pending.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("stdin read failed: {e}");
                        break;
                    }
                };
                let answer = reader_pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                match answer {
                    Some(tx) => {
                        let _ = tx.send(line.trim().to_string());
                    }
                    None => {
                        if commands_tx.send(line).await.is_err() {
                            break;
                        }
                    }
                }
            }
            // Dropping an open prompt's sender cancels it
            reader_pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
        });

        (Self { pending }, commands_rx)
    }
}

#[async_trait]
impl PasswordPrompt for StdinPrompt {
    async fn request_password(&self, message: &str) -> Option<String> {
        let (tx, rx) = oneshot::channel();
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);

        print!("{message} ");
        let _ = std::io::stdout().flush();

        match rx.await {
            Ok(answer) if !answer.is_empty() => Some(answer),
            _ => None,
        }
    }
}
