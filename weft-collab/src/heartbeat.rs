//! Host liveness.
//!
//! ```text
//!  Host                          Guest
//!   │ every interval               │
//!   ├──── ".heartbeat" ───────────►│ beat(): restart timeout
//!   ├──── ".heartbeat" ───────────►│
//!   ╳ (gone)                       │
//!                                  │ timeout elapsed → on_timeout()
//! ```
//!
//! A process runs exactly one side at a time; starting either side stops
//! both first.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::protocol::{PeerId, SyncPacket};
use crate::transport::PeerTransport;

/// The host most recently declared dead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DeadHost {
    #[default]
    None,
    /// Heartbeats stopped arriving; the transport never reported who.
    HeartbeatTimeout,
    Peer(PeerId),
}

impl DeadHost {
    /// Whether `id` is the recorded dead peer.
    pub fn is(&self, id: &str) -> bool {
        matches!(self, DeadHost::Peer(dead) if dead == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatMode {
    Stopped,
    Emitting,
    Listening,
}

/// Heartbeat timers for one process.
pub struct Heartbeat {
    interval: Duration,
    timeout: Duration,
    emitter: Option<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
    beats: Option<mpsc::Sender<()>>,
    last_seen: Option<Instant>,
}

impl Heartbeat {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            emitter: None,
            listener: None,
            beats: None,
            last_seen: None,
        }
    }

    pub fn mode(&self) -> HeartbeatMode {
        if self.emitter.is_some() {
            HeartbeatMode::Emitting
        } else if self.listener.is_some() {
            HeartbeatMode::Listening
        } else {
            HeartbeatMode::Stopped
        }
    }

    /// Host side: broadcast a heartbeat every interval.
    pub fn start_emitter(&mut self, transport: Arc<dyn PeerTransport>) {
        self.stop();
        let period = self.interval;
        self.emitter = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = transport.broadcast(SyncPacket::heartbeat()).await {
                    log::debug!("Heartbeat broadcast failed: {e}");
                }
            }
        }));
    }

    /// Guest side: call `on_timeout` once if no beat arrives within the
    /// timeout. The window starts now.
    pub fn start_listener<F>(&mut self, on_timeout: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.stop();
        let (tx, mut rx) = mpsc::channel::<()>(8);
        let timeout = self.timeout;
        self.beats = Some(tx);
        self.last_seen = Some(Instant::now());
        self.listener = Some(tokio::spawn(async move {
            loop {
                match tokio::time::timeout(timeout, rx.recv()).await {
                    Ok(Some(())) => continue,
                    Ok(None) => return,
                    Err(_) => {
                        log::warn!("No heartbeat for {timeout:?}, host presumed dead");
                        on_timeout();
                        return;
                    }
                }
            }
        }));
    }

    /// Record a heartbeat from the host.
    pub fn beat(&mut self) {
        self.last_seen = Some(Instant::now());
        if let Some(tx) = &self.beats {
            // A full queue already guarantees a reset
            let _ = tx.try_send(());
        }
    }

    pub fn last_seen(&self) -> Option<Instant> {
        self.last_seen
    }

    /// Stop both sides.
    pub fn stop(&mut self) {
        if let Some(handle) = self.emitter.take() {
            handle.abort();
        }
        if let Some(handle) = self.listener.take() {
            handle.abort();
        }
        self.beats = None;
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryNetwork, TransportEvent};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fired_counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        (fired, move || {
            f.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_dead_host_matching() {
        assert!(DeadHost::Peer("a".into()).is("a"));
        assert!(!DeadHost::Peer("a".into()).is("b"));
        assert!(!DeadHost::HeartbeatTimeout.is("a"));
        assert!(!DeadHost::None.is(""));
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_times_out_without_beats() {
        let mut hb = Heartbeat::new(Duration::from_secs(1), Duration::from_millis(2500));
        let (fired, on_timeout) = fired_counter();
        hb.start_listener(on_timeout);
        assert_eq!(hb.mode(), HeartbeatMode::Listening);

        tokio::time::sleep(Duration::from_millis(2400)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_beats_keep_listener_alive() {
        let mut hb = Heartbeat::new(Duration::from_secs(1), Duration::from_millis(2500));
        let (fired, on_timeout) = fired_counter();
        hb.start_listener(on_timeout);

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            hb.beat();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(hb.last_seen().is_some());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_listener() {
        let mut hb = Heartbeat::new(Duration::from_secs(1), Duration::from_millis(2500));
        let (fired, on_timeout) = fired_counter();
        hb.start_listener(on_timeout);
        hb.stop();
        assert_eq!(hb.mode(), HeartbeatMode::Stopped);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emitter_broadcasts_each_interval() {
        let net = MemoryNetwork::default();
        let host = Arc::new(net.join_as("host"));
        let guest = net.join_as("guest");
        guest.send_join_request(&"host".to_string(), &[]).await.unwrap();
        host.approve_join(&"guest".to_string(), vec![]).await.unwrap();
        let mut rx = guest.subscribe();

        let mut hb = Heartbeat::new(Duration::from_secs(1), Duration::from_millis(2500));
        hb.start_emitter(host.clone());
        assert_eq!(hb.mode(), HeartbeatMode::Emitting);

        tokio::time::sleep(Duration::from_millis(3500)).await;
        let mut beats = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, TransportEvent::Sync { ref packet, .. } if packet.is_heartbeat()) {
                beats += 1;
            }
        }
        assert_eq!(beats, 3);

        // Switching to listening stops the emitter
        hb.start_listener(|| {});
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
    }
}
