//! In-process transport hub.
//!
//! Every [`MemoryTransport`] created from one [`MemoryNetwork`] can reach the
//! others directly. Delivery goes through per-peer tokio broadcast channels,
//! so sending never blocks and never takes an async lock.
//!
//! The hub also exposes fault injection used by scenario tests and the
//! simulation: [`MemoryNetwork::disconnect`] drops a peer (its guests see
//! `HostDisconnected`), [`MemoryNetwork::set_muted`] silently drops a peer's
//! outbound sync traffic while its links stay up.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{PeerTransport, TransportError, TransportEvent, TransportResult};
use crate::protocol::{PeerId, SyncPacket};

/// Statistics for monitoring the hub.
#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub peers_online: usize,
}

struct AtomicNetworkStats {
    frames_delivered: AtomicU64,
    frames_dropped: AtomicU64,
}

struct Slot {
    events: broadcast::Sender<TransportEvent>,
    address: String,
    host: Option<PeerId>,
    guests: HashSet<PeerId>,
    pending: HashSet<PeerId>,
    online: bool,
    muted: bool,
}

type Slots = HashMap<PeerId, Slot>;

/// Shared hub connecting in-process peers.
#[derive(Clone)]
pub struct MemoryNetwork {
    slots: Arc<Mutex<Slots>>,
    capacity: usize,
    stats: Arc<AtomicNetworkStats>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new(256)
    }
}

impl MemoryNetwork {
    /// `capacity` bounds each peer's event backlog.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            capacity,
            stats: Arc::new(AtomicNetworkStats {
                frames_delivered: AtomicU64::new(0),
                frames_dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Attach a new peer with a random id.
    pub fn join(&self) -> MemoryTransport {
        self.join_as(Uuid::new_v4().to_string())
    }

    /// Attach a new peer with a chosen id.
    pub fn join_as(&self, peer_id: impl Into<PeerId>) -> MemoryTransport {
        let peer_id = peer_id.into();
        let (events, _) = broadcast::channel(self.capacity);
        self.lock().insert(
            peer_id.clone(),
            Slot {
                events,
                address: format!("mem://{peer_id}"),
                host: None,
                guests: HashSet::new(),
                pending: HashSet::new(),
                online: true,
                muted: false,
            },
        );
        log::debug!("Peer {peer_id} attached to memory network");
        MemoryTransport {
            peer_id,
            network: self.clone(),
            ready: AtomicBool::new(true),
        }
    }

    /// Drop `peer` from the network. Its guests observe `HostDisconnected`,
    /// its host observes `PeerDisconnected`.
    pub fn disconnect(&self, peer: &PeerId) {
        let mut slots = self.lock();
        let Some(slot) = slots.get_mut(peer) else {
            return;
        };
        slot.online = false;
        slot.pending.clear();
        let guests: Vec<PeerId> = slot.guests.drain().collect();
        let host = slot.host.take();

        for guest in guests {
            if let Some(g) = slots.get_mut(&guest) {
                g.host = None;
            }
            self.emit(&slots, &guest, TransportEvent::HostDisconnected(peer.clone()));
        }
        if let Some(host) = host {
            if let Some(h) = slots.get_mut(&host) {
                h.guests.remove(peer);
            }
            self.emit(&slots, &host, TransportEvent::PeerDisconnected(peer.clone()));
        }
        for other in slots.values_mut() {
            other.pending.remove(peer);
        }
        log::debug!("Peer {peer} disconnected from memory network");
    }

    /// Silently drop `peer`'s outbound sync traffic while `muted`.
    pub fn set_muted(&self, peer: &PeerId, muted: bool) {
        if let Some(slot) = self.lock().get_mut(peer) {
            slot.muted = muted;
        }
    }

    pub fn is_online(&self, peer: &PeerId) -> bool {
        self.lock().get(peer).is_some_and(|s| s.online)
    }

    /// Current host link of `peer`.
    pub fn host_of(&self, peer: &PeerId) -> Option<PeerId> {
        self.lock().get(peer).and_then(|s| s.host.clone())
    }

    pub fn guests_of(&self, peer: &PeerId) -> Vec<PeerId> {
        self.lock()
            .get(peer)
            .map(|s| s.guests.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            frames_delivered: self.stats.frames_delivered.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            peers_online: self.lock().values().filter(|s| s.online).count(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand `event` to `to` if it is online. Returns whether it was delivered.
    fn emit(&self, slots: &Slots, to: &PeerId, event: TransportEvent) -> bool {
        match slots.get(to) {
            Some(slot) if slot.online => {
                // No receiver yet is not an error for the sender
                let _ = slot.events.send(event);
                self.stats.frames_delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Every other member of `me`'s session: its host plus the host's guests,
    /// or its own guests when `me` is the host.
    fn members(slots: &Slots, me: &PeerId) -> Vec<PeerId> {
        let hub = slots
            .get(me)
            .and_then(|s| s.host.clone())
            .unwrap_or_else(|| me.clone());
        let mut out = Vec::new();
        if &hub != me {
            out.push(hub.clone());
        }
        if let Some(h) = slots.get(&hub) {
            out.extend(h.guests.iter().filter(|g| *g != me).cloned());
        }
        out
    }

    /// Remove `peer` from its current host, if any.
    fn detach(&self, slots: &mut Slots, peer: &PeerId) {
        let old = slots.get_mut(peer).and_then(|s| s.host.take());
        if let Some(old) = old {
            if let Some(h) = slots.get_mut(&old) {
                h.guests.remove(peer);
            }
            self.emit(slots, &old, TransportEvent::PeerDisconnected(peer.clone()));
        }
    }
}

/// One peer's handle on a [`MemoryNetwork`].
pub struct MemoryTransport {
    peer_id: PeerId,
    network: MemoryNetwork,
    ready: AtomicBool,
}

impl MemoryTransport {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    /// Simulate an identity that is not yet available.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Leave the network; same as `network().disconnect(self)`.
    pub fn close(&self) {
        self.network.disconnect(&self.peer_id);
    }

    fn ensure_online(&self, slots: &Slots) -> TransportResult<()> {
        match slots.get(&self.peer_id) {
            Some(slot) if slot.online => Ok(()),
            _ => Err(TransportError::Closed),
        }
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    fn local_peer_id(&self) -> Option<PeerId> {
        self.ready
            .load(Ordering::Relaxed)
            .then(|| self.peer_id.clone())
    }

    fn addresses(&self) -> Vec<String> {
        self.network
            .lock()
            .get(&self.peer_id)
            .map(|s| vec![s.address.clone()])
            .unwrap_or_default()
    }

    fn connected_peers(&self) -> usize {
        self.network
            .lock()
            .get(&self.peer_id)
            .map(|s| usize::from(s.host.is_some()) + s.guests.len())
            .unwrap_or(0)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        match self.network.lock().get(&self.peer_id) {
            Some(slot) => slot.events.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    async fn send_join_request(&self, host: &PeerId, addrs: &[String]) -> TransportResult<()> {
        let mut slots = self.network.lock();
        self.ensure_online(&slots)?;
        let Some(target) = slots.get_mut(host).filter(|s| s.online) else {
            return Err(TransportError::Unreachable(host.clone()));
        };
        if !addrs.is_empty() && !addrs.contains(&target.address) {
            return Err(TransportError::Unreachable(format!("{host} at {addrs:?}")));
        }
        target.pending.insert(self.peer_id.clone());
        self.network
            .emit(&slots, host, TransportEvent::JoinRequested(self.peer_id.clone()));
        log::debug!("{} requested to join {host}", self.peer_id);
        Ok(())
    }

    async fn approve_join(&self, peer: &PeerId, snapshot: Vec<u8>) -> TransportResult<()> {
        let mut slots = self.network.lock();
        self.ensure_online(&slots)?;
        let was_pending = slots
            .get_mut(&self.peer_id)
            .is_some_and(|s| s.pending.remove(peer));
        if !was_pending {
            return Err(TransportError::NotPending(peer.clone()));
        }

        // A host has no host of its own; a guest switching hosts leaves the old one.
        self.network.detach(&mut slots, &self.peer_id);
        let guest_host = slots.get(peer).and_then(|s| s.host.clone());
        if guest_host.is_some_and(|h| h != self.peer_id) {
            self.network.detach(&mut slots, peer);
        }

        if let Some(g) = slots.get_mut(peer) {
            g.host = Some(self.peer_id.clone());
        }
        if let Some(me) = slots.get_mut(&self.peer_id) {
            me.guests.insert(peer.clone());
        }

        self.network
            .emit(&slots, peer, TransportEvent::PeerConnected(self.peer_id.clone()));
        self.network.emit(
            &slots,
            peer,
            TransportEvent::JoinAccepted {
                host_id: self.peer_id.clone(),
                snapshot,
            },
        );
        self.network
            .emit(&slots, &self.peer_id, TransportEvent::PeerConnected(peer.clone()));
        Ok(())
    }

    async fn reject_join(&self, peer: &PeerId) -> TransportResult<()> {
        let mut slots = self.network.lock();
        let was_pending = slots
            .get_mut(&self.peer_id)
            .is_some_and(|s| s.pending.remove(peer));
        if !was_pending {
            return Err(TransportError::NotPending(peer.clone()));
        }
        self.network
            .emit(&slots, peer, TransportEvent::JoinRejected(self.peer_id.clone()));
        Ok(())
    }

    async fn broadcast(&self, packet: SyncPacket) -> TransportResult<usize> {
        let slots = self.network.lock();
        self.ensure_online(&slots)?;
        let recipients = MemoryNetwork::members(&slots, &self.peer_id);
        if slots.get(&self.peer_id).is_some_and(|s| s.muted) {
            self.network
                .stats
                .frames_dropped
                .fetch_add(recipients.len() as u64, Ordering::Relaxed);
            return Ok(0);
        }

        log::trace!("{} → {} peers: {} ({} bytes)", self.peer_id, recipients.len(), packet.path, packet.data.len());
        let mut delivered = 0;
        for to in &recipients {
            let event = TransportEvent::Sync {
                from: self.peer_id.clone(),
                packet: packet.clone(),
            };
            if self.network.emit(&slots, to, event) {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    async fn request_file_sync(&self, path: &str) -> TransportResult<()> {
        let slots = self.network.lock();
        self.ensure_online(&slots)?;
        for to in MemoryNetwork::members(&slots, &self.peer_id) {
            let event = TransportEvent::SyncRequested {
                from: self.peer_id.clone(),
                path: path.to_string(),
            };
            self.network.emit(&slots, &to, event);
        }
        Ok(())
    }
}
