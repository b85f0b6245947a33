//! WebSocket peer transport.
//!
//! Every peer listens; guests dial the host. The first frame on an inbound
//! connection must be a `JoinRequest`, which names the dialing peer. After
//! approval the link carries bincode [`Frame`]s in binary messages. The host
//! relays sync traffic from one guest to the others.
//!
//! ```text
//! guest ──connect──► host
//!       ──JoinRequest{peer_id}──►
//!       ◄──JoinAccepted{host_id, snapshot}──
//!       ◄─────── Sync / RequestSync ───────►
//! ```

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::{IpAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use super::{PeerTransport, TransportError, TransportEvent, TransportResult};
use crate::config::TransportConfig;
use crate::protocol::{Frame, PeerId, SyncPacket};

/// Transport statistics.
#[derive(Debug, Clone, Default)]
pub struct WsStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub frames_relayed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkRole {
    /// Inbound, join request not yet answered.
    Pending,
    /// Outbound, waiting for the host's answer.
    Requested,
    Guest,
    Host,
}

struct Link {
    tx: mpsc::Sender<Vec<u8>>,
    role: LinkRole,
}

#[derive(Default)]
struct LinkTable {
    links: HashMap<PeerId, Link>,
    host: Option<PeerId>,
}

struct Shared {
    peer_id: PeerId,
    capacity: usize,
    table: Mutex<LinkTable>,
    events: broadcast::Sender<TransportEvent>,
    tasks: Mutex<Vec<AbortHandle>>,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    frames_relayed: AtomicU64,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, LinkTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn track(&self, handle: AbortHandle) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    /// Senders for every established link except `skip`.
    fn session_senders(&self, skip: Option<&PeerId>) -> Vec<mpsc::Sender<Vec<u8>>> {
        self.table()
            .links
            .iter()
            .filter(|(id, link)| {
                matches!(link.role, LinkRole::Guest | LinkRole::Host) && Some(*id) != skip
            })
            .map(|(_, link)| link.tx.clone())
            .collect()
    }

    /// Senders for every guest link except `skip` (host-side relay).
    fn guest_senders(&self, skip: &PeerId) -> Vec<mpsc::Sender<Vec<u8>>> {
        self.table()
            .links
            .iter()
            .filter(|(id, link)| link.role == LinkRole::Guest && *id != skip)
            .map(|(_, link)| link.tx.clone())
            .collect()
    }

    fn is_guest(&self, peer: &PeerId) -> bool {
        self.table()
            .links
            .get(peer)
            .is_some_and(|l| l.role == LinkRole::Guest)
    }

    /// Whether `peer` is an admitted guest or our host on this connection.
    fn is_established(&self, peer: &PeerId, tx: &mpsc::Sender<Vec<u8>>) -> bool {
        self.table().links.get(peer).is_some_and(|l| {
            matches!(l.role, LinkRole::Guest | LinkRole::Host) && l.tx.same_channel(tx)
        })
    }

    /// Whether this connection is our outbound join request to `host`.
    fn awaits_answer_from(&self, host: &PeerId, remote: &Option<PeerId>, tx: &mpsc::Sender<Vec<u8>>) -> bool {
        remote.as_ref() == Some(host)
            && self
                .table()
                .links
                .get(host)
                .is_some_and(|l| l.role == LinkRole::Requested && l.tx.same_channel(tx))
    }

    /// Handle one decoded frame. Returns `false` when the connection should close.
    fn handle_frame(
        &self,
        remote: &mut Option<PeerId>,
        tx: &mpsc::Sender<Vec<u8>>,
        frame: Frame,
        raw: &[u8],
    ) -> bool {
        match frame {
            Frame::JoinRequest { peer_id } => {
                if remote.is_some() {
                    log::warn!("Duplicate join request from {peer_id}");
                    return true;
                }
                self.table().links.insert(
                    peer_id.clone(),
                    Link {
                        tx: tx.clone(),
                        role: LinkRole::Pending,
                    },
                );
                *remote = Some(peer_id.clone());
                self.emit(TransportEvent::JoinRequested(peer_id));
                true
            }
            Frame::JoinAccepted { host_id, snapshot } => {
                if !self.awaits_answer_from(&host_id, remote, tx) {
                    log::warn!("Ignoring unsolicited join acceptance from {host_id}");
                    return true;
                }
                {
                    let mut table = self.table();
                    if let Some(old) = table.host.take().filter(|h| *h != host_id) {
                        table.links.remove(&old);
                    }
                    table.links.insert(
                        host_id.clone(),
                        Link {
                            tx: tx.clone(),
                            role: LinkRole::Host,
                        },
                    );
                    table.host = Some(host_id.clone());
                }
                *remote = Some(host_id.clone());
                log::info!("Joined host {host_id}");
                self.emit(TransportEvent::PeerConnected(host_id.clone()));
                self.emit(TransportEvent::JoinAccepted { host_id, snapshot });
                true
            }
            Frame::JoinRejected { host_id } => {
                if !self.awaits_answer_from(&host_id, remote, tx) {
                    return true;
                }
                self.table().links.remove(&host_id);
                *remote = None;
                self.emit(TransportEvent::JoinRejected(host_id));
                false
            }
            Frame::Sync(packet) => {
                let Some(from) = remote.clone().filter(|p| self.is_established(p, tx)) else {
                    log::debug!("Dropping sync frame from unadmitted connection");
                    return true;
                };
                if self.is_guest(&from) {
                    self.relay(&from, raw);
                }
                self.emit(TransportEvent::Sync { from, packet });
                true
            }
            Frame::RequestSync { path } => {
                let Some(from) = remote.clone().filter(|p| self.is_established(p, tx)) else {
                    log::debug!("Dropping sync frame from unadmitted connection");
                    return true;
                };
                if self.is_guest(&from) {
                    self.relay(&from, raw);
                }
                self.emit(TransportEvent::SyncRequested { from, path });
                true
            }
        }
    }

    fn relay(&self, from: &PeerId, raw: &[u8]) {
        for tx in self.guest_senders(from) {
            if tx.try_send(raw.to_vec()).is_ok() {
                self.frames_relayed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Forget the link behind a closed connection.
    fn drop_link(&self, remote: Option<PeerId>, tx: &mpsc::Sender<Vec<u8>>) {
        let Some(peer) = remote else {
            return;
        };
        let (removed, was_host) = {
            let mut table = self.table();
            // A reconnect may already have replaced this entry.
            let ours = table
                .links
                .get(&peer)
                .is_some_and(|l| l.tx.same_channel(tx));
            if !ours {
                return;
            }
            let removed = table.links.remove(&peer);
            let was_host = table.host.as_ref() == Some(&peer);
            if was_host {
                table.host = None;
            }
            (removed, was_host)
        };
        match removed.map(|l| l.role) {
            Some(LinkRole::Host) if was_host => {
                log::warn!("Lost connection to host {peer}");
                self.emit(TransportEvent::HostDisconnected(peer));
            }
            Some(LinkRole::Guest) | Some(LinkRole::Host) => {
                log::info!("Peer {peer} disconnected");
                self.emit(TransportEvent::PeerDisconnected(peer));
            }
            _ => log::debug!("Unjoined connection from {peer} closed"),
        }
    }
}

/// Drive one WebSocket connection until it closes.
async fn drive<S>(shared: Arc<Shared>, ws: WebSocketStream<S>, known: Option<(PeerId, Frame)>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut writer, mut reader) = ws.split();
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(shared.capacity);

    let write_task = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if writer.send(Message::Binary(bytes.into())).await.is_err() {
                break;
            }
        }
        let _ = writer.close().await;
    });

    let mut remote = None;
    if let Some((peer, first)) = known {
        shared.table().links.insert(
            peer.clone(),
            Link {
                tx: tx.clone(),
                role: LinkRole::Requested,
            },
        );
        remote = Some(peer);
        match first.encode() {
            Ok(bytes) => {
                let _ = tx.send(bytes).await;
                shared.frames_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => log::error!("Failed to encode opening frame: {e}"),
        }
    }

    while let Some(msg) = reader.next().await {
        match msg {
            Ok(Message::Binary(data)) => {
                let bytes: Vec<u8> = data.into();
                shared.frames_received.fetch_add(1, Ordering::Relaxed);
                match Frame::decode(&bytes) {
                    Ok(frame) => {
                        if !shared.handle_frame(&mut remote, &tx, frame, &bytes) {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                log::debug!("WebSocket read error: {e}");
                break;
            }
        }
    }

    shared.drop_link(remote, &tx);
    drop(tx);
    let _ = write_task.await;
}

/// WebSocket [`PeerTransport`].
pub struct WsTransport {
    shared: Arc<Shared>,
    addresses: Vec<String>,
    accept_task: AbortHandle,
}

impl WsTransport {
    /// Bind the listener and start accepting peers.
    pub async fn bind(config: TransportConfig) -> TransportResult<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let port = listener.local_addr()?.port();
        let host = match &config.advertise_host {
            Some(h) => h.clone(),
            None => detect_lan_ip().map_or_else(|| "127.0.0.1".to_string(), |ip| ip.to_string()),
        };
        let address = format!("ws://{host}:{port}");

        let (events, _) = broadcast::channel(config.channel_capacity);
        let shared = Arc::new(Shared {
            peer_id: Uuid::new_v4().to_string(),
            capacity: config.channel_capacity,
            table: Mutex::new(LinkTable::default()),
            events,
            tasks: Mutex::new(Vec::new()),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            frames_relayed: AtomicU64::new(0),
        });

        let accept_shared = shared.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, addr) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        log::error!("Accept failed: {e}");
                        continue;
                    }
                };
                log::debug!("New TCP connection from {addr}");
                let shared = accept_shared.clone();
                let handle = tokio::spawn(async move {
                    match tokio_tungstenite::accept_async(stream).await {
                        Ok(ws) => drive(shared, ws, None).await,
                        Err(e) => log::warn!("WebSocket handshake from {addr} failed: {e}"),
                    }
                });
                accept_shared.track(handle.abort_handle());
            }
        })
        .abort_handle();

        log::info!("Peer {} listening on {address}", shared.peer_id);
        shared.emit(TransportEvent::AddressAdded(address.clone()));

        Ok(Self {
            shared,
            addresses: vec![address],
            accept_task,
        })
    }

    pub fn stats(&self) -> WsStats {
        WsStats {
            frames_sent: self.shared.frames_sent.load(Ordering::Relaxed),
            frames_received: self.shared.frames_received.load(Ordering::Relaxed),
            frames_relayed: self.shared.frames_relayed.load(Ordering::Relaxed),
        }
    }

    /// Stop listening and drop every connection.
    pub fn close(&self) {
        self.accept_task.abort();
        let tasks: Vec<AbortHandle> = self
            .shared
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        let mut table = self.shared.table();
        table.links.clear();
        table.host = None;
    }

    async fn send_to(&self, senders: Vec<mpsc::Sender<Vec<u8>>>, bytes: Vec<u8>) -> usize {
        let mut delivered = 0;
        for tx in senders {
            if tx.send(bytes.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        self.shared
            .frames_sent
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    async fn send_frame(&self, peer: &PeerId, frame: Frame) -> TransportResult<()> {
        let tx = self
            .shared
            .table()
            .links
            .get(peer)
            .map(|l| l.tx.clone())
            .ok_or_else(|| TransportError::Unreachable(peer.clone()))?;
        let bytes = frame.encode()?;
        tx.send(bytes).await.map_err(|_| TransportError::Closed)?;
        self.shared.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl PeerTransport for WsTransport {
    fn local_peer_id(&self) -> Option<PeerId> {
        Some(self.shared.peer_id.clone())
    }

    fn addresses(&self) -> Vec<String> {
        self.addresses.clone()
    }

    fn connected_peers(&self) -> usize {
        self.shared
            .table()
            .links
            .values()
            .filter(|l| matches!(l.role, LinkRole::Guest | LinkRole::Host))
            .count()
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }

    async fn send_join_request(&self, host: &PeerId, addrs: &[String]) -> TransportResult<()> {
        let mut last_error = TransportError::Unreachable(host.clone());
        for addr in addrs {
            match tokio_tungstenite::connect_async(addr.as_str()).await {
                Ok((ws, _)) => {
                    log::info!("Connected to {host} at {addr}, requesting to join");
                    let request = Frame::JoinRequest {
                        peer_id: self.shared.peer_id.clone(),
                    };
                    let shared = self.shared.clone();
                    let host = host.clone();
                    let handle = tokio::spawn(async move {
                        drive(shared, ws, Some((host, request))).await;
                    });
                    self.shared.track(handle.abort_handle());
                    return Ok(());
                }
                Err(e) => {
                    log::debug!("Could not reach {host} at {addr}: {e}");
                    last_error = e.into();
                }
            }
        }
        Err(last_error)
    }

    async fn approve_join(&self, peer: &PeerId, snapshot: Vec<u8>) -> TransportResult<()> {
        let old_host = {
            let mut table = self.shared.table();
            match table.links.get_mut(peer) {
                Some(link) if link.role == LinkRole::Pending => link.role = LinkRole::Guest,
                _ => return Err(TransportError::NotPending(peer.clone())),
            }
            // A host has no host of its own.
            let old = table.host.take();
            if let Some(old) = &old {
                table.links.remove(old);
            }
            old
        };
        if let Some(old) = old_host {
            log::info!("Left former host {old}");
        }
        self.send_frame(
            peer,
            Frame::JoinAccepted {
                host_id: self.shared.peer_id.clone(),
                snapshot,
            },
        )
        .await?;
        self.shared.emit(TransportEvent::PeerConnected(peer.clone()));
        Ok(())
    }

    async fn reject_join(&self, peer: &PeerId) -> TransportResult<()> {
        let pending = self
            .shared
            .table()
            .links
            .get(peer)
            .is_some_and(|l| l.role == LinkRole::Pending);
        if !pending {
            return Err(TransportError::NotPending(peer.clone()));
        }
        let result = self
            .send_frame(
                peer,
                Frame::JoinRejected {
                    host_id: self.shared.peer_id.clone(),
                },
            )
            .await;
        self.shared.table().links.remove(peer);
        result
    }

    async fn broadcast(&self, packet: SyncPacket) -> TransportResult<usize> {
        let bytes = Frame::Sync(packet).encode()?;
        let senders = self.shared.session_senders(None);
        Ok(self.send_to(senders, bytes).await)
    }

    async fn request_file_sync(&self, path: &str) -> TransportResult<()> {
        let bytes = Frame::RequestSync {
            path: path.to_string(),
        }
        .encode()?;
        let senders = self.shared.session_senders(None);
        self.send_to(senders, bytes).await;
        Ok(())
    }
}

/// LAN address of the default route. Connecting a UDP socket sends nothing.
fn detect_lan_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn next_event(rx: &mut broadcast::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for transport event")
            .unwrap()
    }

    async fn next_matching(
        rx: &mut broadcast::Receiver<TransportEvent>,
        pred: impl Fn(&TransportEvent) -> bool,
    ) -> TransportEvent {
        loop {
            let event = next_event(rx).await;
            if pred(&event) {
                return event;
            }
        }
    }

    async fn joined_pair() -> (WsTransport, WsTransport) {
        let host = WsTransport::bind(TransportConfig::for_testing()).await.unwrap();
        let guest = WsTransport::bind(TransportConfig::for_testing()).await.unwrap();
        let mut host_rx = host.subscribe();
        let mut guest_rx = guest.subscribe();

        let host_id = host.local_peer_id().unwrap();
        guest.send_join_request(&host_id, &host.addresses()).await.unwrap();

        let requested = next_matching(&mut host_rx, |e| matches!(e, TransportEvent::JoinRequested(_))).await;
        let TransportEvent::JoinRequested(guest_id) = requested else {
            unreachable!()
        };
        assert_eq!(Some(guest_id.clone()), guest.local_peer_id());

        host.approve_join(&guest_id, vec![5, 6]).await.unwrap();
        let accepted = next_matching(&mut guest_rx, |e| matches!(e, TransportEvent::JoinAccepted { .. })).await;
        assert_eq!(
            accepted,
            TransportEvent::JoinAccepted {
                host_id,
                snapshot: vec![5, 6]
            }
        );
        (host, guest)
    }

    #[tokio::test]
    async fn test_address_format() {
        let transport = WsTransport::bind(TransportConfig::for_testing()).await.unwrap();
        let addrs = transport.addresses();
        assert_eq!(addrs.len(), 1);
        assert!(addrs[0].starts_with("ws://127.0.0.1:"));
        assert_eq!(transport.connected_peers(), 0);
    }

    #[tokio::test]
    async fn test_join_and_sync_over_websocket() {
        let (host, guest) = joined_pair().await;
        assert_eq!(host.connected_peers(), 1);
        assert_eq!(guest.connected_peers(), 1);

        let mut host_rx = host.subscribe();
        guest
            .broadcast(SyncPacket::update("notes.md", vec![1, 2, 3]))
            .await
            .unwrap();
        let event = next_matching(&mut host_rx, |e| matches!(e, TransportEvent::Sync { .. })).await;
        match event {
            TransportEvent::Sync { from, packet } => {
                assert_eq!(Some(from), guest.local_peer_id());
                assert_eq!(packet.data, vec![1, 2, 3]);
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_host_close_reports_host_disconnected() {
        let (host, guest) = joined_pair().await;
        let mut guest_rx = guest.subscribe();
        let host_id = host.local_peer_id().unwrap();

        host.close();
        let event = next_matching(&mut guest_rx, |e| matches!(e, TransportEvent::HostDisconnected(_))).await;
        assert_eq!(event, TransportEvent::HostDisconnected(host_id));
    }

    async fn send_raw<S>(ws: &mut WebSocketStream<S>, frame: Frame)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let bytes = frame.encode().unwrap();
        ws.send(Message::Binary(bytes.into())).await.unwrap();
    }

    #[tokio::test]
    async fn test_sync_from_pending_peer_is_dropped() {
        let host = WsTransport::bind(TransportConfig::for_testing()).await.unwrap();
        let mut host_rx = host.subscribe();
        let (mut ws, _) = tokio_tungstenite::connect_async(host.addresses()[0].as_str())
            .await
            .unwrap();

        let stranger = "stranger".to_string();
        send_raw(&mut ws, Frame::JoinRequest { peer_id: stranger.clone() }).await;
        send_raw(&mut ws, Frame::Sync(SyncPacket::update("../../outside.png", vec![1, 2, 3]))).await;
        send_raw(&mut ws, Frame::RequestSync { path: "notes.md".into() }).await;

        let requested = next_matching(&mut host_rx, |e| matches!(e, TransportEvent::JoinRequested(_))).await;
        assert_eq!(requested, TransportEvent::JoinRequested(stranger.clone()));
        assert_eq!(host.connected_peers(), 0);

        // Frames on one connection are handled in order, so the first sync
        // event seen must be the one sent after admission.
        host.approve_join(&stranger, vec![]).await.unwrap();
        send_raw(&mut ws, Frame::Sync(SyncPacket::update("after.md", vec![4]))).await;
        let event = next_matching(&mut host_rx, |e| {
            matches!(e, TransportEvent::Sync { .. } | TransportEvent::SyncRequested { .. })
        })
        .await;
        match event {
            TransportEvent::Sync { from, packet } => {
                assert_eq!(from, stranger);
                assert_eq!(packet.path, "after.md");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unsolicited_join_acceptance_is_ignored() {
        let peer = WsTransport::bind(TransportConfig::for_testing()).await.unwrap();
        let mut rx = peer.subscribe();
        let (mut ws, _) = tokio_tungstenite::connect_async(peer.addresses()[0].as_str())
            .await
            .unwrap();

        send_raw(
            &mut ws,
            Frame::JoinAccepted {
                host_id: "impostor".into(),
                snapshot: vec![],
            },
        )
        .await;
        send_raw(&mut ws, Frame::JoinRequest { peer_id: "impostor".into() }).await;

        let event = next_matching(&mut rx, |e| {
            matches!(e, TransportEvent::JoinAccepted { .. } | TransportEvent::JoinRequested(_))
        })
        .await;
        assert_eq!(event, TransportEvent::JoinRequested("impostor".into()));
        assert_eq!(peer.connected_peers(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        let guest = WsTransport::bind(TransportConfig::for_testing()).await.unwrap();
        let result = guest
            .send_join_request(&"nobody".to_string(), &["ws://127.0.0.1:1".to_string()])
            .await;
        assert!(result.is_err());
        assert!(guest.send_join_request(&"nobody".to_string(), &[]).await.is_err());
    }
}
