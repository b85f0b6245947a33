//! In-process failover demo: three peers on a memory network, the host
//! leaves, the survivors elect a new one.

use std::sync::Arc;
use std::time::Duration;
use weft_collab::{
    CryptoVault, DocumentConfig, DocumentStore, MemoryNetwork, MemoryRemote, NoPrompt, PeerTransport,
    Services, SessionConfig, SessionCoordinator, SessionRole, StaticPlugins, VaultConfig,
};

const ROOT: &str = "/demo-project";

struct SimPeer {
    name: &'static str,
    coordinator: Arc<SessionCoordinator>,
    documents: Arc<DocumentStore>,
}

fn spawn_peer(net: &MemoryNetwork, remote: &MemoryRemote, name: &'static str, backoff: Duration) -> SimPeer {
    let transport = Arc::new(net.join_as(name));
    let files = Arc::new(remote.checkout());
    let documents = Arc::new(DocumentStore::new(
        DocumentConfig::for_testing(),
        files.clone(),
        transport.clone(),
    ));
    let services = Services {
        transport: transport as Arc<dyn PeerTransport>,
        files,
        documents: documents.clone(),
        vault: Arc::new(CryptoVault::new(VaultConfig::for_testing())),
        prompt: Arc::new(NoPrompt),
        plugins: Arc::new(StaticPlugins::default()),
    };
    let config = SessionConfig::for_testing().with_fixed_backoff(backoff);
    SimPeer {
        name,
        coordinator: SessionCoordinator::new(config, services),
        documents,
    }
}

fn print_roster(peers: &[&SimPeer]) {
    for peer in peers {
        println!("  {:<6} {}", peer.name, peer.coordinator.report());
    }
}

async fn settle<F>(limit: Duration, mut done: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    done()
}

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let net = MemoryNetwork::default();
    let remote = MemoryRemote::new();
    let alice = spawn_peer(&net, &remote, "alice", Duration::from_millis(100));
    let bob = spawn_peer(&net, &remote, "bob", Duration::from_millis(50));
    let carol = spawn_peer(&net, &remote, "carol", Duration::from_millis(400));

    println!("== Negotiation");
    for peer in [&alice, &bob, &carol] {
        peer.coordinator.negotiate_host(ROOT).await?;
    }
    settle(Duration::from_secs(2), || {
        [&bob, &carol]
            .iter()
            .all(|p| p.coordinator.role() == SessionRole::Guest)
    })
    .await;
    print_roster(&[&alice, &bob, &carol]);

    println!("== Editing");
    alice.documents.insert_text("notes.md", 0, "Agenda:").await?;
    bob.documents.insert_text("notes.md", 7, " failover").await?;
    settle(Duration::from_secs(1), || {
        carol.documents.text("notes.md").as_deref() == Some("Agenda: failover")
    })
    .await;
    println!("  carol sees {:?}", carol.documents.text("notes.md").unwrap_or_default());

    println!("== alice leaves");
    net.disconnect(&"alice".to_string());
    let recovered = settle(Duration::from_secs(5), || {
        bob.coordinator.role() == SessionRole::Host
            && carol.coordinator.host_id().as_deref() == Some("bob")
    })
    .await;
    print_roster(&[&bob, &carol]);
    if !recovered {
        return Err("session did not recover".into());
    }

    carol.documents.insert_text("notes.md", 16, " done").await?;
    settle(Duration::from_secs(1), || {
        bob.documents.text("notes.md").as_deref() == Some("Agenda: failover done")
    })
    .await;
    println!("  bob sees {:?}", bob.documents.text("notes.md").unwrap_or_default());

    for peer in [&alice, &bob, &carol] {
        peer.coordinator.shutdown();
    }
    Ok(())
}
