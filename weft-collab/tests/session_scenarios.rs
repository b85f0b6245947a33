//! Multi-peer session scenarios over the in-process network.
//!
//! Every peer is a full coordinator + document store with its own working
//! tree over a shared in-memory remote.

mod support;

use std::sync::Arc;
use std::time::Duration;
use support::{drain_warnings, remote_metadata, wait_until, Peer, PeerOptions, ScriptedPrompt, ROOT};
use weft_collab::{
    DeadHost, DocumentConfig, MemoryNetwork, MemoryRemote, NegotiationOutcome, SessionConfig,
    SessionError, SessionEvent, SessionRole, SessionStatus,
};

const SETTLE: Duration = Duration::from_secs(2);

async fn host_and_guest(net: &MemoryNetwork, remote: &MemoryRemote) -> (Peer, Peer) {
    let alice = Peer::spawn(net, remote, "alice");
    let bob = Peer::spawn(net, remote, "bob");
    alice.coordinator.negotiate_host(ROOT).await.unwrap();
    bob.coordinator.negotiate_host(ROOT).await.unwrap();
    assert!(wait_until(SETTLE, || bob.coordinator.role() == SessionRole::Guest).await);
    (alice, bob)
}

#[tokio::test]
async fn test_unencrypted_join() {
    let net = MemoryNetwork::default();
    let remote = MemoryRemote::new();
    let alice = Peer::spawn(&net, &remote, "alice");
    let bob = Peer::spawn(&net, &remote, "bob");

    let outcome = alice.coordinator.negotiate_host(ROOT).await.unwrap();
    assert_eq!(outcome, NegotiationOutcome::Hosting { published: true });
    alice.documents.insert_text("notes.md", 0, "hello").await.unwrap();

    let outcome = bob.coordinator.negotiate_host(ROOT).await.unwrap();
    assert_eq!(outcome, NegotiationOutcome::JoinRequested { host_id: "alice".into() });

    assert!(
        wait_until(SETTLE, || bob.coordinator.report().status == SessionStatus::Connected).await,
        "guest never finished joining: {}",
        bob.coordinator.report()
    );
    let report = bob.coordinator.report();
    assert_eq!(report.role, SessionRole::Guest);
    assert_eq!(report.host_id.as_deref(), Some("alice"));
    assert_eq!(report.connected_peers, 1);
    assert!(!bob.documents.is_host());

    // Snapshot delivered the host's document
    assert_eq!(bob.documents.text("notes.md").as_deref(), Some("hello"));

    // Edits flow both ways
    bob.documents.insert_text("notes.md", 5, " world").await.unwrap();
    assert!(wait_until(SETTLE, || alice.documents.text("notes.md").as_deref() == Some("hello world")).await);
    alice.documents.insert_text("notes.md", 0, ">> ").await.unwrap();
    assert!(wait_until(SETTLE, || bob.documents.text("notes.md").as_deref() == Some(">> hello world")).await);

    assert!(wait_until(SETTLE, || alice.coordinator.report().connected_peers == 1).await);
}

#[tokio::test]
async fn test_plain_text_file_shared_before_join_is_not_duplicated() {
    let net = MemoryNetwork::default();
    let remote = MemoryRemote::new();
    let readme = std::path::Path::new(ROOT).join("readme.md");
    remote.insert(readme.clone(), b"# Title\n".to_vec());

    let alice = Peer::spawn(&net, &remote, "alice");
    let bob = Peer::spawn(&net, &remote, "bob");
    alice.coordinator.negotiate_host(ROOT).await.unwrap();
    alice.documents.get_or_create_doc("readme.md").await.unwrap();
    assert_eq!(alice.documents.text("readme.md").as_deref(), Some("# Title\n"));

    bob.coordinator.negotiate_host(ROOT).await.unwrap();
    assert!(wait_until(SETTLE, || bob.coordinator.report().status == SessionStatus::Connected).await);
    assert_eq!(bob.documents.text("readme.md").as_deref(), Some("# Title\n"));

    // The guest's post-join state push must not double the host's copy either
    bob.documents.insert_text("readme.md", 8, "body\n").await.unwrap();
    assert!(wait_until(SETTLE, || alice.documents.text("readme.md").as_deref() == Some("# Title\nbody\n")).await);
    assert_eq!(alice.documents.text("readme.md").as_deref(), Some("# Title\nbody\n"));
}

#[tokio::test]
async fn test_takeover_race_shorter_backoff_wins() {
    let net = MemoryNetwork::default();
    let remote = MemoryRemote::new();
    let alice = Peer::spawn(&net, &remote, "alice");
    let bob = Peer::spawn_with(
        &net,
        &remote,
        "bob",
        PeerOptions {
            session: SessionConfig::for_testing().with_fixed_backoff(Duration::from_millis(20)),
            ..PeerOptions::default()
        },
    );
    let carol = Peer::spawn_with(
        &net,
        &remote,
        "carol",
        PeerOptions {
            session: SessionConfig::for_testing().with_fixed_backoff(Duration::from_millis(300)),
            ..PeerOptions::default()
        },
    );

    alice.coordinator.negotiate_host(ROOT).await.unwrap();
    bob.coordinator.negotiate_host(ROOT).await.unwrap();
    carol.coordinator.negotiate_host(ROOT).await.unwrap();
    assert!(
        wait_until(SETTLE, || {
            bob.coordinator.role() == SessionRole::Guest && carol.coordinator.role() == SessionRole::Guest
        })
        .await
    );
    bob.documents.insert_text("plan.md", 0, "draft").await.unwrap();
    assert!(wait_until(SETTLE, || carol.documents.text("plan.md").as_deref() == Some("draft")).await);

    net.disconnect(&"alice".to_string());

    assert!(
        wait_until(SETTLE, || {
            bob.coordinator.role() == SessionRole::Host
                && carol.coordinator.role() == SessionRole::Guest
                && carol.coordinator.host_id().as_deref() == Some("bob")
                && carol.coordinator.report().status == SessionStatus::Connected
        })
        .await,
        "bob: {}, carol: {}",
        bob.coordinator.report(),
        carol.coordinator.report()
    );

    assert_eq!(bob.coordinator.dead_host(), DeadHost::Peer("alice".into()));
    let meta = remote_metadata(&remote).unwrap();
    assert_eq!(meta.host_id.as_deref(), Some("bob"));

    // The new session still converges
    carol.documents.insert_text("plan.md", 5, " v2").await.unwrap();
    assert!(wait_until(SETTLE, || bob.documents.text("plan.md").as_deref() == Some("draft v2")).await);
}

#[tokio::test]
async fn test_encrypted_two_wrong_keys_then_cancel() {
    let net = MemoryNetwork::default();
    let remote = MemoryRemote::new();
    let alice = Peer::spawn(&net, &remote, "alice");
    alice.coordinator.set_encryption_key(Some("correct horse")).await.unwrap();
    alice.coordinator.negotiate_host(ROOT).await.unwrap();
    assert!(remote_metadata(&remote).unwrap().encrypted);

    let prompt = Arc::new(ScriptedPrompt::new([Some("wrong"), Some("also wrong"), None]));
    let carol = Peer::spawn_with(
        &net,
        &remote,
        "carol",
        PeerOptions {
            prompt: prompt.clone(),
            ..PeerOptions::default()
        },
    );
    let mut events = carol.coordinator.subscribe();
    let role_before = carol.coordinator.role();

    let err = carol.coordinator.negotiate_host(ROOT).await.unwrap_err();
    assert!(matches!(err, SessionError::Cancelled));
    assert_eq!(prompt.times_asked(), 3);

    let report = carol.coordinator.report();
    assert_eq!(report.status, SessionStatus::Error);
    assert_eq!(report.role, role_before);
    assert!(!carol.vault.has_key());
    assert_eq!(drain_warnings(&mut events), vec!["Incorrect Key", "Incorrect Key"]);

    // Metadata is untouched
    assert_eq!(remote_metadata(&remote).unwrap().host_id.as_deref(), Some("alice"));
    assert!(net.host_of(&"carol".to_string()).is_none());
}

#[tokio::test]
async fn test_encrypted_join_with_correct_key() {
    let net = MemoryNetwork::default();
    let remote = MemoryRemote::new();
    let alice = Peer::spawn(&net, &remote, "alice");
    alice.coordinator.set_encryption_key(Some("s3cret")).await.unwrap();
    alice.coordinator.negotiate_host(ROOT).await.unwrap();

    let prompt = Arc::new(ScriptedPrompt::new([Some("nope"), Some("s3cret")]));
    let bob = Peer::spawn_with(
        &net,
        &remote,
        "bob",
        PeerOptions {
            prompt: prompt.clone(),
            ..PeerOptions::default()
        },
    );
    let outcome = bob.coordinator.negotiate_host(ROOT).await.unwrap();
    assert_eq!(outcome, NegotiationOutcome::JoinRequested { host_id: "alice".into() });
    assert_eq!(prompt.times_asked(), 2);
    assert_eq!(bob.vault.active_password().as_deref(), Some("s3cret"));
    assert!(wait_until(SETTLE, || bob.coordinator.role() == SessionRole::Guest).await);

    // A known key skips the prompt on the next pass
    let again = Peer::spawn_with(
        &net,
        &remote,
        "bob-2",
        PeerOptions {
            prompt: Arc::new(ScriptedPrompt::default()),
            ..PeerOptions::default()
        },
    );
    again.vault.set_key("s3cret");
    again.coordinator.negotiate_host(ROOT).await.unwrap();
    assert!(wait_until(SETTLE, || again.coordinator.role() == SessionRole::Guest).await);
}

#[tokio::test]
async fn test_heartbeat_silence_triggers_takeover() {
    let net = MemoryNetwork::default();
    let remote = MemoryRemote::new();
    let (alice, bob) = host_and_guest(&net, &remote).await;
    let timeout = SessionConfig::for_testing().heartbeat_timeout;

    // Several heartbeat periods pass without a takeover
    tokio::time::sleep(timeout * 3).await;
    assert_eq!(bob.coordinator.role(), SessionRole::Guest);

    let mut events = bob.coordinator.subscribe();
    net.set_muted(&"alice".to_string(), true);
    let silenced = tokio::time::Instant::now();

    let negotiating = tokio::time::timeout(timeout * 4, async {
        loop {
            if let Ok(SessionEvent::StatusChanged(report)) = events.recv().await {
                if report.status == SessionStatus::Negotiating {
                    return tokio::time::Instant::now();
                }
            }
        }
    })
    .await
    .expect("guest never noticed the silent host");
    assert!(negotiating - silenced <= timeout + SessionConfig::for_testing().heartbeat_interval * 2);

    assert!(wait_until(SETTLE, || bob.coordinator.role() == SessionRole::Host).await);
    assert_eq!(bob.coordinator.dead_host(), DeadHost::HeartbeatTimeout);
    assert_eq!(remote_metadata(&remote).unwrap().host_id.as_deref(), Some("bob"));
    drop(alice);
}

#[tokio::test]
async fn test_persistence_is_gated_on_role() {
    let net = MemoryNetwork::default();
    let remote = MemoryRemote::new();
    let slow_saves = || PeerOptions {
        documents: DocumentConfig {
            save_debounce: Duration::from_millis(200),
            ..DocumentConfig::for_testing()
        },
        ..PeerOptions::default()
    };
    let alice = Peer::spawn_with(&net, &remote, "alice", slow_saves());
    let bob = Peer::spawn_with(&net, &remote, "bob", slow_saves());
    alice.coordinator.negotiate_host(ROOT).await.unwrap();
    bob.coordinator.negotiate_host(ROOT).await.unwrap();
    assert!(wait_until(SETTLE, || bob.coordinator.role() == SessionRole::Guest).await);

    for word in ["one ", "two ", "three ", "four ", "five "] {
        let at = bob.documents.text("log.md").map(|t| t.len()).unwrap_or(0) as u32;
        bob.documents.insert_text("log.md", at, word).await.unwrap();
    }
    let doc_path = std::path::Path::new(ROOT).join("log.md");

    assert!(wait_until(SETTLE, || alice.files.write_count(&doc_path) == 1).await);
    // Quiet period over; nothing else arrives
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(alice.files.write_count(&doc_path), 1);
    assert_eq!(alice.documents.text("log.md").as_deref(), Some("one two three four five "));

    let meta = support::meta_path();
    assert_eq!(bob.files.total_writes_excluding(&[meta.as_path()]), 0);
}

#[tokio::test]
async fn test_plugin_mismatch_keeps_role_and_lists_missing() {
    let net = MemoryNetwork::default();
    let remote = MemoryRemote::new();
    let alice = Peer::spawn_with(
        &net,
        &remote,
        "alice",
        PeerOptions {
            plugins: vec!["mermaid", "katex", "charts"],
            ..PeerOptions::default()
        },
    );
    alice.coordinator.negotiate_host(ROOT).await.unwrap();

    let bob = Peer::spawn_with(
        &net,
        &remote,
        "bob",
        PeerOptions {
            plugins: vec!["katex"],
            ..PeerOptions::default()
        },
    );
    let mut events = bob.coordinator.subscribe();
    let err = bob.coordinator.negotiate_host(ROOT).await.unwrap_err();
    match err {
        SessionError::PluginMismatch { missing } => assert_eq!(missing, vec!["charts", "mermaid"]),
        other => panic!("expected plugin mismatch, got {other:?}"),
    }
    assert_eq!(bob.coordinator.role(), SessionRole::Host);
    let warnings = drain_warnings(&mut events);
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("charts, mermaid"));
}
