//! weft-node: runs one collaborative peer for a project directory.
//!
//! `weft-node run --project ./notes` joins or hosts the session recorded in
//! `./notes/.collab_meta.json`; `weft-node simulate` runs an in-process
//! three-peer failover demo.

mod prompt;
mod simulation;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use weft_collab::{
    CryptoVault, DocumentConfig, DocumentStore, GitFileStore, PeerTransport, Services, SessionConfig,
    SessionCoordinator, SessionEvent, StaticPlugins, TransportConfig, VaultConfig, WsTransport,
};

use prompt::StdinPrompt;

/// Serverless collaborative editing peer.
#[derive(Parser)]
#[command(name = "weft-node", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join or host the session of a project directory.
    Run(RunArgs),
    /// Three peers on an in-process network; the host leaves.
    Simulate,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Project directory (a git working tree).
    #[arg(long)]
    project: PathBuf,

    /// Address to listen on for peers.
    #[arg(long, default_value = "0.0.0.0:0")]
    bind: String,

    /// Host name to advertise instead of the detected LAN address.
    #[arg(long)]
    advertise: Option<String>,

    /// Session password; encrypts the published addresses.
    #[arg(long, env = "WEFT_PASSWORD")]
    password: Option<String>,

    /// SSH private key used for git pull/push.
    #[arg(long)]
    ssh_key: Option<String>,

    /// Enabled plugin id (repeatable).
    #[arg(long = "plugin")]
    plugins: Vec<String>,

    /// Admit every join request without asking.
    #[arg(long)]
    auto_approve: bool,

    /// File remembering the session password between runs.
    #[arg(long)]
    preferences: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Simulate => simulation::run().await,
    }
}

async fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let project = args.project.canonicalize()?;

    let transport = Arc::new(
        WsTransport::bind(TransportConfig {
            bind_addr: args.bind,
            advertise_host: args.advertise,
            ..TransportConfig::default()
        })
        .await?,
    );
    let files = Arc::new(GitFileStore::new());
    let documents = Arc::new(DocumentStore::new(
        DocumentConfig::default(),
        files.clone(),
        transport.clone(),
    ));
    let vault = Arc::new(CryptoVault::new(VaultConfig {
        preferences_path: args.preferences,
        ..VaultConfig::default()
    }));
    if let Err(e) = vault.load_preferences() {
        log::warn!("Ignoring unreadable preferences: {e}");
    }

    let (prompt, mut commands) = StdinPrompt::spawn();
    let services = Services {
        transport: transport.clone() as Arc<dyn PeerTransport>,
        files,
        documents,
        vault,
        prompt: Arc::new(prompt),
        plugins: Arc::new(StaticPlugins::new(args.plugins)),
    };
    let config = SessionConfig {
        credentials: args.ssh_key,
        auto_approve_joins: args.auto_approve,
        ..SessionConfig::default()
    };
    let coordinator = SessionCoordinator::new(config, services);
    let mut events = coordinator.subscribe();

    if let Some(password) = args.password.as_deref() {
        coordinator.set_encryption_key(Some(password)).await?;
    }

    println!("Peer {} at {:?}", transport.local_peer_id().unwrap_or_default(), transport.addresses());
    match coordinator.negotiate_host(&project).await {
        Ok(outcome) => log::info!("Negotiation: {outcome:?}"),
        Err(e) => eprintln!("Negotiation failed: {e} (type `retry` to try again)"),
    }
    println!("Commands: status | approve <peer> | reject <peer> | retry | quit");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(n)) => log::warn!("Missed {n} session events"),
                Err(RecvError::Closed) => break,
            },
            line = commands.recv() => {
                let Some(line) = line else { break };
                if !handle_command(&coordinator, line.trim()).await {
                    break;
                }
            }
        }
    }

    coordinator.shutdown();
    transport.close();
    Ok(())
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::StatusChanged(report) => println!("{report}"),
        SessionEvent::RoleChanged(role) => println!("Role: {role}"),
        SessionEvent::Warning(msg) => eprintln!("Warning: {msg}"),
        SessionEvent::JoinRequested(peer) => {
            println!("{peer} wants to join (approve {peer} / reject {peer})")
        }
    }
}

/// Returns false when the loop should stop.
async fn handle_command(coordinator: &SessionCoordinator, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    let result = match (parts.next(), parts.next()) {
        (Some("quit"), _) => return false,
        (Some("status"), _) => {
            println!("{}", coordinator.report());
            let pending = coordinator.pending_joins();
            if !pending.is_empty() {
                println!("Pending: {}", pending.join(", "));
            }
            Ok(())
        }
        (Some("approve"), Some(peer)) => coordinator.approve_join(&peer.to_string()).await,
        (Some("reject"), Some(peer)) => coordinator.reject_join(&peer.to_string()).await,
        (Some("retry"), _) => coordinator.renegotiate().await.map(|_| ()),
        (None, _) => Ok(()),
        _ => {
            println!("Unknown command: {line}");
            Ok(())
        }
    };
    if let Err(e) = result {
        eprintln!("{e}");
    }
    true
}
