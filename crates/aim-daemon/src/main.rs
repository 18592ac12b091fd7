//! # AIM Daemon
//!
//! Main binary that composes the messaging core:
//! - identity kernel, session manager, store, notification bus
//! - dispatch loop (pending delivery with retry/backoff)
//! - inbound pipeline fed by the transport subscription
//! - upload-session reaper and state-envelope flusher
//! - a line-delimited JSON-RPC adapter on stdin/stdout
//!
//! The anonymous transport node is an external collaborator; without one
//! configured the daemon runs on the in-process transport, which is enough
//! for local clients and tests.

mod accounts;
mod persist;
mod rpc;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use aim_core::backup::Backups;
use aim_core::collab::{AcceptAllPolicy, BlobStore, InMemoryBlobStore, InMemoryMessageRequests, NoGroups};
use aim_core::dispatch::{DispatchLoop, DispatchQueue};
use aim_core::inbound::Inbound;
use aim_core::notify::NotificationBus;
use aim_core::outbound::Messaging;
use aim_core::revocation::Revocations;
use aim_core::transport::MemoryTransport;
use aim_core::uploads::Uploads;
use aim_core::CoreContext;
use aim_identity::IdentityKernel;
use aim_session::SessionManager;
use aim_store::Store;

use accounts::Accounts;
use persist::EnvelopePersister;
use rpc::Capabilities;
use server::Daemon;

#[derive(Parser, Debug)]
#[command(name = "aimd", about = "End-to-end encrypted personal messaging daemon")]
struct Args {
    /// Passphrase protecting the on-disk state envelope.
    #[arg(long, env = "AIM_STATE_PASSPHRASE", hide_env_values = true)]
    state_passphrase: String,

    /// Override the state directory from config.
    #[arg(long)]
    state_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = aim_common::config::init()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "aim=debug".into()),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("starting aimd v{}", env!("CARGO_PKG_VERSION"));

    // === Core components ===
    let kernel = Arc::new(IdentityKernel::new());
    let sessions = Arc::new(SessionManager::from_identity_secret(&[]));
    let store = Arc::new(Store::new());
    let bus = Arc::new(NotificationBus::new(
        config.limits.notification_backlog,
        config.limits.subscriber_buffer,
    ));

    // === Encrypted state envelope ===
    let state_dir = args
        .state_dir
        .unwrap_or_else(|| PathBuf::from(&config.daemon.state_dir));
    let state_path = state_dir.join(&config.daemon.state_file);
    let persister = EnvelopePersister::new(
        kernel.clone(),
        sessions.clone(),
        store.clone(),
        state_path.clone(),
        args.state_passphrase,
    );
    if persister.exists() {
        persister.load()?;
        tracing::info!(path = %state_path.display(), "state envelope loaded");
    } else {
        tracing::info!(path = %state_path.display(), "no state envelope yet; create an identity to start");
    }
    let flusher = persister.spawn_flusher();

    // === Transport ===
    // In-process transport until an anonymous network node is attached.
    let transport = MemoryTransport::new();

    let ctx = Arc::new(CoreContext {
        kernel: kernel.clone(),
        sessions,
        store,
        bus,
        transport: transport.clone(),
        groups: Arc::new(NoGroups),
        persister: persister.clone(),
    });

    // === Services ===
    let queue = DispatchQueue::new();
    let blobs: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::default());
    let uploads = Uploads::new(blobs.clone());
    let reaper = uploads.spawn_reaper();

    let capabilities = Capabilities::IDENTITY
        | Capabilities::CONTACTS
        | Capabilities::MESSAGING
        | Capabilities::SESSIONS
        | Capabilities::DEVICES
        | Capabilities::BACKUP
        | Capabilities::FILES
        | Capabilities::BLOBS
        | Capabilities::ACCOUNTS;
    tracing::info!(?capabilities, "capability set published");

    let daemon = Arc::new(Daemon {
        ctx: ctx.clone(),
        messaging: Messaging::new(ctx.clone(), queue.clone()),
        revocations: Revocations::new(ctx.clone()),
        backups: Backups::new(ctx.clone()),
        uploads,
        blobs,
        accounts: Arc::new(Accounts::new(state_dir, persister.clone(), kernel.clone())),
        capabilities,
    });

    // === Dispatch loop ===
    let (dispatch, dispatch_handle) = DispatchLoop::new(ctx.clone(), queue);
    let dispatch_task = tokio::spawn(dispatch.run());

    // === Inbound subscription ===
    // One task reading the subscription keeps inbound processing serialized
    // per sender, as the pipeline requires. The subscription opens as soon
    // as an identity exists, whether loaded from the envelope or created
    // over RPC after startup.
    let inbound = Inbound::new(
        ctx.clone(),
        Arc::new(AcceptAllPolicy),
        Arc::new(InMemoryMessageRequests::default()),
    );
    let inbound_task = tokio::spawn({
        let kernel = kernel.clone();
        let ctx = ctx.clone();
        async move {
            let mut current_id = loop {
                if let Some(identity) = kernel.identity() {
                    break identity.id;
                }
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            };
            let mut rx = ctx.transport.subscribe(&current_id);
            tracing::info!(identity = %current_id, "inbound subscription open");
            loop {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(msg) => {
                            let outcome = inbound.handle(msg).await;
                            tracing::debug!(?outcome, "inbound message processed");
                        }
                        None => break,
                    },
                    _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {
                        // The identity changes under us on account switch or
                        // identity re-creation; the subscription follows it.
                        if let Some(identity) = kernel.identity() {
                            if identity.id != current_id {
                                current_id = identity.id;
                                rx = ctx.transport.subscribe(&current_id);
                                tracing::info!(identity = %current_id, "inbound subscription moved");
                            }
                        }
                    }
                }
            }
        }
    });

    // === RPC adapter (line-delimited JSON on stdio) ===
    let rpc_daemon = daemon.clone();
    let rpc_task = tokio::spawn(async move { serve_stdio(rpc_daemon).await });

    tracing::info!("aimd ready");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    // Cancellation is non-destructive: in-flight work completes, then tasks exit.
    dispatch_handle.shutdown().await;
    let _ = dispatch_task.await;
    rpc_task.abort();
    inbound_task.abort();
    drop(reaper);
    drop(flusher);
    persister.flush_now().ok();

    Ok(())
}

/// Serve `{"id":…,"method":…,"params":…}` requests, one per line, on stdio.
///
/// This is deliberately minimal — real clients attach through the external
/// JSON-RPC plumbing; the daemon side of the contract is [`Daemon::dispatch`].
async fn serve_stdio(daemon: Arc<Daemon>) {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Value>(&line) {
            Ok(request) => {
                let id = request.get("id").cloned().unwrap_or(Value::Null);
                let method = request
                    .get("method")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                let params = request.get("params").cloned().unwrap_or(json!({}));
                match daemon.dispatch(&method, params).await {
                    Ok(result) => json!({ "id": id, "result": result }),
                    Err(err) => json!({
                        "id": id,
                        "error": { "code": err.code, "message": err.message }
                    }),
                }
            }
            Err(e) => json!({
                "id": Value::Null,
                "error": { "code": -32700, "message": format!("parse error: {e}") }
            }),
        };
        let mut out = response.to_string();
        out.push('\n');
        if stdout.write_all(out.as_bytes()).await.is_err() {
            break;
        }
    }
}
