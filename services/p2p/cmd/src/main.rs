//! P2P node binary.
//!
//! Runs two members in one process, each with its own session manager, and
//! links them with an in-memory transport. Demo traffic flows from the local
//! member to the peer so negotiation, persistence, acks and expiry can be
//! observed in the logs.

use clap::Parser;
use p2p_session::{
    BoundedRevocationChecker, ChannelPublisher, IdentityKeyPair, InMemoryMembership,
    InboundPayload, LocalIdentities, LocalKeyManagement, MemberInfo, MemberStatus,
    OutboundMessage, RevocationList, SessionCounterparties, SessionManagerConfig,
    SessionManagerDeps, StatefulSessionManager, SystemClock,
};
use p2p_state::{open_store, StateStore, StoreMode};
use p2p_wire::{decode_record, encode_record, HoldingIdentity, WireRecord};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::NodeConfig;
use logging::P2pLogFormatter;

// Component logging macros are defined in logging.rs and available via #[macro_export]

/// Stateful p2p session node
#[derive(Parser, Debug)]
#[command(name = "p2p-node", version, about = "Stateful p2p session manager node")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Storage mode override: memory, file
    #[arg(long)]
    storage_mode: Option<String>,

    /// Data directory override for file storage
    #[arg(long)]
    data_dir: Option<String>,

    /// Session lifetime override, e.g. 12h
    #[arg(long)]
    session_ttl: Option<humantime::Duration>,

    /// Dead session timeout override, e.g. 30s
    #[arg(long)]
    dead_session_timeout: Option<humantime::Duration>,

    /// Number of demo messages to send
    #[arg(long)]
    messages: Option<usize>,

    /// Delay between demo messages, e.g. 500ms
    #[arg(long)]
    interval: Option<humantime::Duration>,
}

impl Args {
    fn apply(&self, config: &mut NodeConfig) {
        if let Some(mode) = &self.storage_mode {
            config.storage_mode = mode.to_lowercase();
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(ttl) = self.session_ttl {
            config.session_ttl = ttl.into();
        }
        if let Some(timeout) = self.dead_session_timeout {
            config.dead_session_timeout = timeout.into();
        }
        if let Some(count) = self.messages {
            config.message_count = count;
        }
        if let Some(interval) = self.interval {
            config.message_interval = interval.into();
        }
    }
}

/// One member and its session manager
struct Member {
    identity: HoldingIdentity,
    manager: StatefulSessionManager,
    outbound: mpsc::UnboundedReceiver<WireRecord>,
}

fn build_member(
    identity: HoldingIdentity,
    store: Arc<dyn StateStore>,
    session_config: &SessionManagerConfig,
    membership: Arc<InMemoryMembership>,
    revoked: &[HoldingIdentity],
) -> Member {
    let keys = IdentityKeyPair::generate(identity.clone());
    membership.upsert(MemberInfo {
        identity: identity.clone(),
        static_public: keys.public(),
        status: MemberStatus::Active,
        serial: 1,
    });

    let identities = LocalIdentities::new();
    identities.add(keys);

    let kms = LocalKeyManagement::new();
    kms.ensure_key(&session_config.key_alias);

    let revocation = RevocationList::new();
    for member in revoked {
        revocation.revoke(member.clone());
    }

    let (publisher, outbound) = ChannelPublisher::new();
    let manager = StatefulSessionManager::new(
        session_config.clone(),
        SessionManagerDeps {
            store,
            kms: Arc::new(kms),
            membership,
            revocation: Arc::new(BoundedRevocationChecker::new(
                Arc::new(revocation),
                session_config.revocation_check_timeout,
            )),
            publisher: Arc::new(publisher),
            identities: Arc::new(identities),
            clock: Arc::new(SystemClock),
        },
    );

    Member {
        identity,
        manager,
        outbound,
    }
}

/// Carry records published by one member to the other through the wire codec
fn spawn_link(
    name: &'static str,
    mut outbound: mpsc::UnboundedReceiver<WireRecord>,
    target: StatefulSessionManager,
    delivered: mpsc::UnboundedSender<InboundPayload>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(record) = outbound.recv().await {
            let bytes = match encode_record(&record) {
                Ok(bytes) => bytes,
                Err(e) => {
                    component_warn!("link", "{}: failed to encode {}: {}", name, record.message.kind(), e);
                    continue;
                }
            };
            let record = match decode_record(&bytes) {
                Ok(record) => record,
                Err(e) => {
                    component_warn!("link", "{}: failed to decode record: {}", name, e);
                    continue;
                }
            };

            component_debug!(
                "link",
                "{}: {} {} -> {} ({} bytes)",
                name,
                record.message.kind(),
                record.header.source,
                record.header.destination,
                bytes.len()
            );

            match target.process_inbound(record).await {
                Ok(Some(payload)) => {
                    if delivered.send(payload).is_err() {
                        debug!("{}: delivery channel closed", name);
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => component_warn!("link", "{}: processing failed: {}", name, e),
            }
        }
        debug!("{}: link stopped", name);
    })
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("p2p_node={}", args.log_level).parse()?)
        .add_directive(format!("redb_p2p={}", args.log_level).parse()?)
        .add_directive(format!("p2p_session={}", args.log_level).parse()?)
        .add_directive(format!("p2p_state={}", args.log_level).parse()?)
        .add_directive(format!("p2p_wire={}", args.log_level).parse()?);

    let formatter = P2pLogFormatter::new("p2p".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(true)
        .event_format(formatter)
        .init();

    info!("Starting reDB P2P Node v{}", env!("CARGO_PKG_VERSION"));

    let mut node_config = NodeConfig::load_from_file(&args.config)?;
    args.apply(&mut node_config);
    debug!(
        "Effective configuration: {}",
        serde_json::to_string(&node_config)?
    );

    let session_config = node_config.session_config();
    let store_mode = node_config.store_mode()?;
    info!(
        "Session config: {}, storage={:?}",
        session_config, store_mode
    );

    let local_id = HoldingIdentity::new(node_config.node_name.clone(), node_config.group_id.clone());
    let peer_id = HoldingIdentity::new(node_config.peer_name.clone(), node_config.group_id.clone());
    let revoked: Vec<HoldingIdentity> = node_config
        .revoked
        .iter()
        .map(|name| HoldingIdentity::new(name.clone(), node_config.group_id.clone()))
        .collect();

    let membership = Arc::new(InMemoryMembership::new());
    let local_store = open_store(store_mode).await?;
    let peer_store = open_store(StoreMode::InMemory).await?;

    let local = build_member(
        local_id.clone(),
        local_store,
        &session_config,
        membership.clone(),
        &revoked,
    );
    let peer = build_member(
        peer_id.clone(),
        peer_store,
        &session_config,
        membership,
        &revoked,
    );

    component_info!("session", "Hosting {} and {}", local.identity, peer.identity);

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    tasks.extend(local.manager.start());
    tasks.extend(peer.manager.start());

    let (delivered_tx, mut delivered_rx) = mpsc::unbounded_channel::<InboundPayload>();
    tasks.push(spawn_link(
        "local->peer",
        local.outbound,
        peer.manager.clone(),
        delivered_tx.clone(),
    ));
    tasks.push(spawn_link(
        "peer->local",
        peer.outbound,
        local.manager.clone(),
        delivered_tx,
    ));

    let counterparties = SessionCounterparties {
        initiation_timestamp: chrono::Utc::now().timestamp_millis().max(0) as u64,
        ..SessionCounterparties::new(local_id, peer_id)
    };

    let mut ticker =
        tokio::time::interval(node_config.message_interval.max(Duration::from_millis(1)));
    let mut sent = 0usize;
    let mut received = 0usize;

    info!(
        "Sending {} messages every {:?}",
        node_config.message_count, node_config.message_interval
    );

    loop {
        if received >= node_config.message_count {
            info!("All {} messages delivered", received);
            break;
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down");
                break;
            }

            _ = ticker.tick(), if sent < node_config.message_count => {
                let message = OutboundMessage::new(
                    uuid::Uuid::new_v4().to_string(),
                    format!("message {} at {}", sent, chrono::Utc::now().to_rfc3339()),
                    counterparties.clone(),
                );
                sent += 1;

                match local.manager.send_messages(vec![message]).await {
                    Ok(report) => component_debug!(
                        "session",
                        "Send report: published={}, queued={}, dropped={}",
                        report.published, report.queued, report.dropped
                    ),
                    Err(e) => component_warn!("session", "Send failed: {}", e),
                }
            }

            Some(payload) = delivered_rx.recv() => {
                received += 1;
                component_info!(
                    "session",
                    "Delivered {} on {}: {}",
                    payload.message_id,
                    payload.header.session_id,
                    String::from_utf8_lossy(&payload.payload)
                );
            }

            else => {
                warn!("Delivery channel closed, shutting down");
                break;
            }
        }
    }

    info!("P2P node shutting down");
    info!(
        "Peer caches {} inbound session(s); {} expiry timer(s) armed locally",
        peer.manager.inbound_cache().len(),
        local.manager.scheduler().pending_timers()
    );

    for task in &tasks {
        task.abort();
    }
    futures::future::join_all(tasks).await;

    info!("P2P node shutdown complete");
    Ok(())
}
