//! Uplink service binary.
//!
//! Runs the operations channel against the configured servers, with the
//! shared failover manager and channel manager, until a signal arrives or
//! failover gives up.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::info;
use uplink_channel::{
    ChannelContext, ChannelManager, ChannelState, DataChannel, DefaultFailoverManager,
    FatalError, IdentityStore, OperationChannel, ServerRole, TransportProtocolId,
};

mod collaborators;
mod config;
mod logging;

use collaborators::{
    InMemoryIdentity, JsonMultiplexer, LoggingDemultiplexer, SocketConnectivityChecker,
};
use config::{ServerEntry, UplinkConfig};

/// Device uplink: keeps the operations channel connected
#[derive(Parser, Debug)]
#[command(name = "uplink", version, about = "Device uplink to the operations servers")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "uplink.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Keep-alive negotiated with the server, in seconds
    #[arg(long)]
    keep_alive: Option<u16>,

    /// Operations server as host:port:hexkey (repeatable, replaces the config list)
    #[arg(long = "server")]
    servers: Vec<String>,

    /// Address probed to detect a lost network, e.g. 1.1.1.1:53
    #[arg(long)]
    connectivity_probe: Option<String>,

    /// Delay before the first failover retry, e.g. 5s
    #[arg(long)]
    retry_delay: Option<humantime::Duration>,

    /// Hex encoded 32-byte device key seed; random when absent
    #[arg(long)]
    identity_seed: Option<String>,
}

impl Args {
    fn apply_to(&self, config: &mut UplinkConfig) -> anyhow::Result<()> {
        if let Some(keep_alive) = self.keep_alive {
            config.keep_alive = keep_alive;
        }
        if !self.servers.is_empty() {
            config.operations_servers = self
                .servers
                .iter()
                .map(|entry| ServerEntry::parse(entry))
                .collect::<anyhow::Result<_>>()?;
        }
        if let Some(probe) = &self.connectivity_probe {
            config.connectivity_probe = Some(probe.clone());
        }
        if let Some(delay) = self.retry_delay {
            config.failover.retry_delay = delay.to_string();
        }
        config.validate()
    }

    fn identity_seed(&self) -> anyhow::Result<Option<[u8; 32]>> {
        let Some(seed) = &self.identity_seed else {
            return Ok(None);
        };
        let bytes = hex::decode(seed)?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("identity seed must be 32 bytes"))?;
        Ok(Some(seed))
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level)?;

    info!("Starting uplink service v{}", env!("CARGO_PKG_VERSION"));

    let mut config = UplinkConfig::load_from_file(&args.config)?;
    args.apply_to(&mut config)?;

    let (failover, failover_signals) = DefaultFailoverManager::new(config.failover_policy()?);
    let failover = Arc::new(failover);
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<FatalError>();

    let manager = ChannelManager::new(failover.clone(), fatal_tx.clone());
    let signals_task = manager.attach_failover_signals(failover_signals);

    if let Some(probe) = &config.connectivity_probe {
        component_info!("supervisor", "Probing connectivity through {}", probe);
        manager
            .set_connectivity_checker(SocketConnectivityChecker::spawn(
                probe.clone(),
                Duration::from_secs(3),
                Duration::from_secs(5),
            ))
            .await;
    }

    let identity = Arc::new(InMemoryIdentity::new(args.identity_seed()?));
    info!(
        "Device public key: {}",
        hex::encode(identity.public_key())
    );

    let channel = OperationChannel::spawn(
        config.channel_config()?,
        ChannelContext {
            identity,
            failover,
            fatal: fatal_tx,
        },
    );
    channel.set_multiplexer(Arc::new(JsonMultiplexer::default()));
    channel.set_demultiplexer(Arc::new(LoggingDemultiplexer::default()));
    manager.add_channel(Arc::new(channel.clone())).await;

    let status_task = tokio::spawn(watch_status(channel.clone()));

    let operations = config.operations_servers()?;
    if operations.is_empty() {
        component_warn!("supervisor", "No operations servers configured, channel stays closed");
    }
    manager
        .set_servers(ServerRole::Operations, TransportProtocolId::TCP, operations)
        .await;
    manager
        .set_servers(
            ServerRole::Bootstrap,
            TransportProtocolId::TCP,
            config.bootstrap_servers()?,
        )
        .await;

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGINT handler: {}", e))?;

    info!("Uplink started. Waiting for events...");

    let fatal = tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM signal, shutting down");
            None
        }
        _ = sigint.recv() => {
            info!("Received SIGINT signal, shutting down");
            None
        }
        Some(fatal) = fatal_rx.recv() => Some(fatal),
    };

    manager.shutdown().await;
    wait_for_shutdown(&channel).await;
    status_task.abort();
    signals_task.abort();

    if let Some(fatal) = fatal {
        component_error!(
            "supervisor",
            "Failover gave up on {:?} reported by [{}], exiting",
            fatal.status,
            fatal.channel_id
        );
        std::process::exit(1);
    }

    info!("Uplink stopped");
    Ok(())
}

async fn watch_status(channel: OperationChannel) {
    let mut status = channel.subscribe();
    let mut last = status.borrow().state;
    while status.changed().await.is_ok() {
        let current = status.borrow_and_update().clone();
        if current.state == last {
            continue;
        }
        last = current.state;
        match current.state {
            ChannelState::Opened => component_info!(
                "channel",
                "[{}] opened to {} ({} connection(s) so far)",
                channel.id(),
                current.server.map(|s| s.address()).unwrap_or_default(),
                current.stats.connections
            ),
            state => component_debug!("channel", "[{}] is now {:?}", channel.id(), state),
        }
    }
}

async fn wait_for_shutdown(channel: &OperationChannel) {
    let mut status = channel.subscribe();
    let stopped = tokio::time::timeout(Duration::from_secs(2), async {
        while status.borrow_and_update().state != ChannelState::Shutdown {
            if status.changed().await.is_err() {
                break;
            }
        }
    })
    .await;
    if stopped.is_err() {
        component_warn!("supervisor", "Channel [{}] did not confirm shutdown", channel.id());
    }
}
