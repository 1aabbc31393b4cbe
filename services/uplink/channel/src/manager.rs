//! Channel manager for routing feature syncs and lifecycle events
//!
//! The manager owns every data channel of the client, keeps the ordered
//! server list per (role, protocol), and fans lifecycle and server updates
//! out to the channels that match. It also consumes the rotation signals of
//! the failover manager and moves channels to the next server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::boundary::ConnectivityChecker;
use crate::channel::FatalError;
use crate::failover::{FailoverDecision, FailoverManager, FailoverStatus, ServerFailed};
use crate::types::{DirectionMap, ServerDescriptor, ServerRole, TransportProtocolId, TransportType};

/// Identifier used when the manager itself reports a fatal decision
pub const MANAGER_ID: &str = "channel_manager";

/// Operations every data channel exposes to the manager
///
/// All methods only enqueue work; none of them blocks on I/O.
pub trait DataChannel: Send + Sync {
    /// Channel identifier
    fn id(&self) -> &str;
    /// Role of the servers this channel talks to
    fn server_role(&self) -> ServerRole;
    /// Transport protocol this channel speaks
    fn transport_protocol(&self) -> TransportProtocolId;
    /// Transports carried with their directions
    fn supported_types(&self) -> &DirectionMap;
    /// Select the destination server
    fn set_server(&self, server: ServerDescriptor);
    /// Current destination server
    fn server(&self) -> Option<ServerDescriptor>;
    /// Replace the connectivity probe
    fn set_connectivity_checker(&self, checker: Arc<dyn ConnectivityChecker>);
    /// Sync the listed transports
    fn sync(&self, types: &[TransportType]);
    /// Sync every supported transport
    fn sync_all(&self);
    /// Acknowledge a completed sync of the listed transports
    fn sync_ack(&self, types: &[TransportType]);
    /// Suspend the channel
    fn pause(&self);
    /// Leave the paused state
    fn resume(&self);
    /// Shut the channel down for good
    fn shutdown(&self);
}

#[derive(Debug, Default)]
struct ServerList {
    servers: Vec<ServerDescriptor>,
    current: usize,
}

impl ServerList {
    fn current(&self) -> Option<&ServerDescriptor> {
        self.servers.get(self.current)
    }
}

/// Routes syncs and lifecycle events to data channels
pub struct ChannelManager {
    /// Channels in registration order
    channels: RwLock<Vec<Arc<dyn DataChannel>>>,
    /// Server lists by role and protocol
    servers: RwLock<HashMap<(ServerRole, TransportProtocolId), ServerList>>,
    connectivity: RwLock<Option<Arc<dyn ConnectivityChecker>>>,
    failover: Arc<dyn FailoverManager>,
    fatal: mpsc::UnboundedSender<FatalError>,
    paused: AtomicBool,
    shut_down: AtomicBool,
}

impl ChannelManager {
    /// Create a manager; STOP decisions are reported on `fatal`
    pub fn new(
        failover: Arc<dyn FailoverManager>,
        fatal: mpsc::UnboundedSender<FatalError>,
    ) -> Arc<Self> {
        Arc::new(Self {
            channels: RwLock::new(Vec::new()),
            servers: RwLock::new(HashMap::new()),
            connectivity: RwLock::new(None),
            failover,
            fatal,
            paused: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Register a channel, replacing one with the same id
    pub async fn add_channel(&self, channel: Arc<dyn DataChannel>) {
        if self.shut_down.load(Ordering::SeqCst) {
            warn!("Can't add channel [{}], manager is shut down", channel.id());
            return;
        }
        info!(
            "Adding channel [{}] ({:?}, {})",
            channel.id(),
            channel.server_role(),
            channel.transport_protocol()
        );

        if let Some(checker) = self.connectivity.read().await.clone() {
            channel.set_connectivity_checker(checker);
        }
        if self.paused.load(Ordering::SeqCst) {
            channel.pause();
        }
        let key = (channel.server_role(), channel.transport_protocol());
        if let Some(server) = self.servers.read().await.get(&key).and_then(|l| l.current()) {
            channel.set_server(server.clone());
        }

        let mut channels = self.channels.write().await;
        if let Some(existing) = channels.iter_mut().find(|c| c.id() == channel.id()) {
            warn!("Channel [{}] was already registered, replacing it", channel.id());
            *existing = channel;
        } else {
            channels.push(channel);
        }
    }

    /// Unregister a channel and shut it down
    pub async fn remove_channel(&self, id: &str) -> Option<Arc<dyn DataChannel>> {
        let mut channels = self.channels.write().await;
        let index = channels.iter().position(|c| c.id() == id)?;
        let channel = channels.remove(index);
        info!("Removed channel [{}]", id);
        channel.shutdown();
        Some(channel)
    }

    /// Registered channel ids
    pub async fn channel_ids(&self) -> Vec<String> {
        self.channels
            .read()
            .await
            .iter()
            .map(|c| c.id().to_string())
            .collect()
    }

    /// Channel that carries `typ`; bootstrap goes to the bootstrap role
    async fn channel_for(&self, typ: TransportType) -> Option<Arc<dyn DataChannel>> {
        let role = match typ {
            TransportType::Bootstrap => ServerRole::Bootstrap,
            _ => ServerRole::Operations,
        };
        self.channels
            .read()
            .await
            .iter()
            .find(|c| c.server_role() == role && c.supported_types().contains_key(&typ))
            .cloned()
    }

    /// Sync one transport on the channel carrying it
    pub async fn sync(&self, typ: TransportType) {
        match self.channel_for(typ).await {
            Some(channel) => channel.sync(&[typ]),
            None => warn!("No channel carries {:?}, sync dropped", typ),
        }
    }

    /// Acknowledge a sync of one transport on the channel carrying it
    pub async fn sync_ack(&self, typ: TransportType) {
        match self.channel_for(typ).await {
            Some(channel) => channel.sync_ack(&[typ]),
            None => warn!("No channel carries {:?}, sync ack dropped", typ),
        }
    }

    /// Full sync on every channel
    pub async fn sync_all(&self) {
        for channel in self.channels.read().await.iter() {
            channel.sync_all();
        }
    }

    /// Full sync on every channel of `role`
    pub async fn sync_all_for(&self, role: ServerRole) {
        for channel in self
            .channels
            .read()
            .await
            .iter()
            .filter(|c| c.server_role() == role)
        {
            channel.sync_all();
        }
    }

    /// Pause every channel
    pub async fn pause(&self) {
        if self.paused.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Pausing all channels");
        for channel in self.channels.read().await.iter() {
            channel.pause();
        }
    }

    /// Resume every channel
    pub async fn resume(&self) {
        if !self.paused.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Resuming all channels");
        for channel in self.channels.read().await.iter() {
            channel.resume();
        }
    }

    /// Shut every channel down; the manager accepts no new channels after this
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down all channels");
        for channel in self.channels.read().await.iter() {
            channel.shutdown();
        }
    }

    /// Install a connectivity probe on every current and future channel
    pub async fn set_connectivity_checker(&self, checker: Arc<dyn ConnectivityChecker>) {
        *self.connectivity.write().await = Some(checker.clone());
        for channel in self.channels.read().await.iter() {
            channel.set_connectivity_checker(checker.clone());
        }
    }

    /// Replace the server list for a role and protocol; the first entry is applied
    pub async fn set_servers(
        &self,
        role: ServerRole,
        protocol: TransportProtocolId,
        servers: Vec<ServerDescriptor>,
    ) {
        info!(
            "Setting {} {:?} server(s) for protocol {}",
            servers.len(),
            role,
            protocol
        );
        let first = servers.first().cloned();
        self.servers
            .write()
            .await
            .insert((role, protocol), ServerList { servers, current: 0 });

        match first {
            Some(server) => self.apply_server(server).await,
            None => warn!("Empty {:?} server list for protocol {}", role, protocol),
        }
    }

    /// Make `server` current for its role and protocol
    pub async fn on_transport_connection_info_updated(&self, server: ServerDescriptor) {
        {
            let mut servers = self.servers.write().await;
            let list = servers.entry((server.role, server.protocol)).or_default();
            match list.servers.iter().position(|s| s.same_endpoint(&server)) {
                Some(index) => {
                    list.servers[index] = server.clone();
                    list.current = index;
                }
                None => {
                    list.servers.push(server.clone());
                    list.current = list.servers.len() - 1;
                }
            }
        }
        self.apply_server(server).await;
    }

    /// Current server for a role and protocol
    pub async fn current_server(
        &self,
        role: ServerRole,
        protocol: TransportProtocolId,
    ) -> Option<ServerDescriptor> {
        self.servers
            .read()
            .await
            .get(&(role, protocol))
            .and_then(|l| l.current().cloned())
    }

    async fn apply_server(&self, server: ServerDescriptor) {
        for channel in self.channels.read().await.iter().filter(|c| {
            c.server_role() == server.role && c.transport_protocol() == server.protocol
        }) {
            debug!("Applying server {} to channel [{}]", server, channel.id());
            channel.set_server(server.clone());
        }
    }

    /// Rotate away from a failed server
    pub async fn server_failed(self: &Arc<Self>, server: ServerDescriptor) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        let key = (server.role, server.protocol);

        let next = {
            let mut servers = self.servers.write().await;
            let Some(list) = servers.get_mut(&key) else {
                warn!("No {:?} server list for failed server {}", server.role, server);
                return;
            };
            if !list.current().is_some_and(|c| c.same_endpoint(&server)) {
                debug!("Server {} is no longer current, ignoring failure", server);
                return;
            }
            list.current += 1;
            list.current().cloned()
        };

        if let Some(next) = next {
            info!("Server {} failed, switching to {}", server, next);
            self.apply_server(next).await;
            return;
        }

        let status = match server.role {
            ServerRole::Operations => FailoverStatus::OperationsServersNa,
            ServerRole::Bootstrap => FailoverStatus::BootstrapServersNa,
        };
        warn!("All {:?} servers failed", server.role);
        match self.failover.on_failover(status) {
            FailoverDecision::Noop => {
                warn!("No operation is performed according to failover strategy decision");
            }
            FailoverDecision::Retry { delay } => {
                warn!(
                    "Servers will be retried from the start in {:?} according to failover strategy decision",
                    delay
                );
                let manager = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    manager.restart_list(key).await;
                });
            }
            FailoverDecision::Stop => {
                error!("Stopping application according to failover strategy decision!");
                let fatal = FatalError {
                    channel_id: MANAGER_ID.to_string(),
                    status,
                };
                if self.fatal.send(fatal).is_err() {
                    error!("No supervisor to report STOP to");
                }
            }
        }
    }

    async fn restart_list(&self, key: (ServerRole, TransportProtocolId)) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        let first = {
            let mut servers = self.servers.write().await;
            servers.get_mut(&key).and_then(|list| {
                list.current = 0;
                list.current().cloned()
            })
        };
        if let Some(server) = first {
            info!("Retrying servers from {}", server);
            self.apply_server(server).await;
        }
    }

    /// Consume rotation signals until the sender side is gone
    pub fn attach_failover_signals(
        self: &Arc<Self>,
        mut signals: mpsc::UnboundedReceiver<ServerFailed>,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(ServerFailed { server }) = signals.recv().await {
                manager.server_failed(server).await;
            }
            debug!("Failover signal stream closed");
        })
    }
}
