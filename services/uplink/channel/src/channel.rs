//! Operation channel: one persistent, encrypted, multiplexed connection.
//!
//! Every public call on [`OperationChannel`] only enqueues a command. A
//! single task per channel owns the state, the connection, the crypto
//! session and the scheduled tasks, and processes commands and inbound
//! events strictly in order. Per live connection the task spawns one
//! reader and one keep-alive ticker; reconnects are one-shot timers. All of
//! them carry a cancellation token that every teardown fires, and report
//! back tagged with the connection or timer id so late events from an older
//! connection are recognised and dropped.

use bytes::{Bytes, BytesMut};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uplink_wire::{DisconnectReason, Frame, FrameDecoder, SyncBody, DEFAULT_MAX_FRAME_SIZE};

use crate::boundary::{ConnectivityChecker, Demultiplexer, IdentityStore, Multiplexer};
use crate::crypto::CryptoSession;
use crate::error::ChannelError;
use crate::failover::{FailoverDecision, FailoverManager, FailoverStatus};
use crate::handshake::{build_connect, write_frame};
use crate::keepalive::{ping_interval, spawn_keepalive, KeepaliveState};
use crate::manager::DataChannel;
use crate::state::{partial_directions, transition, ChannelState, Effect, Input, Transition};
use crate::transport::connect_tcp;
use crate::types::{
    Direction, DirectionMap, ServerDescriptor, ServerRole, TransportProtocolId, TransportType,
};

/// Identifier of the default operations channel
pub const CHANNEL_ID: &str = "default_operation_tcp_channel";

/// Keep-alive negotiated in CONNECT, in seconds
pub const DEFAULT_KEEP_ALIVE: u16 = 200;

/// Configuration for an operation channel
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Channel identifier used in logs and by the channel manager
    pub id: String,
    /// Keep-alive interval sent in CONNECT; pings go out at half of it
    pub keep_alive: u16,
    /// Limit for establishing the TCP connection
    pub connect_timeout: Duration,
    /// Size of the socket read buffer
    pub read_buffer_size: usize,
    /// Largest frame body accepted from the server
    pub max_frame_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            id: CHANNEL_ID.to_string(),
            keep_alive: DEFAULT_KEEP_ALIVE,
            connect_timeout: Duration::from_secs(10),
            read_buffer_size: 1024,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Statistics for a channel
#[derive(Clone, Debug, Default)]
pub struct ChannelStats {
    /// Total bytes received
    pub bytes_in: u64,
    /// Total bytes sent
    pub bytes_out: u64,
    /// Number of frames received
    pub frames_received: u64,
    /// Number of frames sent
    pub frames_sent: u64,
    /// Timestamp of last received frame
    pub last_frame_in: Option<Instant>,
    /// Timestamp of last sent frame
    pub last_frame_out: Option<Instant>,
    /// Most recent keep-alive round trip
    pub last_rtt: Option<Duration>,
    /// Connections established
    pub connections: u64,
}

/// Snapshot published after every processed command
#[derive(Clone, Debug)]
pub struct ChannelStatus {
    /// Current state
    pub state: ChannelState,
    /// Current destination
    pub server: Option<ServerDescriptor>,
    /// Counters
    pub stats: ChannelStats,
}

/// A STOP decision, to be handled by whoever owns the process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalError {
    /// Channel that received the decision
    pub channel_id: String,
    /// Condition the decision was made for
    pub status: FailoverStatus,
}

/// Collaborators fixed for the lifetime of a channel
#[derive(Clone)]
pub struct ChannelContext {
    /// Device identity
    pub identity: Arc<dyn IdentityStore>,
    /// Failover policy shared by all channels
    pub failover: Arc<dyn FailoverManager>,
    /// Where STOP decisions are reported
    pub fatal: mpsc::UnboundedSender<FatalError>,
}

/// Transports the operations channel carries, all bidirectional
pub fn default_supported_types() -> DirectionMap {
    [
        TransportType::Profile,
        TransportType::Configuration,
        TransportType::Notification,
        TransportType::User,
        TransportType::Event,
        TransportType::Logging,
    ]
    .into_iter()
    .map(|typ| (typ, Direction::Bidirectional))
    .collect()
}

enum Command {
    SetServer(ServerDescriptor),
    SetMultiplexer(Arc<dyn Multiplexer>),
    SetDemultiplexer(Arc<dyn Demultiplexer>),
    SetConnectivityChecker(Arc<dyn ConnectivityChecker>),
    Sync(BTreeSet<TransportType>),
    SyncAll,
    SyncAck(BTreeSet<TransportType>),
    Pause,
    Resume,
    Shutdown,
    Open { timer: u64 },
    Connected {
        attempt: u64,
        result: Result<TcpStream, ChannelError>,
    },
    Inbound {
        conn: u64,
        frames: Vec<Frame>,
        bytes: usize,
    },
    ReadFailed { conn: u64, error: ChannelError },
    KeepaliveTick { conn: u64 },
}

/// Handle to an operation channel task
#[derive(Clone)]
pub struct OperationChannel {
    id: String,
    supported: Arc<DirectionMap>,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ChannelStatus>,
}

impl OperationChannel {
    /// Spawn the channel task; must be called inside a Tokio runtime
    pub fn spawn(config: ChannelConfig, context: ChannelContext) -> Self {
        Self::spawn_with_types(config, context, default_supported_types())
    }

    /// Spawn a channel carrying a custom set of transports
    pub fn spawn_with_types(
        config: ChannelConfig,
        context: ChannelContext,
        supported: DirectionMap,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(ChannelStatus {
            state: ChannelState::Closed,
            server: None,
            stats: ChannelStats::default(),
        });
        let supported = Arc::new(supported);

        let task = ChannelTask {
            id: config.id.clone(),
            config: config.clone(),
            context,
            supported: supported.clone(),
            commands: commands.downgrade(),
            status: status_tx,
            state: ChannelState::Closed,
            server: None,
            crypto: None,
            multiplexer: None,
            demultiplexer: None,
            connectivity: None,
            conn: None,
            connecting: None,
            reconnect: None,
            next_id: 0,
            keepalive: KeepaliveState::default(),
            stats: ChannelStats::default(),
        };
        tokio::spawn(task.run(rx));

        Self {
            id: config.id,
            supported,
            commands,
            status,
        }
    }

    /// Latest published status
    pub fn status(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }

    /// Current state
    pub fn state(&self) -> ChannelState {
        self.status.borrow().state
    }

    /// Watch status changes
    pub fn subscribe(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }

    /// Bind the multiplexer used to compile requests
    pub fn set_multiplexer(&self, multiplexer: Arc<dyn Multiplexer>) {
        self.send(Command::SetMultiplexer(multiplexer));
    }

    /// Bind the demultiplexer fed with responses
    pub fn set_demultiplexer(&self, demultiplexer: Arc<dyn Demultiplexer>) {
        self.send(Command::SetDemultiplexer(demultiplexer));
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Channel [{}] is down, dropping command", self.id);
        }
    }
}

impl DataChannel for OperationChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn server_role(&self) -> ServerRole {
        ServerRole::Operations
    }

    fn transport_protocol(&self) -> TransportProtocolId {
        TransportProtocolId::TCP
    }

    fn supported_types(&self) -> &DirectionMap {
        &self.supported
    }

    fn set_server(&self, server: ServerDescriptor) {
        self.send(Command::SetServer(server));
    }

    fn server(&self) -> Option<ServerDescriptor> {
        self.status.borrow().server.clone()
    }

    fn set_connectivity_checker(&self, checker: Arc<dyn ConnectivityChecker>) {
        self.send(Command::SetConnectivityChecker(checker));
    }

    fn sync(&self, types: &[TransportType]) {
        self.send(Command::Sync(types.iter().copied().collect()));
    }

    fn sync_all(&self) {
        self.send(Command::SyncAll);
    }

    fn sync_ack(&self, types: &[TransportType]) {
        self.send(Command::SyncAck(types.iter().copied().collect()));
    }

    fn pause(&self) {
        self.send(Command::Pause);
    }

    fn resume(&self) {
        self.send(Command::Resume);
    }

    fn shutdown(&self) {
        self.send(Command::Shutdown);
    }
}

struct Connection {
    id: u64,
    writer: OwnedWriteHalf,
    cancel: CancellationToken,
}

struct ScheduledOpen {
    id: u64,
    cancel: CancellationToken,
}

struct ChannelTask {
    id: String,
    config: ChannelConfig,
    context: ChannelContext,
    supported: Arc<DirectionMap>,
    commands: mpsc::WeakUnboundedSender<Command>,
    status: watch::Sender<ChannelStatus>,
    state: ChannelState,
    server: Option<ServerDescriptor>,
    crypto: Option<CryptoSession>,
    multiplexer: Option<Arc<dyn Multiplexer>>,
    demultiplexer: Option<Arc<dyn Demultiplexer>>,
    connectivity: Option<Arc<dyn ConnectivityChecker>>,
    conn: Option<Connection>,
    /// Connect attempt in flight
    connecting: Option<u64>,
    reconnect: Option<ScheduledOpen>,
    next_id: u64,
    keepalive: KeepaliveState,
    stats: ChannelStats,
}

impl ChannelTask {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        debug!("Channel [{}] task started", self.id);
        while let Some(command) = rx.recv().await {
            self.handle(command).await;
            self.publish();
            if self.state == ChannelState::Shutdown {
                break;
            }
        }
        self.teardown().await;
        info!("Channel [{}] task ended. Stats: {:?}", self.id, self.stats);
    }

    fn publish(&self) {
        self.status.send_replace(ChannelStatus {
            state: self.state,
            server: self.server.clone(),
            stats: self.stats.clone(),
        });
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::SetServer(server) => self.set_server(server).await,
            Command::SetMultiplexer(multiplexer) => self.multiplexer = Some(multiplexer),
            Command::SetDemultiplexer(demultiplexer) => self.demultiplexer = Some(demultiplexer),
            Command::SetConnectivityChecker(checker) => self.connectivity = Some(checker),
            Command::Sync(types) => self.sync(types).await,
            Command::SyncAll => self.sync_all().await,
            Command::SyncAck(types) => {
                info!(
                    "Channel [{}]: sync acknowledgement for {:?}",
                    self.id, types
                );
                self.apply(transition(self.state, Input::SyncAck(types))).await;
            }
            Command::Pause => self.pause().await,
            Command::Resume => self.resume(),
            Command::Shutdown => {
                if self.state != ChannelState::Shutdown {
                    info!("Channel [{}]: shutting down", self.id);
                    self.state = ChannelState::Shutdown;
                    self.teardown().await;
                }
            }
            Command::Open { timer } => {
                if self.reconnect.as_ref().map(|s| s.id) != Some(timer) {
                    debug!("Channel [{}]: stale open timer {}", self.id, timer);
                    return;
                }
                self.reconnect = None;
                self.open();
            }
            Command::Connected { attempt, result } => self.on_connected(attempt, result).await,
            Command::Inbound {
                conn,
                frames,
                bytes,
            } => {
                if !self.is_current(conn) {
                    debug!("Channel [{}]: dropping frames from stale connection {}", self.id, conn);
                    return;
                }
                self.stats.bytes_in += bytes as u64;
                for frame in frames {
                    // A frame may have torn the connection down
                    if !self.is_current(conn) {
                        break;
                    }
                    self.on_frame(frame).await;
                }
            }
            Command::ReadFailed { conn, error } => {
                if !self.is_current(conn) {
                    debug!("Stale connection {} is detected, ignoring: {}", conn, error);
                    return;
                }
                warn!("Channel [{}]: read failed: {}", self.id, error);
                self.apply(transition(self.state, Input::ConnectionLost)).await;
            }
            Command::KeepaliveTick { conn } => {
                if !self.is_current(conn) {
                    return;
                }
                debug!("Channel [{}]: sending PINGREQ", self.id);
                match self.send_frame(&Frame::PingReq).await {
                    Ok(()) => self.keepalive.record_ping(),
                    Err(e) => {
                        error!("Failed to send ping request for channel [{}]: {}", self.id, e);
                        self.apply(transition(self.state, Input::ConnectionLost)).await;
                    }
                }
            }
        }
    }

    fn is_current(&self, conn: u64) -> bool {
        self.conn.as_ref().map(|c| c.id) == Some(conn)
    }

    fn open_pending(&self) -> bool {
        self.conn.is_some() || self.connecting.is_some() || self.reconnect.is_some()
    }

    async fn set_server(&mut self, server: ServerDescriptor) {
        if self.state == ChannelState::Shutdown {
            info!("Can't set server. Channel [{}] is down", self.id);
            return;
        }
        info!("Setting server [{}] for channel [{}]", server, self.id);

        let endpoint_changed = match &self.server {
            Some(old) => !old.same_endpoint(&server),
            None => true,
        };

        if !endpoint_changed && self.open_pending() {
            debug!(
                "Channel [{}]: server {} unchanged and connection in progress",
                self.id, server
            );
            // The live session keeps its crypto; a new key applies on the next connect
            self.server = Some(server);
            return;
        }

        self.crypto = self.build_crypto(&server);
        self.server = Some(server);

        if self.state == ChannelState::Paused {
            info!("Can't start new session. Channel [{}] is paused", self.id);
            return;
        }

        info!(
            "Channel [{}]: destination changed or not connected, reconnecting",
            self.id
        );
        self.teardown().await;
        self.schedule_open(Duration::ZERO);
    }

    fn build_crypto(&self, server: &ServerDescriptor) -> Option<CryptoSession> {
        let identity = &self.context.identity;
        match CryptoSession::for_destination(
            &server.public_key,
            &identity.private_key(),
            &identity.public_key(),
        ) {
            Ok(crypto) => Some(crypto),
            Err(e) => {
                error!(
                    "Channel [{}]: can't build crypto session for {}: {}",
                    self.id, server, e
                );
                None
            }
        }
    }

    async fn pause(&mut self) {
        if matches!(self.state, ChannelState::Paused | ChannelState::Shutdown) {
            return;
        }
        info!("Channel [{}]: pausing", self.id);
        self.state = ChannelState::Paused;
        self.teardown().await;
    }

    fn resume(&mut self) {
        if self.state != ChannelState::Paused {
            return;
        }
        info!("Channel [{}]: resuming", self.id);
        self.state = ChannelState::Closed;
        self.schedule_open(Duration::ZERO);
    }

    fn schedule_open(&mut self, delay: Duration) {
        if self.reconnect.is_some() || self.connecting.is_some() {
            info!(
                "Channel [{}]: reconnect is already scheduled, ignoring the call",
                self.id
            );
            return;
        }
        let Some(commands) = self.commands.upgrade() else {
            return;
        };

        let id = self.next_id();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        info!(
            "Channel [{}]: scheduling open connection task in {:?}",
            self.id, delay
        );
        tokio::spawn(async move {
            tokio::select! {
                biased;

                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = commands.send(Command::Open { timer: id });
                }
            }
        });
        self.reconnect = Some(ScheduledOpen { id, cancel });
    }

    fn open(&mut self) {
        if matches!(self.state, ChannelState::Paused | ChannelState::Shutdown) {
            info!(
                "Can't open connection, as channel [{}] is in the {:?} state",
                self.id, self.state
            );
            return;
        }
        if self.conn.is_some() || self.connecting.is_some() {
            debug!("Channel [{}]: connection already in progress", self.id);
            return;
        }
        let Some(server) = self.server.clone() else {
            warn!("Channel [{}]: can't open connection, server is not set", self.id);
            return;
        };
        let Some(commands) = self.commands.upgrade() else {
            return;
        };

        let attempt = self.next_id();
        self.connecting = Some(attempt);
        let timeout = self.config.connect_timeout;
        info!("Channel [{}]: opening connection to server {}", self.id, server);

        tokio::spawn(async move {
            let result = connect_tcp(&server.address(), timeout).await;
            let _ = commands.send(Command::Connected { attempt, result });
        });
    }

    async fn on_connected(&mut self, attempt: u64, result: Result<TcpStream, ChannelError>) {
        if self.connecting != Some(attempt) {
            debug!("Channel [{}]: dropping stale connect attempt {}", self.id, attempt);
            return;
        }
        self.connecting = None;

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                error!("Channel [{}]: failed to connect: {}", self.id, e);
                self.server_failed().await;
                return;
            }
        };

        if let Err(e) = self.establish(stream).await {
            error!("Channel [{}]: failed to start session: {}", self.id, e);
            self.server_failed().await;
        }
    }

    async fn establish(&mut self, stream: TcpStream) -> Result<(), ChannelError> {
        let server = self.server.clone().ok_or(ChannelError::NotBound("server"))?;
        let multiplexer = self
            .multiplexer
            .clone()
            .ok_or(ChannelError::NotBound("multiplexer"))?;

        // Fresh session key for every connection
        self.crypto = self.build_crypto(&server);
        let crypto = self.crypto.as_ref().ok_or(ChannelError::NotBound("crypto session"))?;
        let connect = build_connect(
            self.config.keep_alive,
            crypto,
            multiplexer.as_ref(),
            &self.supported,
        )?;

        let (reader, writer) = stream.into_split();
        let conn_id = self.next_id();
        let cancel = CancellationToken::new();
        self.conn = Some(Connection {
            id: conn_id,
            writer,
            cancel: cancel.clone(),
        });
        self.send_frame(&connect).await?;

        let commands = self
            .commands
            .upgrade()
            .ok_or(ChannelError::NotConnected)?;
        tokio::spawn(read_task(
            self.id.clone(),
            conn_id,
            reader,
            FrameDecoder::with_max_frame_size(self.config.max_frame_size),
            self.config.read_buffer_size,
            cancel.clone(),
            commands.clone(),
        ));
        let interval = ping_interval(self.config.keep_alive);
        debug!(
            "Channel [{}]: scheduling ping task every {:?}",
            self.id, interval
        );
        spawn_keepalive(
            interval,
            cancel,
            commands,
            move || Command::KeepaliveTick { conn: conn_id },
        );

        self.state = ChannelState::Connecting;
        self.stats.connections += 1;
        info!(
            "Channel [{}]: CONNECT sent to {}, waiting for CONNACK",
            self.id, server
        );
        Ok(())
    }

    async fn on_frame(&mut self, frame: Frame) {
        self.stats.frames_received += 1;
        self.stats.last_frame_in = Some(Instant::now());

        let input = match frame {
            Frame::ConnAck(code) => {
                info!("ConnAck ({:?}) message received for channel [{}]", code, self.id);
                Input::ConnAck(code)
            }
            Frame::SyncResponse(body) => {
                info!(
                    "Sync response (zipped={}, encrypted={}) received for channel [{}]",
                    body.is_zipped(),
                    body.is_encrypted(),
                    self.id
                );
                match self.open_payload(body) {
                    Some(payload) => Input::Response(payload),
                    None => return,
                }
            }
            Frame::PingResp => Input::PingResp,
            Frame::Disconnect(reason) => {
                info!(
                    "Disconnect message (reason={:?}) received for channel [{}]",
                    reason, self.id
                );
                Input::Disconnect(reason)
            }
            other => {
                warn!(
                    "Channel [{}]: ignoring unexpected {} frame",
                    self.id,
                    other.name()
                );
                return;
            }
        };

        self.apply(transition(self.state, input)).await;
    }

    /// Decrypt a flagged payload; failures drop the message only
    fn open_payload(&self, body: SyncBody) -> Option<Bytes> {
        if !body.is_encrypted() {
            return Some(body.payload);
        }
        let Some(crypto) = &self.crypto else {
            error!("Channel [{}]: encrypted payload without crypto session", self.id);
            return None;
        };
        match crypto.decrypt(&body.payload) {
            Ok(plain) => Some(Bytes::from(plain)),
            Err(e) => {
                error!(
                    "Failed to decrypt message body for channel [{}]: {}",
                    self.id, e
                );
                None
            }
        }
    }

    async fn apply(&mut self, transition: Transition) {
        if transition.state != self.state {
            debug!(
                "Channel [{}]: {:?} -> {:?}",
                self.id, self.state, transition.state
            );
        }
        self.state = transition.state;

        for effect in transition.effects {
            match effect {
                Effect::Deliver(payload) => self.deliver(&payload),
                Effect::NotifyConnected => {
                    if let Some(server) = &self.server {
                        info!("Channel [{}]: session with {} established", self.id, server);
                        self.context.failover.on_server_connected(server);
                    }
                }
                Effect::SyncAll => self.sync_all().await,
                Effect::Sync(types) => self.sync(types).await,
                Effect::RecordPong => {
                    let rtt = self.keepalive.process_pong();
                    self.stats.last_rtt = self.keepalive.last_rtt();
                    info!(
                        "PingResponse message received for channel [{}] (rtt: {:?})",
                        self.id, rtt
                    );
                }
                Effect::CleanIdentity => {
                    info!("Channel [{}]: cleaning client state", self.id);
                    self.context.identity.clean();
                }
                Effect::Close => self.teardown().await,
                Effect::ServerFailed => self.server_failed().await,
            }
        }
    }

    fn deliver(&self, payload: &[u8]) {
        let Some(demultiplexer) = &self.demultiplexer else {
            warn!("Channel [{}]: demultiplexer is not set, dropping response", self.id);
            return;
        };
        demultiplexer.pre_process();
        if let Err(e) = demultiplexer.process_response(payload) {
            error!("Failed to process response for channel [{}]: {:#}", self.id, e);
        }
        demultiplexer.post_process();
    }

    fn can_sync(&self) -> bool {
        match self.state {
            ChannelState::Shutdown => {
                info!("Can't sync. Channel [{}] is down", self.id);
                false
            }
            ChannelState::Paused => {
                info!("Can't sync. Channel [{}] is paused", self.id);
                false
            }
            ChannelState::Opened => {
                if self.multiplexer.is_none() {
                    warn!("Can't sync. Channel [{}] multiplexer is not set", self.id);
                    false
                } else if self.demultiplexer.is_none() {
                    warn!("Can't sync. Channel [{}] demultiplexer is not set", self.id);
                    false
                } else if self.server.is_none() || self.conn.is_none() {
                    warn!("Can't sync. Channel [{}] has no live connection", self.id);
                    false
                } else {
                    true
                }
            }
            _ => {
                info!(
                    "Can't sync. Channel [{}] is waiting for CONNACK + sync response",
                    self.id
                );
                false
            }
        }
    }

    async fn sync(&mut self, types: BTreeSet<TransportType>) {
        if !self.can_sync() {
            return;
        }
        info!("Processing sync {:?} for channel [{}]", types, self.id);
        let (directions, unsupported) = partial_directions(&self.supported, &types);
        for typ in unsupported {
            error!("Unsupported type {:?} for channel [{}]", typ, self.id);
        }
        self.send_sync(directions).await;
    }

    async fn sync_all(&mut self) {
        if !self.can_sync() {
            return;
        }
        info!("Processing sync all for channel [{}]", self.id);
        let directions = self.supported.as_ref().clone();
        self.send_sync(directions).await;
    }

    async fn send_sync(&mut self, directions: DirectionMap) {
        let body = match self.build_sync(&directions) {
            Ok(body) => body,
            Err(e) => {
                error!("Failed to sync channel [{}]: {}", self.id, e);
                return;
            }
        };

        if let Err(e) = self.send_frame(&Frame::SyncRequest(body)).await {
            error!("Failed to send sync request for channel [{}]: {}", self.id, e);
            self.server_failed().await;
        }
    }

    fn build_sync(&self, directions: &DirectionMap) -> Result<SyncBody, ChannelError> {
        let multiplexer = self
            .multiplexer
            .as_ref()
            .ok_or(ChannelError::NotBound("multiplexer"))?;
        let crypto = self
            .crypto
            .as_ref()
            .ok_or(ChannelError::NotBound("crypto session"))?;
        let body = multiplexer
            .compile_request(directions)
            .map_err(ChannelError::Multiplexer)?;
        Ok(SyncBody::encrypted(Bytes::from(crypto.encrypt(&body)?)))
    }

    async fn send_frame(&mut self, frame: &Frame) -> Result<(), ChannelError> {
        let conn = self.conn.as_mut().ok_or(ChannelError::NotConnected)?;
        let written = write_frame(&mut conn.writer, frame).await?;
        self.stats.frames_sent += 1;
        self.stats.bytes_out += written as u64;
        self.stats.last_frame_out = Some(Instant::now());
        Ok(())
    }

    async fn server_failed(&mut self) {
        info!("Channel [{}] has failed", self.id);
        let server = self.server.clone();
        self.teardown().await;

        if let Some(checker) = &self.connectivity {
            if !checker.check_connectivity() {
                warn!("Channel [{}]: loss of connectivity detected", self.id);
                match self.context.failover.on_failover(FailoverStatus::NoConnectivity) {
                    FailoverDecision::Noop => {
                        warn!("No operation is performed according to failover strategy decision");
                    }
                    FailoverDecision::Retry { delay } => {
                        warn!(
                            "Attempt to reconnect will be made in {:?} according to failover strategy decision",
                            delay
                        );
                        self.schedule_open(delay);
                    }
                    FailoverDecision::Stop => {
                        error!("Stopping application according to failover strategy decision!");
                        let fatal = FatalError {
                            channel_id: self.id.clone(),
                            status: FailoverStatus::NoConnectivity,
                        };
                        if self.context.fatal.send(fatal).is_err() {
                            error!("Channel [{}]: no supervisor to report STOP to", self.id);
                        }
                    }
                }
                return;
            }
        }

        if let Some(server) = server {
            self.context.failover.on_server_failed(&server);
        }
    }

    /// Cancel scheduled work and close the live connection, if any
    async fn teardown(&mut self) {
        if let Some(scheduled) = self.reconnect.take() {
            scheduled.cancel.cancel();
        }
        self.connecting = None;
        self.keepalive.reset();

        if let Some(mut conn) = self.conn.take() {
            conn.cancel.cancel();
            info!("Channel [{}]: closing current connection", self.id);

            let disconnect = Frame::Disconnect(DisconnectReason::None);
            match tokio::time::timeout(
                Duration::from_secs(1),
                write_frame(&mut conn.writer, &disconnect),
            )
            .await
            {
                Ok(Ok(_)) => self.stats.frames_sent += 1,
                Ok(Err(e)) => debug!("Failed to send Disconnect to server: {}", e),
                Err(_) => debug!("Timed out sending Disconnect to server"),
            }
            if let Err(e) = conn.writer.shutdown().await {
                debug!("Failed to close socket: {}", e);
            }
        }

        if matches!(self.state, ChannelState::Connecting | ChannelState::Opened) {
            self.state = ChannelState::Closed;
        }
    }
}

async fn read_task(
    channel_id: String,
    conn: u64,
    mut reader: OwnedReadHalf,
    mut decoder: FrameDecoder,
    buffer_size: usize,
    cancel: CancellationToken,
    commands: mpsc::UnboundedSender<Command>,
) {
    let mut buffer = BytesMut::with_capacity(buffer_size);
    debug!(
        "Channel [{}] is reading data from stream using [{}] byte buffer",
        channel_id, buffer_size
    );

    loop {
        buffer.clear();
        let result = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            result = reader.read_buf(&mut buffer) => result,
        };

        let event = match result {
            Ok(0) => {
                info!("Channel [{}] received end of stream", channel_id);
                Command::ReadFailed {
                    conn,
                    error: ChannelError::EndOfStream,
                }
            }
            Ok(bytes) => match decoder.feed(&buffer) {
                Ok(frames) => {
                    if commands
                        .send(Command::Inbound {
                            conn,
                            frames,
                            bytes,
                        })
                        .is_err()
                    {
                        break;
                    }
                    continue;
                }
                Err(e) => Command::ReadFailed {
                    conn,
                    error: e.into(),
                },
            },
            Err(e) => Command::ReadFailed {
                conn,
                error: e.into(),
            },
        };

        let _ = commands.send(event);
        break;
    }

    debug!("Read task is finished for channel [{}]", channel_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PeerCrypto;
    use crate::handshake::recv_any_frame;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use uplink_wire::ReturnCode;
    use x25519_dalek::{PublicKey, StaticSecret};

    const WAIT: Duration = Duration::from_secs(5);
    const DEVICE_SEED: [u8; 32] = [7u8; 32];

    type EventLog = Arc<Mutex<Vec<String>>>;

    struct TestIdentity {
        log: EventLog,
        cleaned: AtomicUsize,
    }

    impl IdentityStore for TestIdentity {
        fn private_key(&self) -> [u8; 32] {
            DEVICE_SEED
        }

        fn public_key(&self) -> [u8; 32] {
            device_public()
        }

        fn clean(&self) {
            self.cleaned.fetch_add(1, Ordering::SeqCst);
            self.log.lock().unwrap().push("clean".to_string());
        }
    }

    #[derive(Debug)]
    struct TestFailover {
        log: EventLog,
        decision: Mutex<FailoverDecision>,
    }

    impl FailoverManager for TestFailover {
        fn on_server_failed(&self, server: &ServerDescriptor) {
            self.log
                .lock()
                .unwrap()
                .push(format!("failed:{}", server.port));
        }

        fn on_server_connected(&self, server: &ServerDescriptor) {
            self.log
                .lock()
                .unwrap()
                .push(format!("connected:{}", server.port));
        }

        fn on_failover(&self, status: FailoverStatus) -> FailoverDecision {
            self.log.lock().unwrap().push(format!("failover:{:?}", status));
            *self.decision.lock().unwrap()
        }
    }

    #[derive(Default)]
    struct RecordingMultiplexer {
        requests: Mutex<Vec<DirectionMap>>,
    }

    impl Multiplexer for RecordingMultiplexer {
        fn compile_request(&self, types: &DirectionMap) -> anyhow::Result<Vec<u8>> {
            let mut requests = self.requests.lock().unwrap();
            requests.push(types.clone());
            Ok(format!("request-{}", requests.len()).into_bytes())
        }
    }

    #[derive(Default)]
    struct RecordingDemultiplexer {
        responses: Mutex<Vec<Vec<u8>>>,
    }

    impl Demultiplexer for RecordingDemultiplexer {
        fn process_response(&self, response: &[u8]) -> anyhow::Result<()> {
            self.responses.lock().unwrap().push(response.to_vec());
            Ok(())
        }
    }

    struct Reachability(AtomicBool);

    impl ConnectivityChecker for Reachability {
        fn check_connectivity(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn device_public() -> [u8; 32] {
        SigningKey::from_bytes(&DEVICE_SEED)
            .verifying_key()
            .to_bytes()
    }

    struct Harness {
        channel: OperationChannel,
        log: EventLog,
        identity: Arc<TestIdentity>,
        failover: Arc<TestFailover>,
        multiplexer: Arc<RecordingMultiplexer>,
        demultiplexer: Arc<RecordingDemultiplexer>,
        fatal: mpsc::UnboundedReceiver<FatalError>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(ChannelConfig {
                connect_timeout: Duration::from_secs(2),
                ..ChannelConfig::default()
            })
        }

        fn with_config(config: ChannelConfig) -> Self {
            let log: EventLog = Arc::default();
            let identity = Arc::new(TestIdentity {
                log: log.clone(),
                cleaned: AtomicUsize::new(0),
            });
            let failover = Arc::new(TestFailover {
                log: log.clone(),
                decision: Mutex::new(FailoverDecision::Noop),
            });
            let (fatal_tx, fatal) = mpsc::unbounded_channel();
            let channel = OperationChannel::spawn(
                config,
                ChannelContext {
                    identity: identity.clone(),
                    failover: failover.clone(),
                    fatal: fatal_tx,
                },
            );

            let multiplexer = Arc::new(RecordingMultiplexer::default());
            let demultiplexer = Arc::new(RecordingDemultiplexer::default());
            channel.set_multiplexer(multiplexer.clone());
            channel.set_demultiplexer(demultiplexer.clone());

            Self {
                channel,
                log,
                identity,
                failover,
                multiplexer,
                demultiplexer,
                fatal,
            }
        }

        fn events(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn count(&self, prefix: &str) -> usize {
            self.events()
                .iter()
                .filter(|e| e.starts_with(prefix))
                .count()
        }

        async fn wait_for_state(&self, expected: ChannelState) {
            let mut status = self.channel.subscribe();
            timeout(WAIT, async {
                loop {
                    if status.borrow_and_update().state == expected {
                        return;
                    }
                    if status.changed().await.is_err() {
                        assert_eq!(status.borrow().state, expected);
                        return;
                    }
                }
            })
            .await
            .unwrap_or_else(|_| panic!("channel never reached {:?}", expected));
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        timeout(WAIT, async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    /// Loopback endpoint speaking the server side of the protocol
    struct TestPeer {
        listener: TcpListener,
        secret: StaticSecret,
    }

    struct PeerConn {
        stream: TcpStream,
        decoder: FrameDecoder,
        pending: Vec<Frame>,
        crypto: PeerCrypto,
        initial_sync: Vec<u8>,
    }

    impl TestPeer {
        async fn bind() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            Self {
                listener,
                secret: StaticSecret::random_from_rng(OsRng),
            }
        }

        fn addr(&self) -> SocketAddr {
            self.listener.local_addr().unwrap()
        }

        fn server(&self) -> ServerDescriptor {
            ServerDescriptor::operations(
                "127.0.0.1",
                self.addr().port(),
                PublicKey::from(&self.secret).to_bytes().to_vec(),
            )
        }

        async fn accept(&self) -> PeerConn {
            let (mut stream, _) = timeout(WAIT, self.listener.accept())
                .await
                .expect("no connection")
                .unwrap();
            let mut decoder = FrameDecoder::new();
            let mut pending = Vec::new();
            let frame = timeout(WAIT, recv_any_frame(&mut stream, &mut decoder, &mut pending))
                .await
                .expect("no CONNECT")
                .unwrap();
            let Frame::Connect(connect) = frame else {
                panic!("expected CONNECT, got {:?}", frame);
            };
            let crypto = PeerCrypto::accept(
                &self.secret,
                &connect.session_key,
                &connect.signature,
                &device_public(),
            )
            .unwrap();
            let initial_sync = crypto.decrypt(&connect.payload).unwrap();
            PeerConn {
                stream,
                decoder,
                pending,
                crypto,
                initial_sync,
            }
        }

        async fn expect_no_connection(&self, wait: Duration) {
            assert!(
                timeout(wait, self.listener.accept()).await.is_err(),
                "unexpected connection"
            );
        }
    }

    impl PeerConn {
        async fn send(&mut self, frame: Frame) {
            write_frame(&mut self.stream, &frame).await.unwrap();
        }

        async fn respond(&mut self, payload: &[u8]) {
            let sealed = self.crypto.encrypt(payload).unwrap();
            self.send(Frame::SyncResponse(SyncBody::encrypted(Bytes::from(sealed))))
                .await;
        }

        async fn recv(&mut self) -> Result<Frame, ChannelError> {
            timeout(
                WAIT,
                recv_any_frame(&mut self.stream, &mut self.decoder, &mut self.pending),
            )
            .await
            .expect("peer timed out waiting for a frame")
        }

        async fn recv_sync(&mut self) -> Vec<u8> {
            match self.recv().await.unwrap() {
                Frame::SyncRequest(body) => {
                    assert!(body.is_encrypted());
                    self.crypto.decrypt(&body.payload).unwrap()
                }
                other => panic!("expected SYNC-REQUEST, got {:?}", other),
            }
        }
    }

    async fn open_session(harness: &Harness, peer: &TestPeer) -> PeerConn {
        harness.channel.set_server(peer.server());
        let mut conn = peer.accept().await;
        conn.send(Frame::ConnAck(ReturnCode::Accepted)).await;
        conn.respond(b"welcome").await;
        harness.wait_for_state(ChannelState::Opened).await;
        // The sync-all issued right after opening
        assert_eq!(conn.recv_sync().await, b"request-2");
        conn
    }

    #[tokio::test]
    async fn test_handshake_opens_once() {
        let harness = Harness::new();
        let peer = TestPeer::bind().await;

        let mut conn = open_session(&harness, &peer).await;
        assert_eq!(conn.initial_sync, b"request-1");

        let requests = harness.multiplexer.requests.lock().unwrap().clone();
        assert_eq!(requests, vec![default_supported_types(); 2]);
        assert_eq!(
            harness.demultiplexer.responses.lock().unwrap().clone(),
            vec![b"welcome".to_vec()]
        );

        // Later responses are only delivered
        conn.respond(b"update").await;
        let demultiplexer = harness.demultiplexer.clone();
        eventually(|| demultiplexer.responses.lock().unwrap().len() == 2).await;

        assert_eq!(harness.count("connected:"), 1);
        assert_eq!(harness.channel.state(), ChannelState::Opened);
        assert_eq!(harness.channel.status().stats.connections, 1);
    }

    #[tokio::test]
    async fn test_sync_partial_direction_map() {
        let harness = Harness::new();
        let peer = TestPeer::bind().await;
        let mut conn = open_session(&harness, &peer).await;

        harness.channel.sync(&[TransportType::Logging]);
        assert_eq!(conn.recv_sync().await, b"request-3");

        let requests = harness.multiplexer.requests.lock().unwrap().clone();
        let partial = &requests[2];
        assert_eq!(partial.len(), default_supported_types().len());
        for (typ, direction) in partial {
            if *typ == TransportType::Logging {
                assert_eq!(*direction, Direction::Bidirectional);
            } else {
                assert_eq!(*direction, Direction::Down);
            }
        }
    }

    #[tokio::test]
    async fn test_sync_ack_after_open() {
        let harness = Harness::new();
        let peer = TestPeer::bind().await;
        let mut conn = open_session(&harness, &peer).await;

        harness.channel.sync_ack(&[TransportType::Event]);
        assert_eq!(conn.recv_sync().await, b"request-3");
        harness
            .channel
            .sync_ack(&[TransportType::Event, TransportType::User]);
        assert_eq!(conn.recv_sync().await, b"request-4");

        let requests = harness.multiplexer.requests.lock().unwrap().clone();
        assert_eq!(requests[2][&TransportType::Profile], Direction::Down);
        assert_eq!(requests[3], default_supported_types());
        assert_eq!(harness.count("connected:"), 1);
    }

    #[tokio::test]
    async fn test_sync_ignored_until_opened() {
        let harness = Harness::new();
        let peer = TestPeer::bind().await;
        harness.channel.set_server(peer.server());
        let mut conn = peer.accept().await;
        conn.send(Frame::ConnAck(ReturnCode::Accepted)).await;
        harness.wait_for_state(ChannelState::Connecting).await;

        harness.channel.sync(&[TransportType::Profile]);
        harness.channel.sync_all();
        // The first sync acknowledgment completes the handshake instead
        harness.channel.sync_ack(&[TransportType::Profile]);
        harness.wait_for_state(ChannelState::Opened).await;

        assert_eq!(conn.recv_sync().await, b"request-2");
        assert_eq!(harness.multiplexer.requests.lock().unwrap().len(), 2);
        assert_eq!(harness.count("connected:"), 1);
    }

    #[tokio::test]
    async fn test_set_server_same_endpoint_is_idempotent() {
        let harness = Harness::new();
        let peer = TestPeer::bind().await;

        harness.channel.set_server(peer.server());
        harness.channel.set_server(peer.server());
        let _conn = peer.accept().await;
        harness.wait_for_state(ChannelState::Connecting).await;

        harness.channel.set_server(peer.server());
        peer.expect_no_connection(Duration::from_millis(300)).await;
        assert_eq!(harness.channel.status().stats.connections, 1);
    }

    #[tokio::test]
    async fn test_set_server_new_endpoint_reconnects() {
        let harness = Harness::new();
        let first = TestPeer::bind().await;
        let second = TestPeer::bind().await;
        let mut old = open_session(&harness, &first).await;

        harness.channel.set_server(second.server());
        assert_eq!(
            old.recv().await.unwrap(),
            Frame::Disconnect(DisconnectReason::None)
        );
        assert!(matches!(old.recv().await, Err(ChannelError::EndOfStream)));

        let mut conn = second.accept().await;
        conn.send(Frame::ConnAck(ReturnCode::Accepted)).await;
        conn.respond(b"second").await;
        harness.wait_for_state(ChannelState::Opened).await;
        assert_eq!(harness.channel.server(), Some(second.server()));
        assert_eq!(harness.count("failed:"), 0);
    }

    #[tokio::test]
    async fn test_pause_is_idempotent_and_resume_reconnects() {
        let harness = Harness::new();
        let peer = TestPeer::bind().await;
        let mut conn = open_session(&harness, &peer).await;

        harness.channel.pause();
        harness.wait_for_state(ChannelState::Paused).await;
        assert_eq!(
            conn.recv().await.unwrap(),
            Frame::Disconnect(DisconnectReason::None)
        );
        assert!(matches!(conn.recv().await, Err(ChannelError::EndOfStream)));
        let sent = harness.channel.status().stats.frames_sent;

        harness.channel.pause();
        harness.channel.sync_all();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(harness.channel.state(), ChannelState::Paused);
        assert_eq!(harness.channel.status().stats.frames_sent, sent);
        peer.expect_no_connection(Duration::from_millis(200)).await;

        harness.channel.resume();
        let mut conn = peer.accept().await;
        conn.send(Frame::ConnAck(ReturnCode::Accepted)).await;
        conn.respond(b"again").await;
        harness.wait_for_state(ChannelState::Opened).await;
        assert_eq!(harness.count("connected:"), 2);
    }

    #[tokio::test]
    async fn test_shutdown_is_terminal() {
        let harness = Harness::new();
        let peer = TestPeer::bind().await;
        let mut conn = open_session(&harness, &peer).await;

        harness.channel.shutdown();
        harness.wait_for_state(ChannelState::Shutdown).await;
        assert_eq!(
            conn.recv().await.unwrap(),
            Frame::Disconnect(DisconnectReason::None)
        );

        harness.channel.resume();
        harness.channel.pause();
        harness.channel.sync_all();
        harness.channel.set_server(peer.server());
        peer.expect_no_connection(Duration::from_millis(300)).await;
        assert_eq!(harness.channel.state(), ChannelState::Shutdown);
    }

    #[tokio::test]
    async fn test_graceful_disconnect_skips_failover() {
        let harness = Harness::new();
        let peer = TestPeer::bind().await;
        let mut conn = open_session(&harness, &peer).await;

        conn.send(Frame::Disconnect(DisconnectReason::None)).await;
        harness.wait_for_state(ChannelState::Closed).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(harness.count("failed:"), 0);
        assert_eq!(harness.count("failover:"), 0);
    }

    #[tokio::test]
    async fn test_disconnect_with_reason_fails_server_once() {
        let harness = Harness::new();
        let peer = TestPeer::bind().await;
        let mut conn = open_session(&harness, &peer).await;

        conn.send(Frame::Disconnect(DisconnectReason::InternalError))
            .await;
        let port = peer.addr().port();
        eventually(|| harness.count("failed:") == 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(harness.events().last().unwrap(), &format!("failed:{}", port));
        assert_eq!(harness.count("failed:"), 1);
        assert_eq!(harness.channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_bad_credentials_clean_identity_first() {
        let harness = Harness::new();
        let peer = TestPeer::bind().await;
        harness.channel.set_server(peer.server());
        let mut conn = peer.accept().await;

        conn.send(Frame::ConnAck(ReturnCode::RefuseBadCredentials))
            .await;
        eventually(|| harness.count("failed:") == 1).await;

        let events = harness.events();
        let clean = events.iter().position(|e| e == "clean").unwrap();
        let failed = events.iter().position(|e| e.starts_with("failed:")).unwrap();
        assert!(clean < failed);
        assert_eq!(harness.identity.cleaned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refused_connack_fails_without_clean() {
        let harness = Harness::new();
        let peer = TestPeer::bind().await;
        harness.channel.set_server(peer.server());
        let mut conn = peer.accept().await;

        conn.send(Frame::ConnAck(ReturnCode::RefuseServerUnavailable))
            .await;
        eventually(|| harness.count("failed:") == 1).await;
        assert_eq!(harness.identity.cleaned.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_decrypt_failure_drops_payload_only() {
        let harness = Harness::new();
        let peer = TestPeer::bind().await;
        harness.channel.set_server(peer.server());
        let mut conn = peer.accept().await;
        conn.send(Frame::ConnAck(ReturnCode::Accepted)).await;

        conn.send(Frame::SyncResponse(SyncBody::encrypted(Bytes::from_static(
            b"not a valid ciphertext at all",
        ))))
        .await;
        conn.send(Frame::SyncResponse(SyncBody::plain(Bytes::from_static(
            b"plain",
        ))))
        .await;
        harness.wait_for_state(ChannelState::Opened).await;

        assert_eq!(
            harness.demultiplexer.responses.lock().unwrap().clone(),
            vec![b"plain".to_vec()]
        );
        assert_eq!(harness.count("failed:"), 0);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_server_failure() {
        let harness = Harness::new();
        let peer = TestPeer::bind().await;
        harness.channel.set_server(peer.server());
        let mut conn = peer.accept().await;

        conn.stream.write_all(&[0x50, 0x00]).await.unwrap();
        eventually(|| harness.count("failed:") == 1).await;
        assert_eq!(harness.channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_connect_error_is_server_failure() {
        let harness = Harness::new();
        let peer = TestPeer::bind().await;
        let server = peer.server();
        drop(peer);

        harness.channel.set_server(server);
        eventually(|| harness.count("failed:") == 1).await;
        assert_eq!(harness.channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_no_connectivity_retries_per_decision() {
        let harness = Harness::new();
        harness.channel.set_connectivity_checker(Arc::new(Reachability(AtomicBool::new(false))));
        *harness.failover.decision.lock().unwrap() = FailoverDecision::Retry {
            delay: Duration::from_millis(50),
        };
        let peer = TestPeer::bind().await;
        harness.channel.set_server(peer.server());

        let conn = peer.accept().await;
        drop(conn);
        eventually(|| harness.count("failover:NoConnectivity") == 1).await;

        // Retry lands on the same server
        let _conn = peer.accept().await;
        assert_eq!(harness.count("failed:"), 0);
    }

    #[tokio::test]
    async fn test_stop_decision_reported_as_fatal() {
        let mut harness = Harness::new();
        harness.channel.set_connectivity_checker(Arc::new(Reachability(AtomicBool::new(false))));
        *harness.failover.decision.lock().unwrap() = FailoverDecision::Stop;
        let peer = TestPeer::bind().await;
        harness.channel.set_server(peer.server());

        let mut conn = peer.accept().await;
        conn.send(Frame::Disconnect(DisconnectReason::BadRequest)).await;

        let fatal = timeout(WAIT, harness.fatal.recv()).await.unwrap().unwrap();
        assert_eq!(
            fatal,
            FatalError {
                channel_id: CHANNEL_ID.to_string(),
                status: FailoverStatus::NoConnectivity,
            }
        );
        peer.expect_no_connection(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_unsolicited_ping_response_not_measured() {
        let harness = Harness::new();
        let peer = TestPeer::bind().await;
        let mut conn = open_session(&harness, &peer).await;

        conn.send(Frame::PingResp).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(harness.channel.status().stats.last_rtt.is_none());
        assert_eq!(harness.channel.state(), ChannelState::Opened);
    }

    fn fast_keepalive() -> ChannelConfig {
        ChannelConfig {
            keep_alive: 1,
            connect_timeout: Duration::from_secs(2),
            ..ChannelConfig::default()
        }
    }

    #[tokio::test]
    async fn test_keepalive_ping_records_rtt() {
        let harness = Harness::with_config(fast_keepalive());
        let peer = TestPeer::bind().await;
        let mut conn = open_session(&harness, &peer).await;

        // Half of the one second keep-alive
        assert_eq!(conn.recv().await.unwrap(), Frame::PingReq);
        conn.send(Frame::PingResp).await;

        let channel = harness.channel.clone();
        eventually(|| channel.status().stats.last_rtt.is_some()).await;
        assert_eq!(harness.channel.state(), ChannelState::Opened);

        // Pings keep coming while the session lives
        assert_eq!(conn.recv().await.unwrap(), Frame::PingReq);
    }

    #[tokio::test]
    async fn test_connection_lost_under_keepalive_fails_server_once() {
        let harness = Harness::with_config(fast_keepalive());
        let peer = TestPeer::bind().await;
        let mut conn = open_session(&harness, &peer).await;

        assert_eq!(conn.recv().await.unwrap(), Frame::PingReq);
        drop(conn);
        eventually(|| harness.count("failed:") == 1).await;

        // Later ticks of the dead connection are dropped
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(harness.count("failed:"), 1);
        assert_eq!(harness.channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_noop_decision_leaves_channel_closed() {
        let mut harness = Harness::new();
        harness.channel.set_connectivity_checker(Arc::new(Reachability(AtomicBool::new(false))));
        let peer = TestPeer::bind().await;
        harness.channel.set_server(peer.server());

        let conn = peer.accept().await;
        drop(conn);
        eventually(|| harness.count("failover:NoConnectivity") == 1).await;

        peer.expect_no_connection(Duration::from_millis(300)).await;
        assert_eq!(harness.channel.state(), ChannelState::Closed);
        assert_eq!(harness.count("failed:"), 0);
        assert!(harness.fatal.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_resume_outside_pause_is_ignored() {
        let harness = Harness::new();
        let peer = TestPeer::bind().await;
        let mut conn = open_session(&harness, &peer).await;

        harness.channel.resume();
        peer.expect_no_connection(Duration::from_millis(300)).await;
        assert_eq!(harness.channel.state(), ChannelState::Opened);
        assert_eq!(harness.channel.status().stats.connections, 1);

        harness.channel.sync_all();
        assert_eq!(conn.recv_sync().await, b"request-3");
    }

    #[tokio::test]
    async fn test_set_server_new_key_keeps_live_session() {
        let harness = Harness::new();
        let peer = TestPeer::bind().await;
        let mut conn = open_session(&harness, &peer).await;

        let mut rekeyed = peer.server();
        rekeyed.public_key = vec![9u8; 32];
        harness.channel.set_server(rekeyed.clone());
        peer.expect_no_connection(Duration::from_millis(300)).await;

        assert_eq!(harness.channel.server(), Some(rekeyed));
        assert_eq!(harness.channel.state(), ChannelState::Opened);
        assert_eq!(harness.channel.status().stats.connections, 1);

        // The session still speaks the original key
        harness.channel.sync_all();
        assert_eq!(conn.recv_sync().await, b"request-3");
    }

    #[tokio::test]
    async fn test_single_server_retried_after_list_exhausted() {
        use crate::failover::{DefaultFailoverManager, FailoverPolicy};
        use crate::manager::ChannelManager;

        let (failover, signals) = DefaultFailoverManager::new(FailoverPolicy {
            retry_delay: Duration::from_millis(50),
            backoff_multiplier: 1,
            ..FailoverPolicy::default()
        });
        let failover = Arc::new(failover);
        let (fatal_tx, mut fatal) = mpsc::unbounded_channel();
        let manager = ChannelManager::new(failover.clone(), fatal_tx.clone());
        manager.attach_failover_signals(signals);

        let identity = Arc::new(TestIdentity {
            log: Arc::default(),
            cleaned: AtomicUsize::new(0),
        });
        let channel = OperationChannel::spawn(
            ChannelConfig {
                connect_timeout: Duration::from_secs(2),
                ..ChannelConfig::default()
            },
            ChannelContext {
                identity,
                failover,
                fatal: fatal_tx,
            },
        );
        channel.set_multiplexer(Arc::new(RecordingMultiplexer::default()));
        channel.set_demultiplexer(Arc::new(RecordingDemultiplexer::default()));
        manager.add_channel(Arc::new(channel.clone())).await;

        let peer = TestPeer::bind().await;
        manager
            .set_servers(
                ServerRole::Operations,
                TransportProtocolId::TCP,
                vec![peer.server()],
            )
            .await;

        // Every session is dropped right after CONNECT, well inside the
        // resolution window
        for _ in 0..4 {
            let conn = peer.accept().await;
            drop(conn);
        }

        assert!(channel.status().stats.connections >= 3);
        assert_eq!(
            manager
                .current_server(ServerRole::Operations, TransportProtocolId::TCP)
                .await,
            Some(peer.server())
        );
        assert!(fatal.try_recv().is_err());
    }
}
