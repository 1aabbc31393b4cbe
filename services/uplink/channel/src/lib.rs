//! Device-side data channels for the uplink sync protocol.
//!
//! An [`OperationChannel`] keeps one persistent, encrypted connection to an
//! operations server. It performs the CONNECT handshake with a fresh session
//! key, keeps the connection alive, feeds decrypted responses to the
//! [`Demultiplexer`] and sends sync requests compiled by the [`Multiplexer`].
//! Failures go through a shared [`FailoverManager`] whose decisions drive
//! reconnects, server rotation in the [`ChannelManager`], or a [`FatalError`]
//! for the supervisor.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//! use uplink_channel::{
//!     ChannelConfig, ChannelContext, ChannelManager, DefaultFailoverManager, FailoverPolicy,
//!     IdentityStore, OperationChannel, ServerRole, TransportProtocolId,
//! };
//!
//! # async fn example(identity: Arc<dyn IdentityStore>) {
//! let (failover, signals) = DefaultFailoverManager::new(FailoverPolicy::default());
//! let failover = Arc::new(failover);
//! let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
//!
//! let manager = ChannelManager::new(failover.clone(), fatal_tx.clone());
//! manager.attach_failover_signals(signals);
//!
//! let channel = OperationChannel::spawn(
//!     ChannelConfig::default(),
//!     ChannelContext { identity, failover, fatal: fatal_tx },
//! );
//! manager.add_channel(Arc::new(channel)).await;
//! manager
//!     .set_servers(ServerRole::Operations, TransportProtocolId::TCP, Vec::new())
//!     .await;
//!
//! if let Some(fatal) = fatal_rx.recv().await {
//!     eprintln!("failover gave up: {:?}", fatal.status);
//! }
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod boundary;
pub mod channel;
pub mod crypto;
pub mod error;
pub mod failover;
pub mod handshake;
pub mod keepalive;
pub mod manager;
pub mod state;
pub mod transport;
pub mod types;

// Re-export main types
pub use boundary::{ConnectivityChecker, Demultiplexer, IdentityStore, Multiplexer};
pub use channel::{
    default_supported_types, ChannelConfig, ChannelContext, ChannelStats, ChannelStatus,
    FatalError, OperationChannel, CHANNEL_ID, DEFAULT_KEEP_ALIVE,
};
pub use crypto::{CryptoError, CryptoSession, PeerCrypto, SESSION_KEY_LEN};
pub use error::ChannelError;
pub use failover::{
    DefaultFailoverManager, FailoverDecision, FailoverManager, FailoverPolicy, FailoverStatus,
    ServerFailed,
};
pub use manager::{ChannelManager, DataChannel, MANAGER_ID};
pub use state::{ChannelState, Effect, Input, Transition};
pub use transport::connect_tcp;
pub use types::{
    Direction, DirectionMap, ServerDescriptor, ServerRole, TransportProtocolId, TransportType,
};
