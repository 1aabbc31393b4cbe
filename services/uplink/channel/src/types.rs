//! Shared channel vocabulary: feature transports, directions and servers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Feature channel multiplexed over a data channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    /// Server list discovery
    Bootstrap,
    /// Endpoint profile
    Profile,
    /// Configuration delivery
    Configuration,
    /// Notification delivery
    Notification,
    /// User attachment
    User,
    /// Endpoint events
    Event,
    /// Telemetry log upload
    Logging,
}

/// Data direction of a transport on a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Device to server only
    Up,
    /// Server to device only
    Down,
    /// Both ways
    Bidirectional,
}

/// Direction per transport type, ordered for deterministic serialization
pub type DirectionMap = BTreeMap<TransportType, Direction>;

/// Role of the server a channel talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerRole {
    /// Discovery of operations servers
    Bootstrap,
    /// Data collection
    Operations,
}

/// Transport protocol identifier a server advertises
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransportProtocolId {
    /// Protocol id
    pub id: u32,
    /// Protocol version
    pub version: u32,
}

impl TransportProtocolId {
    /// Binary framed protocol over plain TCP
    pub const TCP: TransportProtocolId = TransportProtocolId {
        id: 0xfb9a_3cf0,
        version: 1,
    };
}

impl fmt::Display for TransportProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}/v{}", self.id, self.version)
    }
}

/// Destination a channel connects to
///
/// Replaced wholesale whenever a different server is selected.
#[derive(Clone, PartialEq, Eq)]
pub struct ServerDescriptor {
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Transport protocol the server speaks
    pub protocol: TransportProtocolId,
    /// Server role
    pub role: ServerRole,
    /// Destination public key used to wrap session keys
    pub public_key: Vec<u8>,
}

impl ServerDescriptor {
    /// Describe an operations server speaking the TCP protocol
    pub fn operations(host: impl Into<String>, port: u16, public_key: Vec<u8>) -> Self {
        Self {
            host: host.into(),
            port,
            protocol: TransportProtocolId::TCP,
            role: ServerRole::Operations,
            public_key,
        }
    }

    /// `host:port` string used for dialing and logs
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether both descriptors point at the same socket address
    pub fn same_endpoint(&self, other: &ServerDescriptor) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl fmt::Debug for ServerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerDescriptor")
            .field("address", &self.address())
            .field("protocol", &self.protocol)
            .field("role", &self.role)
            .field("public_key_len", &self.public_key.len())
            .finish()
    }
}

impl fmt::Display for ServerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({:?}, {})", self.host, self.port, self.role, self.protocol)
    }
}
