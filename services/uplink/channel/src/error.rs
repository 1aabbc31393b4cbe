//! Channel error types.

use thiserror::Error;
use uplink_wire::WireError;

use crate::crypto::CryptoError;

/// Errors on the open and send paths of a channel
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Socket error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame could not be encoded or decoded
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Session crypto failed
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Multiplexer could not compile a request
    #[error("multiplexer error: {0:#}")]
    Multiplexer(anyhow::Error),

    /// Peer closed the connection
    #[error("end of stream")]
    EndOfStream,

    /// Connecting took longer than the configured timeout
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),

    /// A collaborator the operation needs was never bound
    #[error("{0} is not set")]
    NotBound(&'static str),

    /// No live connection to write to
    #[error("channel is not connected")]
    NotConnected,
}
