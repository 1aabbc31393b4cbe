//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Unknown frame type nibble
    #[error("unknown frame type {0:#x}")]
    Type(u8),

    /// Header flags not valid for the frame type
    #[error("invalid flags {flags:#x} for frame type {typ:#x}")]
    Flags {
        /// Frame type nibble
        typ: u8,
        /// Offending flags nibble
        flags: u8,
    },

    /// Remaining-length varint longer than four bytes
    #[error("malformed remaining length")]
    Length,

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Unknown CONNACK return code
    #[error("unknown return code {0}")]
    ReturnCode(u8),

    /// Unknown DISCONNECT reason code
    #[error("unknown disconnect reason {0}")]
    Reason(u8),

    /// Body does not match the declared layout
    #[error("malformed {0} body")]
    Malformed(&'static str),
}
