//! Binary framing for the uplink sync protocol.
//!
//! This crate implements the frame codec used between a device and its
//! data-collection endpoint: frame types, body layouts, remaining-length
//! varints and a streaming decoder that tolerates partial and batched reads.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------------+
//! | u8 type | flags      | high nibble type, low nibble flags|
//! +----------------------+----------------------------------+
//! | remaining length     | base-128 varint, 1..4 bytes       |
//! +----------------------+----------------------------------+
//! | body                 | type-specific, see below          |
//! +----------------------+----------------------------------+
//! ```
//!
//! | Frame         | Body                                                        |
//! |---------------|-------------------------------------------------------------|
//! | CONNECT       | u16 keep-alive, u8 protocol, u16+key, u16+signature, u32+payload |
//! | CONNACK       | u8 return code                                              |
//! | SYNC-REQUEST  | u8 flags (bit0 zipped, bit1 encrypted), u32+payload         |
//! | SYNC-RESPONSE | same as SYNC-REQUEST, header flag bit0 set                  |
//! | PINGREQ/RESP  | empty                                                       |
//! | DISCONNECT    | u8 reason code                                              |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod frame;

// Re-export main types
pub use codec::{parse_remaining_length, put_remaining_length, FrameDecoder, DEFAULT_MAX_FRAME_SIZE};
pub use error::WireError;
pub use frame::{
    Connect, DisconnectReason, Frame, ReturnCode, SyncBody, SyncFlags, MAX_REMAINING_LENGTH,
    PLATFORM_PROTOCOL_ID,
};
