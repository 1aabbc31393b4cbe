//! Frame types for the sync wire protocol.
//!
//! Every frame starts with a one-byte header whose high nibble is the frame
//! type and whose low nibble carries type-specific flags, followed by the
//! remaining length as a base-128 varint and the type-specific body.

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::put_remaining_length;
use crate::error::WireError;

/// Maximum body size accepted or produced (what four varint bytes can express)
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Protocol identifier carried in CONNECT
pub const PLATFORM_PROTOCOL_ID: u8 = 0x01;

/// Header type nibbles
pub(crate) mod kind {
    pub const CONNECT: u8 = 0x1;
    pub const CONNACK: u8 = 0x2;
    pub const PINGREQ: u8 = 0xC;
    pub const PINGRESP: u8 = 0xD;
    pub const DISCONNECT: u8 = 0xE;
    pub const SYNC: u8 = 0xF;

    /// Low-nibble flag on SYNC frames marking a server response
    pub const SYNC_RESPONSE_FLAG: u8 = 0x1;
}

/// CONNACK return codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    /// Connection accepted
    Accepted = 0x01,
    /// Unsupported protocol
    RefuseBadProtocol = 0x02,
    /// Endpoint identifier rejected
    RefuseIdRejected = 0x03,
    /// Server temporarily unavailable
    RefuseServerUnavailable = 0x04,
    /// Credentials rejected; the device identity must be discarded
    RefuseBadCredentials = 0x05,
    /// Endpoint not authorized
    RefuseNoAuth = 0x06,
    /// Signature or session key verification failed
    RefuseVerificationFailed = 0x07,
}

impl TryFrom<u8> for ReturnCode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(ReturnCode::Accepted),
            0x02 => Ok(ReturnCode::RefuseBadProtocol),
            0x03 => Ok(ReturnCode::RefuseIdRejected),
            0x04 => Ok(ReturnCode::RefuseServerUnavailable),
            0x05 => Ok(ReturnCode::RefuseBadCredentials),
            0x06 => Ok(ReturnCode::RefuseNoAuth),
            0x07 => Ok(ReturnCode::RefuseVerificationFailed),
            _ => Err(WireError::ReturnCode(value)),
        }
    }
}

/// DISCONNECT reason codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Graceful close
    None = 0x00,
    /// Peer could not parse a request
    BadRequest = 0x01,
    /// Peer hit an internal error
    InternalError = 0x02,
    /// Device credentials were revoked
    CredentialsRevoked = 0x03,
}

impl TryFrom<u8> for DisconnectReason {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(DisconnectReason::None),
            0x01 => Ok(DisconnectReason::BadRequest),
            0x02 => Ok(DisconnectReason::InternalError),
            0x03 => Ok(DisconnectReason::CredentialsRevoked),
            _ => Err(WireError::Reason(value)),
        }
    }
}

bitflags! {
    /// Flags byte of SYNC-REQUEST / SYNC-RESPONSE bodies
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SyncFlags: u8 {
        /// Payload is compressed
        const ZIPPED = 1 << 0;
        /// Payload is encrypted with the session key
        const ENCRYPTED = 1 << 1;
    }
}

/// CONNECT body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Keep-alive interval in seconds
    pub keep_alive: u16,
    /// Platform protocol identifier
    pub protocol_id: u8,
    /// Session key wrapped for the destination
    pub session_key: Bytes,
    /// Device signature over the wrapped session key
    pub signature: Bytes,
    /// Encrypted initial sync payload
    pub payload: Bytes,
}

/// SYNC-REQUEST / SYNC-RESPONSE body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncBody {
    /// Payload flags
    pub flags: SyncFlags,
    /// Opaque (possibly encrypted) payload
    pub payload: Bytes,
}

impl SyncBody {
    /// Encrypted, uncompressed payload
    pub fn encrypted(payload: Bytes) -> Self {
        Self {
            flags: SyncFlags::ENCRYPTED,
            payload,
        }
    }

    /// Plain, uncompressed payload
    pub fn plain(payload: Bytes) -> Self {
        Self {
            flags: SyncFlags::empty(),
            payload,
        }
    }

    /// Whether the payload has to be decrypted before use
    pub fn is_encrypted(&self) -> bool {
        self.flags.contains(SyncFlags::ENCRYPTED)
    }

    /// Whether the payload is compressed
    pub fn is_zipped(&self) -> bool {
        self.flags.contains(SyncFlags::ZIPPED)
    }
}

/// Complete wire frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Session establishment, device to server
    Connect(Connect),
    /// Session establishment result, server to device
    ConnAck(ReturnCode),
    /// Multiplexed sync, device to server
    SyncRequest(SyncBody),
    /// Multiplexed sync, server to device
    SyncResponse(SyncBody),
    /// Keep-alive probe
    PingReq,
    /// Keep-alive answer
    PingResp,
    /// Session termination
    Disconnect(DisconnectReason),
}

impl Frame {
    /// Short frame name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Connect(_) => "CONNECT",
            Frame::ConnAck(_) => "CONNACK",
            Frame::SyncRequest(_) => "SYNC-REQUEST",
            Frame::SyncResponse(_) => "SYNC-RESPONSE",
            Frame::PingReq => "PINGREQ",
            Frame::PingResp => "PINGRESP",
            Frame::Disconnect(_) => "DISCONNECT",
        }
    }

    fn header(&self) -> u8 {
        let (typ, flags) = match self {
            Frame::Connect(_) => (kind::CONNECT, 0),
            Frame::ConnAck(_) => (kind::CONNACK, 0),
            Frame::SyncRequest(_) => (kind::SYNC, 0),
            Frame::SyncResponse(_) => (kind::SYNC, kind::SYNC_RESPONSE_FLAG),
            Frame::PingReq => (kind::PINGREQ, 0),
            Frame::PingResp => (kind::PINGRESP, 0),
            Frame::Disconnect(_) => (kind::DISCONNECT, 0),
        };
        (typ << 4) | flags
    }

    fn body_len(&self) -> usize {
        match self {
            Frame::Connect(c) => {
                2 + 1 + 2 + c.session_key.len() + 2 + c.signature.len() + 4 + c.payload.len()
            }
            Frame::ConnAck(_) | Frame::Disconnect(_) => 1,
            Frame::SyncRequest(s) | Frame::SyncResponse(s) => 1 + 4 + s.payload.len(),
            Frame::PingReq | Frame::PingResp => 0,
        }
    }

    /// Encode frame to a contiguous buffer
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let body_len = self.body_len();
        if body_len > MAX_REMAINING_LENGTH {
            return Err(WireError::Size(body_len));
        }

        let mut buf = BytesMut::with_capacity(1 + 4 + body_len);
        buf.put_u8(self.header());
        put_remaining_length(&mut buf, body_len);

        match self {
            Frame::Connect(c) => {
                buf.put_u16(c.keep_alive);
                buf.put_u8(c.protocol_id);
                put_short_field(&mut buf, &c.session_key, "CONNECT")?;
                put_short_field(&mut buf, &c.signature, "CONNECT")?;
                buf.put_u32(c.payload.len() as u32);
                buf.put_slice(&c.payload);
            }
            Frame::ConnAck(code) => buf.put_u8(*code as u8),
            Frame::SyncRequest(s) | Frame::SyncResponse(s) => {
                buf.put_u8(s.flags.bits());
                buf.put_u32(s.payload.len() as u32);
                buf.put_slice(&s.payload);
            }
            Frame::PingReq | Frame::PingResp => {}
            Frame::Disconnect(reason) => buf.put_u8(*reason as u8),
        }

        Ok(buf.freeze())
    }
}

fn put_short_field(buf: &mut BytesMut, field: &[u8], frame: &'static str) -> Result<(), WireError> {
    let len = u16::try_from(field.len()).map_err(|_| WireError::Malformed(frame))?;
    buf.put_u16(len);
    buf.put_slice(field);
    Ok(())
}
