//! Streaming decoder and varint helpers for the wire protocol.
//!
//! The decoder keeps a buffer across reads so a frame split over several
//! socket reads, or several frames delivered by one read, come out whole
//! and in order.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::error::WireError;
use crate::frame::{kind, Connect, DisconnectReason, Frame, ReturnCode, SyncBody, SyncFlags};
use crate::frame::MAX_REMAINING_LENGTH;

/// Default limit on a single frame body (16 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Append a remaining-length varint (7 bits per byte, high bit = continuation)
pub fn put_remaining_length(buf: &mut BytesMut, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

/// Parse a remaining-length varint from the start of `buf`.
///
/// Returns the decoded length and the number of bytes it occupied, or
/// `None` when more bytes are needed.
pub fn parse_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, WireError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;

    for (i, byte) in buf.iter().enumerate() {
        if i >= 4 {
            return Err(WireError::Length);
        }
        value += (*byte & 0x7F) as usize * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        multiplier *= 128;
    }

    if buf.len() >= 4 {
        return Err(WireError::Length);
    }
    Ok(None)
}

/// Frame decoder for parsing incoming frames
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a decoder with a custom body size limit
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4 * 1024),
            max_frame_size: max_frame_size.min(MAX_REMAINING_LENGTH),
        }
    }

    /// Push freshly read bytes and drain every complete frame
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Frame>, WireError> {
        self.buffer.extend_from_slice(bytes);

        let mut frames = Vec::new();
        while let Some(frame) = self.decode_next()? {
            frames.push(frame);
        }

        trace!(
            "Decoded {} frames, {} bytes left buffered",
            frames.len(),
            self.buffer.len()
        );
        Ok(frames)
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn decode_next(&mut self) -> Result<Option<Frame>, WireError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let header = self.buffer[0];
        let Some((body_len, len_bytes)) = parse_remaining_length(&self.buffer[1..])? else {
            return Ok(None);
        };

        if body_len > self.max_frame_size {
            return Err(WireError::Size(body_len));
        }

        if self.buffer.len() < 1 + len_bytes + body_len {
            return Ok(None);
        }

        self.buffer.advance(1 + len_bytes);
        let body = self.buffer.split_to(body_len).freeze();

        decode_body(header, body).map(Some)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_body(header: u8, mut body: Bytes) -> Result<Frame, WireError> {
    let typ = header >> 4;
    let flags = header & 0x0F;

    if typ != kind::SYNC && flags != 0 {
        return Err(WireError::Flags { typ, flags });
    }

    let frame = match typ {
        kind::CONNECT => {
            if body.len() < 3 {
                return Err(WireError::Malformed("CONNECT"));
            }
            let keep_alive = body.get_u16();
            let protocol_id = body.get_u8();
            let session_key = take_short_field(&mut body, "CONNECT")?;
            let signature = take_short_field(&mut body, "CONNECT")?;
            let payload = take_long_field(&mut body, "CONNECT")?;
            Frame::Connect(Connect {
                keep_alive,
                protocol_id,
                session_key,
                signature,
                payload,
            })
        }
        kind::CONNACK => Frame::ConnAck(ReturnCode::try_from(single_byte(&mut body, "CONNACK")?)?),
        kind::DISCONNECT => Frame::Disconnect(DisconnectReason::try_from(single_byte(
            &mut body,
            "DISCONNECT",
        )?)?),
        kind::PINGREQ | kind::PINGRESP => {
            if !body.is_empty() {
                return Err(WireError::Malformed("PING"));
            }
            if typ == kind::PINGREQ {
                Frame::PingReq
            } else {
                Frame::PingResp
            }
        }
        kind::SYNC => {
            if flags & !kind::SYNC_RESPONSE_FLAG != 0 {
                return Err(WireError::Flags { typ, flags });
            }
            if body.is_empty() {
                return Err(WireError::Malformed("SYNC"));
            }
            let sync_flags =
                SyncFlags::from_bits(body.get_u8()).ok_or(WireError::Malformed("SYNC"))?;
            let payload = take_long_field(&mut body, "SYNC")?;
            let sync = SyncBody {
                flags: sync_flags,
                payload,
            };
            if flags & kind::SYNC_RESPONSE_FLAG != 0 {
                Frame::SyncResponse(sync)
            } else {
                Frame::SyncRequest(sync)
            }
        }
        other => return Err(WireError::Type(other)),
    };

    if !body.is_empty() {
        return Err(WireError::Malformed(frame.name()));
    }
    Ok(frame)
}

fn single_byte(body: &mut Bytes, frame: &'static str) -> Result<u8, WireError> {
    if body.is_empty() {
        return Err(WireError::Malformed(frame));
    }
    Ok(body.get_u8())
}

fn take_short_field(body: &mut Bytes, frame: &'static str) -> Result<Bytes, WireError> {
    if body.len() < 2 {
        return Err(WireError::Malformed(frame));
    }
    let len = body.get_u16() as usize;
    if body.len() < len {
        return Err(WireError::Malformed(frame));
    }
    Ok(body.split_to(len))
}

fn take_long_field(body: &mut Bytes, frame: &'static str) -> Result<Bytes, WireError> {
    if body.len() < 4 {
        return Err(WireError::Malformed(frame));
    }
    let len = body.get_u32() as usize;
    if body.len() < len {
        return Err(WireError::Malformed(frame));
    }
    Ok(body.split_to(len))
}
