//! CONNECT handshake for operation channels.
//!
//! The CONNECT frame carries the wrapped session key, the device signature
//! over it, and an encrypted initial sync covering every supported transport.

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};
use uplink_wire::{Connect, Frame, PLATFORM_PROTOCOL_ID};

use crate::boundary::Multiplexer;
use crate::crypto::CryptoSession;
use crate::error::ChannelError;
use crate::types::DirectionMap;

/// Build the CONNECT frame for a fresh session
pub fn build_connect(
    keep_alive: u16,
    crypto: &CryptoSession,
    multiplexer: &dyn Multiplexer,
    supported: &DirectionMap,
) -> Result<Frame, ChannelError> {
    let body = multiplexer
        .compile_request(supported)
        .map_err(ChannelError::Multiplexer)?;
    let payload = crypto.encrypt(&body)?;
    let session_key = crypto.wrap_session_key()?;
    let signature = crypto.sign(&session_key);

    debug!(
        "Built CONNECT (keep-alive {}s, {} byte initial sync)",
        keep_alive,
        body.len()
    );

    Ok(Frame::Connect(Connect {
        keep_alive,
        protocol_id: PLATFORM_PROTOCOL_ID,
        session_key: Bytes::from(session_key),
        signature: Bytes::from(signature),
        payload: Bytes::from(payload),
    }))
}

/// Encode and write one frame
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<usize, ChannelError> {
    let bytes = frame.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    trace!("Wrote {} ({} bytes)", frame.name(), bytes.len());
    Ok(bytes.len())
}

/// Read until at least one frame is decoded
///
/// Frames decoded beyond the first stay in `pending` for the next call.
#[cfg(test)]
pub(crate) async fn recv_any_frame<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
    decoder: &mut uplink_wire::FrameDecoder,
    pending: &mut Vec<Frame>,
) -> Result<Frame, ChannelError> {
    use tokio::io::AsyncReadExt;

    let mut buffer = bytes::BytesMut::with_capacity(4 * 1024);
    loop {
        if !pending.is_empty() {
            return Ok(pending.remove(0));
        }

        buffer.clear();
        let bytes_read = reader.read_buf(&mut buffer).await?;
        if bytes_read == 0 {
            return Err(ChannelError::EndOfStream);
        }
        pending.extend(decoder.feed(&buffer)?);
    }
}
