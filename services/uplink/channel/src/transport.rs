//! TCP transport for operation channels.

use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::ChannelError;

/// Connect to `host:port`, giving up after `timeout`
pub async fn connect_tcp(address: &str, timeout: Duration) -> Result<TcpStream, ChannelError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| ChannelError::ConnectTimeout(address.to_string()))??;

    stream.set_nodelay(true)?;
    debug!(
        "TCP connection established to {} from {:?}",
        address,
        stream.local_addr().ok()
    );
    Ok(stream)
}
