//! Outbound connection attempts.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::P2pError;

/// Result of an outbound connection attempt.
#[derive(Debug)]
pub enum ConnectResult {
    /// TCP connection established.
    Connected(SocketAddr, TcpStream),
    /// Connection failed.
    Failed(SocketAddr, P2pError),
}

/// Attempt to connect to a peer.
pub async fn connect_to_peer(addr: SocketAddr, connect_timeout: Duration) -> ConnectResult {
    tracing::debug!(addr = %addr, "Connecting to peer");

    let stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return ConnectResult::Failed(addr, P2pError::Io(e)),
        Err(_) => return ConnectResult::Failed(addr, P2pError::ConnectionTimeout { addr }),
    };

    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!(addr = %addr, error = %e, "Failed to set TCP_NODELAY");
    }

    ConnectResult::Connected(addr, stream)
}
