//! Inbound connection listener.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};

use crate::error::{P2pError, P2pResult};

/// TCP listener for peers dialling us.
#[derive(Debug)]
pub struct InboundListener {
    listener: TcpListener,
}

impl InboundListener {
    /// Bind the listener.
    pub async fn bind(addr: SocketAddr) -> P2pResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "Listening for inbound connections");
        Ok(Self { listener })
    }

    /// Get the local address we're listening on.
    pub fn local_addr(&self) -> P2pResult<SocketAddr> {
        self.listener.local_addr().map_err(P2pError::Io)
    }

    /// Accept the next inbound connection.
    pub async fn accept(&self) -> P2pResult<(TcpStream, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(addr = %addr, error = %e, "Failed to set TCP_NODELAY");
        }

        Ok((stream, addr))
    }
}
