//! The peer side of a race.

use async_trait::async_trait;
use swarmfetch_core::{ByteStream, ContentHash};
use swarmfetch_p2p::{P2pEngine, P2pError};

/// Something that can stream content from peers.
#[async_trait]
pub trait PeerSource: Send + Sync + 'static {
    /// Resolve once the first bytes (or an empty END) arrive from a peer.
    async fn request_file(&self, hash: &ContentHash, size: u64) -> Result<ByteStream, P2pError>;

    /// Signal that peers have been serving us well.
    fn boost_weight(&self);
}

#[async_trait]
impl PeerSource for P2pEngine {
    async fn request_file(&self, hash: &ContentHash, size: u64) -> Result<ByteStream, P2pError> {
        let stream = P2pEngine::request_file(self, hash, size).await?;
        Ok(Box::pin(stream))
    }

    fn boost_weight(&self) {
        if let Err(e) = P2pEngine::boost_weight(self) {
            tracing::debug!(error = %e, "Weight boost not delivered");
        }
    }
}
