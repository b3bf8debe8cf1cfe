//! Request dispatch with retry across peers.

use std::collections::HashSet;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use swarmfetch_core::ContentHash;
use tokio::sync::mpsc;

use crate::config::{MIN_REQUEST_ATTEMPTS, PEER_WAIT_TIMEOUT, SOFT_FAILURE_BACKOFF};
use crate::engine::commands::{DispatchRefusal, RequestTicket, TransferEvent};
use crate::engine::P2pEngine;
use crate::error::{P2pError, P2pResult};
use crate::peer::PeerId;

/// Cancels the engine request on drop unless it already finished.
struct RequestGuard {
    engine: P2pEngine,
    request_id: u32,
    finished: bool,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.engine.cancel_request(self.request_id);
        }
    }
}

/// Content streamed from a peer.
///
/// Yields the chunks of one request. A failure mid-transfer ends the
/// stream with an `io::Error` wrapping the [`P2pError`]. Dropping the
/// stream early cancels the request.
pub struct P2pStream {
    guard: RequestGuard,
    peer_id: PeerId,
    first: Option<Bytes>,
    events: mpsc::UnboundedReceiver<TransferEvent>,
    done: bool,
}

impl P2pStream {
    /// The peer serving this stream.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn finish(&mut self) {
        self.done = true;
        self.guard.finished = true;
    }
}

impl Stream for P2pStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(chunk) = self.first.take() {
            return Poll::Ready(Some(Ok(chunk)));
        }
        if self.done {
            return Poll::Ready(None);
        }

        match self.events.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(TransferEvent::Data(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(TransferEvent::End)) => {
                self.finish();
                Poll::Ready(None)
            }
            Poll::Ready(Some(TransferEvent::Failed(e))) => {
                self.finish();
                Poll::Ready(Some(Err(io::Error::new(io::ErrorKind::Other, e))))
            }
            Poll::Ready(None) => {
                self.finish();
                Poll::Ready(Some(Err(io::Error::new(
                    io::ErrorKind::Other,
                    P2pError::EngineStopped,
                ))))
            }
        }
    }
}

impl std::fmt::Debug for P2pStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("P2pStream")
            .field("request_id", &self.guard.request_id)
            .field("peer_id", &self.peer_id)
            .field("done", &self.done)
            .finish()
    }
}

impl P2pEngine {
    /// Fetch `hash` (expected to be `size` bytes) from the swarm.
    ///
    /// Tries the best untried peer until one starts streaming. Failures
    /// before any byte arrived move on to the next peer after a short
    /// backoff; a failure after bytes arrived is returned. With no peers
    /// connected yet, waits for one to join.
    ///
    /// Resolves once the first DATA or END frame arrives.
    pub async fn request_file(&self, hash: &ContentHash, size: u64) -> P2pResult<P2pStream> {
        let budget = MIN_REQUEST_ATTEMPTS.max(self.peer_count() + 2);
        let mut tried: HashSet<PeerId> = HashSet::new();
        let mut waited = false;
        let mut last_error = P2pError::NoPeers;

        for _ in 0..budget {
            let ticket = match self.begin_request(hash.clone(), size, tried.clone()).await {
                Ok(ticket) => ticket,
                Err(DispatchRefusal::NoPeers) if tried.is_empty() && !waited => {
                    waited = true;
                    tracing::debug!(hash = %hash, "No peers yet, waiting");
                    if !self.wait_for_peers(1, PEER_WAIT_TIMEOUT).await {
                        return Err(P2pError::NoPeers);
                    }
                    continue;
                }
                Err(DispatchRefusal::NoPeers) => return Err(last_error),
                Err(DispatchRefusal::Saturated) => return Err(P2pError::Saturated),
                Err(DispatchRefusal::NotRunning) => return Err(P2pError::EngineStopped),
            };

            tried.insert(ticket.peer_id);
            match self.await_first(ticket).await {
                Ok(stream) => return Ok(stream),
                Err(e) if e.bytes_received() > 0 => return Err(e),
                Err(e) => {
                    tracing::debug!(hash = %hash, error = %e, "Peer attempt failed, trying another");
                    last_error = e;
                    tokio::time::sleep(SOFT_FAILURE_BACKOFF).await;
                }
            }
        }

        Err(last_error)
    }

    async fn await_first(&self, ticket: RequestTicket) -> P2pResult<P2pStream> {
        let RequestTicket {
            request_id,
            peer_id,
            mut events,
        } = ticket;
        let mut guard = RequestGuard {
            engine: self.clone(),
            request_id,
            finished: false,
        };

        match events.recv().await {
            Some(TransferEvent::Data(chunk)) => Ok(P2pStream {
                guard,
                peer_id,
                first: Some(chunk),
                events,
                done: false,
            }),
            Some(TransferEvent::End) => {
                guard.finished = true;
                Ok(P2pStream {
                    guard,
                    peer_id,
                    first: None,
                    events,
                    done: true,
                })
            }
            Some(TransferEvent::Failed(e)) => {
                guard.finished = true;
                Err(e)
            }
            None => {
                guard.finished = true;
                Err(P2pError::EngineStopped)
            }
        }
    }
}
