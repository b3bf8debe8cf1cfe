//! Streaming digest verification.
//!
//! Every byte stream handed to a consumer as "the asset" passes through a
//! [`HashVerifierStream`]. Chunks are forwarded as they arrive; when the
//! inner stream ends the digest is compared and a mismatch is emitted as a
//! final error item, so a consumer can never observe a clean end of a
//! corrupt stream.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{ready, Stream};

use crate::content::ContentHash;
use crate::crypto::StreamingHasher;
use crate::error::IntegrityError;

/// A boxed stream of byte chunks, the common currency of HTTP and P2P paths.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Wraps a byte stream and verifies its digest at end of stream.
pub struct HashVerifierStream<S> {
    inner: S,
    expected: ContentHash,
    hasher: Option<StreamingHasher>,
    bytes: u64,
    done: bool,
}

impl<S> HashVerifierStream<S> {
    /// Verify `inner` against `expected`, inferring the algorithm from its length.
    pub fn new(inner: S, expected: ContentHash) -> Self {
        let hasher = StreamingHasher::new(expected.algorithm());
        Self {
            inner,
            expected,
            hasher: Some(hasher),
            bytes: 0,
            done: false,
        }
    }

    /// Bytes seen so far.
    pub fn bytes_seen(&self) -> u64 {
        self.bytes
    }

    /// The hash being verified against.
    pub fn expected(&self) -> &ContentHash {
        &self.expected
    }
}

impl<S> Stream for HashVerifierStream<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(None);
        }

        match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
            Some(Ok(chunk)) => {
                if let Some(hasher) = this.hasher.as_mut() {
                    hasher.update(&chunk);
                }
                this.bytes += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Some(Err(e)) => {
                this.done = true;
                Poll::Ready(Some(Err(e)))
            }
            None => {
                this.done = true;
                let actual = this
                    .hasher
                    .take()
                    .map(StreamingHasher::finalize_hex)
                    .unwrap_or_default();

                if actual == this.expected.as_str() {
                    Poll::Ready(None)
                } else {
                    tracing::warn!(
                        expected = %this.expected,
                        actual = %actual,
                        bytes = this.bytes,
                        "Digest mismatch"
                    );
                    let err = IntegrityError {
                        expected: this.expected.to_string(),
                        actual,
                        bytes: this.bytes,
                    };
                    Poll::Ready(Some(Err(io::Error::new(io::ErrorKind::InvalidData, err))))
                }
            }
        }
    }
}

/// Extract the [`IntegrityError`] from an I/O error raised by a verifier.
pub fn integrity_error(err: &io::Error) -> Option<&IntegrityError> {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<IntegrityError>())
}

/// Verify a complete buffer in one call.
pub fn verify_bytes(expected: &ContentHash, data: &[u8]) -> Result<(), IntegrityError> {
    let mut hasher = StreamingHasher::new(expected.algorithm());
    hasher.update(data);
    let actual = hasher.finalize_hex();
    if actual == expected.as_str() {
        Ok(())
    } else {
        Err(IntegrityError {
            expected: expected.to_string(),
            actual,
            bytes: data.len() as u64,
        })
    }
}
