//! Per-connection read/write tasks.
//!
//! Each connection runs a reader (inline in the connection task) and a
//! writer (spawned) that share a cancellation token: whichever side stops
//! first cancels the other. The writer owns the socket sink and merges three
//! sources: engine commands, upload DATA from serving tasks, and its own
//! keepalive PINGs. Small hash requests to batch-capable peers are held for
//! a short window and sent as one BATCH_REQUEST.
//!
//! Incoming REQUESTs are served on their own tasks so a slow upload never
//! blocks the reader. Admission is decided by the engine; the handler only
//! validates the request, opens the content and streams it. Serving tasks
//! per connection are capped at `HandlerContext::max_serving`; a request over
//! the cap is answered "Busy" without queueing, and a peer that does not even
//! drain those answers is disconnected.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, timeout};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::config::{BATCH_FLUSH_WINDOW, MAX_BATCH_ENTRIES, MAX_FRAME_PAYLOAD};
use crate::error::{P2pError, P2pResult};
use crate::peer::PeerId;
use crate::protocol::{
    reasons, BatchRequest, Frame, FrameCodec, Handshake, Hello, MessageKind, RequestPayload,
};
use crate::store::{ContentReader, ContentStore};
use crate::throttle::RateLimiter;

/// DATA frames queued per connection before uploads wait.
pub const UPLOAD_QUEUE_DEPTH: usize = 16;

/// Serving tasks allowed per connection beyond the per-IP upload cap, so
/// refusals can still be answered while every upload slot is taken.
pub const SERVE_SLOT_MARGIN: usize = 4;

/// Minimum spacing between upload progress reports.
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Commands from the engine to a connection.
#[derive(Debug)]
pub enum PeerCommand {
    /// Send a REQUEST. Batchable requests may be coalesced.
    Request {
        request_id: u32,
        payload: RequestPayload,
        batchable: bool,
    },
    /// Send a frame as is.
    Send(Frame),
    /// Close the connection.
    Disconnect,
}

/// Engine decision on an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadGrant {
    pub upload_id: u64,
    /// Route DATA through the shared rate limiter.
    pub throttled: bool,
}

/// Ask the engine whether a request may be served.
#[derive(Debug)]
pub struct AdmissionRequest {
    pub peer_id: PeerId,
    /// Whether the upload draws on the requester's usage credits.
    pub charge: bool,
    pub reply: oneshot::Sender<Result<UploadGrant, &'static str>>,
}

/// How an admitted upload ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Completed,
    NotFound,
    Aborted,
}

/// Final accounting for an admitted upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadReport {
    pub peer_id: PeerId,
    pub upload_id: u64,
    pub bytes: u64,
    pub elapsed: Duration,
    pub outcome: UploadOutcome,
}

/// Events from a connection to the engine.
#[derive(Debug)]
pub enum PeerEvent {
    /// Remote HELLO received.
    Hello { peer_id: PeerId, hello: Hello },
    /// New RTT sample.
    Rtt { peer_id: PeerId, rtt: Duration },
    /// DATA, END or ERROR for one of our requests.
    Transfer { peer_id: PeerId, frame: Frame },
    /// An incoming request needs admission.
    Admit(AdmissionRequest),
    /// Bytes sent so far on an upload.
    UploadProgress {
        peer_id: PeerId,
        upload_id: u64,
        bytes: u64,
    },
    /// An admitted upload ended.
    UploadFinished(UploadReport),
    /// The peer sent a hostile request.
    Violation { peer_id: PeerId, reason: String },
    /// The connection is gone.
    Disconnected { peer_id: PeerId, reason: String },
}

/// Settings and shared resources for connection tasks.
#[derive(Clone)]
pub struct HandlerContext {
    pub events: mpsc::UnboundedSender<PeerEvent>,
    pub store: Arc<dyn ContentStore>,
    pub limiter: Arc<RateLimiter>,
    pub hello: Hello,
    pub buffer_size: usize,
    pub idle_timeout: Duration,
    pub keepalive_interval: Duration,
    pub batch_charges_usage: bool,
    /// Requests validated, admitted or served at once on one connection.
    pub max_serving: usize,
}

/// Reports completion of an admitted upload when dropped.
pub struct UploadPermit {
    peer_id: PeerId,
    upload_id: u64,
    events: mpsc::UnboundedSender<PeerEvent>,
    started: Instant,
    bytes: u64,
    outcome: UploadOutcome,
}

impl UploadPermit {
    fn new(peer_id: PeerId, upload_id: u64, events: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            peer_id,
            upload_id,
            events,
            started: Instant::now(),
            bytes: 0,
            outcome: UploadOutcome::Aborted,
        }
    }
}

impl Drop for UploadPermit {
    fn drop(&mut self) {
        let _ = self.events.send(PeerEvent::UploadFinished(UploadReport {
            peer_id: self.peer_id,
            upload_id: self.upload_id,
            bytes: self.bytes,
            elapsed: self.started.elapsed(),
            outcome: self.outcome,
        }));
    }
}

/// Spawn the tasks for one connection.
///
/// Returns the command channel and the connection task handle. The task
/// sends [`PeerEvent::Disconnected`] as its last event.
pub fn spawn_peer_connection<S>(
    peer_id: PeerId,
    stream: S,
    ctx: HandlerContext,
) -> (mpsc::UnboundedSender<PeerCommand>, JoinHandle<()>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(run_connection(peer_id, stream, cmd_tx.clone(), cmd_rx, ctx));
    (cmd_tx, handle)
}

async fn run_connection<S>(
    peer_id: PeerId,
    stream: S,
    cmd_tx: mpsc::UnboundedSender<PeerCommand>,
    cmd_rx: mpsc::UnboundedReceiver<PeerCommand>,
    ctx: HandlerContext,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sink, frames) = Framed::new(stream, FrameCodec::new()).split();
    let cancel = CancellationToken::new();
    let handshake = Arc::new(Mutex::new(Handshake::new()));
    let (data_tx, data_rx) = mpsc::channel(UPLOAD_QUEUE_DEPTH);
    let serve_slots = Arc::new(Semaphore::new(ctx.max_serving.max(1)));

    let writer = {
        let cancel = cancel.clone();
        let handshake = handshake.clone();
        let hello = ctx.hello;
        let keepalive = ctx.keepalive_interval;
        tokio::spawn(async move {
            let result = write_loop(sink, cmd_rx, data_rx, handshake, hello, keepalive, &cancel).await;
            cancel.cancel();
            result
        })
    };

    let uploads = UploadSpawner {
        peer_id,
        ctx: &ctx,
        data_tx: &data_tx,
        slots: &serve_slots,
        cancel: &cancel,
    };
    let mut reason = read_loop(peer_id, frames, &ctx, &cmd_tx, &uploads, &handshake, &cancel).await;
    cancel.cancel();

    match writer.await {
        Ok(Err(e)) if reason == CLOSED_LOCALLY => reason = format!("write failed: {}", e),
        Err(e) => tracing::warn!(peer = %peer_id, error = %e, "Writer task failed"),
        _ => {}
    }

    tracing::debug!(peer = %peer_id, reason = %reason, "Connection closed");
    let _ = ctx.events.send(PeerEvent::Disconnected { peer_id, reason });
}

const CLOSED_LOCALLY: &str = "closed locally";

async fn write_loop<W>(
    mut sink: W,
    mut commands: mpsc::UnboundedReceiver<PeerCommand>,
    mut uploads: mpsc::Receiver<Frame>,
    handshake: Arc<Mutex<Handshake>>,
    hello: Hello,
    keepalive: Duration,
    cancel: &CancellationToken,
) -> P2pResult<()>
where
    W: Sink<Frame, Error = P2pError> + Unpin,
{
    sink.send(Frame::hello(hello)).await?;
    let nonce = handshake.lock().start_ping(Instant::now());
    sink.send(Frame::ping(nonce)).await?;

    let mut batch = BatchRequest::new();
    let mut flush_at: Option<tokio::time::Instant> = None;
    let mut keepalive = interval_at(tokio::time::Instant::now() + keepalive, keepalive);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            command = commands.recv() => match command {
                None | Some(PeerCommand::Disconnect) => break,
                Some(PeerCommand::Send(frame)) => sink.send(frame).await?,
                Some(PeerCommand::Request { request_id, payload, batchable }) => {
                    match (&payload, batchable) {
                        (RequestPayload::Hash(hash), true) => {
                            batch.push(request_id, hash);
                            if batch.len() >= MAX_BATCH_ENTRIES {
                                flush_batch(&mut sink, &mut batch).await?;
                                flush_at = None;
                            } else if flush_at.is_none() {
                                flush_at = Some(tokio::time::Instant::now() + BATCH_FLUSH_WINDOW);
                            }
                        }
                        _ => sink.send(Frame::request(request_id, &payload)?).await?,
                    }
                }
            },

            Some(frame) = uploads.recv() => sink.send(frame).await?,

            _ = async {
                match flush_at {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => {
                flush_batch(&mut sink, &mut batch).await?;
                flush_at = None;
            }

            _ = keepalive.tick() => {
                let nonce = handshake.lock().start_ping(Instant::now());
                sink.send(Frame::ping(nonce)).await?;
            }
        }
    }

    Ok(())
}

async fn flush_batch<W>(sink: &mut W, batch: &mut BatchRequest) -> P2pResult<()>
where
    W: Sink<Frame, Error = P2pError> + Unpin,
{
    let pending = std::mem::take(batch);
    match pending.entries.as_slice() {
        [] => Ok(()),
        // A batch of one is just a request
        [single] => {
            let frame = Frame::new(MessageKind::Request, single.request_id, single.payload.clone());
            sink.send(frame).await
        }
        _ => {
            tracing::trace!(entries = pending.len(), "Flushing batch request");
            sink.send(Frame::batch(&pending)?).await
        }
    }
}

async fn read_loop<R>(
    peer_id: PeerId,
    mut frames: R,
    ctx: &HandlerContext,
    cmd_tx: &mpsc::UnboundedSender<PeerCommand>,
    uploads: &UploadSpawner<'_>,
    handshake: &Mutex<Handshake>,
    cancel: &CancellationToken,
) -> String
where
    R: Stream<Item = P2pResult<Frame>> + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return CLOSED_LOCALLY.to_string(),
            next = timeout(ctx.idle_timeout, frames.next()) => next,
        };

        let frame = match next {
            Err(_) => return "idle timeout".to_string(),
            Ok(None) => return "connection closed".to_string(),
            Ok(Some(Err(e))) => return format!("protocol violation: {}", e),
            Ok(Some(Ok(frame))) => frame,
        };

        match frame.kind {
            MessageKind::Hello => {
                let hello = match Hello::decode(&frame.payload) {
                    Ok(hello) => hello,
                    Err(e) => return format!("protocol violation: {}", e),
                };
                if let Err(e) = handshake.lock().on_hello(hello) {
                    return format!("protocol violation: {}", e);
                }
                let _ = ctx.events.send(PeerEvent::Hello { peer_id, hello });
            }
            MessageKind::Ping => {
                let _ = cmd_tx.send(PeerCommand::Send(Frame::pong(frame.request_id)));
            }
            MessageKind::Pong => {
                let rtt = handshake.lock().on_pong(frame.request_id, Instant::now());
                if let Some(rtt) = rtt {
                    let _ = ctx.events.send(PeerEvent::Rtt { peer_id, rtt });
                }
            }
            MessageKind::Request => {
                if let Err(reason) = uploads.spawn(frame.request_id, frame.payload, true) {
                    return reason;
                }
            }
            MessageKind::BatchRequest => {
                let batch = match BatchRequest::decode(&frame.payload) {
                    Ok(batch) => batch,
                    Err(e) => return format!("protocol violation: {}", e),
                };
                tracing::trace!(peer = %peer_id, entries = batch.len(), "Batch request");
                for entry in batch.entries {
                    if let Err(reason) =
                        uploads.spawn(entry.request_id, entry.payload, ctx.batch_charges_usage)
                    {
                        return reason;
                    }
                }
            }
            MessageKind::Data | MessageKind::End | MessageKind::Error => {
                let _ = ctx.events.send(PeerEvent::Transfer { peer_id, frame });
            }
        }
    }
}

/// Starts serving tasks for one connection within its slot budget.
struct UploadSpawner<'a> {
    peer_id: PeerId,
    ctx: &'a HandlerContext,
    data_tx: &'a mpsc::Sender<Frame>,
    slots: &'a Arc<Semaphore>,
    cancel: &'a CancellationToken,
}

impl UploadSpawner<'_> {
    /// Serve `payload` on a new task. Over the slot budget the request is
    /// refused inline; `Err` carries the disconnect reason when even the
    /// refusal cannot be queued.
    fn spawn(&self, request_id: u32, payload: Bytes, charge: bool) -> Result<(), String> {
        let slot = match self.slots.clone().try_acquire_owned() {
            Ok(slot) => slot,
            Err(_) => {
                tracing::debug!(peer = %self.peer_id, request_id, "Serve slots exhausted");
                return match self.data_tx.try_send(Frame::error(request_id, reasons::BUSY)) {
                    Ok(()) => Ok(()),
                    Err(_) => Err("upload queue overflow".to_string()),
                };
            }
        };

        let peer_id = self.peer_id;
        let ctx = self.ctx.clone();
        let data_tx = self.data_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            serve_request(peer_id, request_id, payload, charge, ctx, data_tx, cancel).await;
            drop(slot);
        });
        Ok(())
    }
}

/// Validate, admit and serve one incoming request.
async fn serve_request(
    peer_id: PeerId,
    request_id: u32,
    payload: Bytes,
    charge: bool,
    ctx: HandlerContext,
    data_tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
) {
    let request = match RequestPayload::decode(&payload) {
        Ok(request) => request,
        Err(e) => {
            let reason = match e {
                P2pError::PathTraversal(_) => reasons::INVALID_PATH,
                _ => reasons::INVALID_HASH,
            };
            if e.is_security_violation() {
                tracing::warn!(peer = %peer_id, error = %e, "Rejected hostile request");
                let _ = ctx.events.send(PeerEvent::Violation {
                    peer_id,
                    reason: e.to_string(),
                });
            }
            let _ = data_tx.send(Frame::error(request_id, reason)).await;
            return;
        }
    };

    let (reply, decision) = oneshot::channel();
    let admission = AdmissionRequest {
        peer_id,
        charge,
        reply,
    };
    if ctx.events.send(PeerEvent::Admit(admission)).is_err() {
        return;
    }
    let grant = match decision.await {
        Ok(Ok(grant)) => grant,
        Ok(Err(reason)) => {
            tracing::debug!(peer = %peer_id, request_id, reason, "Upload refused");
            let _ = data_tx.send(Frame::error(request_id, reason)).await;
            return;
        }
        Err(_) => return,
    };

    let mut permit = UploadPermit::new(peer_id, grant.upload_id, ctx.events.clone());
    let content = match ctx.store.open(&request).await {
        Ok(Some(content)) => content,
        Ok(None) => {
            permit.outcome = UploadOutcome::NotFound;
            let _ = data_tx.send(Frame::error(request_id, reasons::NOT_FOUND)).await;
            return;
        }
        Err(e) => {
            tracing::warn!(peer = %peer_id, hash = %request.hash(), error = %e, "Failed to open content");
            permit.outcome = UploadOutcome::NotFound;
            let _ = data_tx.send(Frame::error(request_id, reasons::INTERNAL)).await;
            return;
        }
    };

    tracing::debug!(
        peer = %peer_id,
        hash = %request.hash(),
        size = content.size,
        throttled = grant.throttled,
        "Serving upload"
    );
    stream_content(request_id, content, grant, &mut permit, &ctx, &data_tx, &cancel).await;
}

async fn stream_content(
    request_id: u32,
    content: ContentReader,
    grant: UploadGrant,
    permit: &mut UploadPermit,
    ctx: &HandlerContext,
    data_tx: &mpsc::Sender<Frame>,
    cancel: &CancellationToken,
) {
    let chunk_size = ctx.buffer_size.clamp(1, MAX_FRAME_PAYLOAD);
    let mut reader = content.reader;
    let mut last_report = Instant::now();

    loop {
        let mut buf = BytesMut::with_capacity(chunk_size);
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            read = reader.read_buf(&mut buf) => read,
        };
        let n = match read {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(peer = %permit.peer_id, error = %e, "Upload read failed");
                let _ = data_tx.send(Frame::error(request_id, reasons::INTERNAL)).await;
                return;
            }
        };
        if n == 0 {
            break;
        }

        if grant.throttled {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ctx.limiter.acquire(n) => {}
            }
        }
        if data_tx.send(Frame::data(request_id, buf.freeze())).await.is_err() {
            return;
        }
        permit.bytes += n as u64;

        if last_report.elapsed() >= PROGRESS_INTERVAL {
            last_report = Instant::now();
            let _ = ctx.events.send(PeerEvent::UploadProgress {
                peer_id: permit.peer_id,
                upload_id: permit.upload_id,
                bytes: permit.bytes,
            });
        }
    }

    if data_tx.send(Frame::end(request_id)).await.is_ok() {
        permit.outcome = UploadOutcome::Completed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CAP_BATCH;
    use crate::store::DirStore;
    use swarmfetch_core::ContentHash;
    use tokio::io::DuplexStream;

    const SHA1_ABC: &str = "a9993e364706816aba3e25717850c26c9cd0d89d";

    struct Harness {
        remote: Framed<DuplexStream, FrameCodec>,
        events: mpsc::UnboundedReceiver<PeerEvent>,
        commands: mpsc::UnboundedSender<PeerCommand>,
        _dir: tempfile::TempDir,
    }

    async fn harness(batch_charges_usage: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::new(dir.path());
        store
            .put_object(&ContentHash::parse(SHA1_ABC).unwrap(), b"abc")
            .await
            .unwrap();

        let (local, remote) = tokio::io::duplex(4 * 1024 * 1024);
        let (events_tx, events) = mpsc::unbounded_channel();
        let ctx = HandlerContext {
            events: events_tx,
            store: Arc::new(store),
            limiter: Arc::new(RateLimiter::new(u32::MAX as u64)),
            hello: Hello::new(4, true),
            buffer_size: 2,
            idle_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(60),
            batch_charges_usage,
            max_serving: 3,
        };
        let (commands, _handle) = spawn_peer_connection(PeerId::new(1), local, ctx);

        Harness {
            remote: Framed::new(remote, FrameCodec::new()),
            events,
            commands,
            _dir: dir,
        }
    }

    async fn next_frame(remote: &mut Framed<DuplexStream, FrameCodec>) -> Frame {
        timeout(Duration::from_secs(2), remote.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<PeerEvent>) -> PeerEvent {
        timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    /// Skip the HELLO and PING every connection opens with.
    async fn skip_greeting(h: &mut Harness) {
        let hello = next_frame(&mut h.remote).await;
        assert_eq!(hello.kind, MessageKind::Hello);
        assert_eq!(hello.payload.as_ref(), &[4, CAP_BATCH]);
        assert_eq!(next_frame(&mut h.remote).await.kind, MessageKind::Ping);
    }

    async fn admit(h: &mut Harness, expect_charge: bool) {
        match next_event(&mut h.events).await {
            PeerEvent::Admit(req) => {
                assert_eq!(req.charge, expect_charge);
                req.reply
                    .send(Ok(UploadGrant {
                        upload_id: 1,
                        throttled: false,
                    }))
                    .unwrap();
            }
            other => panic!("expected admission, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_greeting_and_pong() {
        let mut h = harness(false).await;
        skip_greeting(&mut h).await;

        h.remote.send(Frame::hello(Hello::new(2, false))).await.unwrap();
        match next_event(&mut h.events).await {
            PeerEvent::Hello { hello, .. } => assert_eq!(hello.weight, 2),
            other => panic!("unexpected {:?}", other),
        }

        h.remote.send(Frame::ping(77)).await.unwrap();
        let pong = next_frame(&mut h.remote).await;
        assert_eq!((pong.kind, pong.request_id), (MessageKind::Pong, 77));
    }

    #[tokio::test]
    async fn test_serves_object_in_chunks() {
        let mut h = harness(false).await;
        skip_greeting(&mut h).await;

        let request = RequestPayload::Hash(ContentHash::parse(SHA1_ABC).unwrap());
        h.remote.send(Frame::request(9, &request).unwrap()).await.unwrap();
        admit(&mut h, true).await;

        let mut body = Vec::new();
        loop {
            let frame = next_frame(&mut h.remote).await;
            assert_eq!(frame.request_id, 9);
            match frame.kind {
                MessageKind::Data => {
                    assert!(frame.payload.len() <= 2);
                    body.extend_from_slice(&frame.payload);
                }
                MessageKind::End => break,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(body, b"abc");

        match next_event(&mut h.events).await {
            PeerEvent::UploadFinished(report) => {
                assert_eq!(report.bytes, 3);
                assert_eq!(report.outcome, UploadOutcome::Completed);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_hash_is_reported() {
        let mut h = harness(false).await;
        skip_greeting(&mut h).await;

        h.remote
            .send(Frame::new(MessageKind::Request, 3, Bytes::from_static(b"../../etc")))
            .await
            .unwrap();

        let frame = next_frame(&mut h.remote).await;
        assert_eq!(frame.kind, MessageKind::Error);
        assert_eq!(frame.reason(), reasons::INVALID_HASH);
        assert!(matches!(
            next_event(&mut h.events).await,
            PeerEvent::Violation { .. }
        ));
    }

    #[tokio::test]
    async fn test_path_traversal_is_reported() {
        let mut h = harness(false).await;
        skip_greeting(&mut h).await;

        let payload = format!(r#"{{"h":"{}","p":"../../.ssh/id_rsa"}}"#, SHA1_ABC);
        h.remote
            .send(Frame::new(MessageKind::Request, 4, Bytes::from(payload)))
            .await
            .unwrap();

        let frame = next_frame(&mut h.remote).await;
        assert_eq!(frame.reason(), reasons::INVALID_PATH);
        assert!(matches!(
            next_event(&mut h.events).await,
            PeerEvent::Violation { .. }
        ));
    }

    #[tokio::test]
    async fn test_refusal_reason_forwarded() {
        let mut h = harness(false).await;
        skip_greeting(&mut h).await;

        let request = RequestPayload::Hash(ContentHash::parse(SHA1_ABC).unwrap());
        h.remote.send(Frame::request(5, &request).unwrap()).await.unwrap();
        match next_event(&mut h.events).await {
            PeerEvent::Admit(req) => req.reply.send(Err(reasons::OWNER_BUSY)).unwrap(),
            other => panic!("unexpected {:?}", other),
        }

        let frame = next_frame(&mut h.remote).await;
        assert_eq!(frame.kind, MessageKind::Error);
        assert_eq!(frame.reason(), reasons::OWNER_BUSY);
    }

    #[tokio::test]
    async fn test_missing_content_not_found() {
        let mut h = harness(false).await;
        skip_greeting(&mut h).await;

        let missing = ContentHash::parse("da39a3ee5e6b4b0d3255bfef95601890afd80709").unwrap();
        h.remote
            .send(Frame::request(6, &RequestPayload::Hash(missing)).unwrap())
            .await
            .unwrap();
        admit(&mut h, true).await;

        assert_eq!(next_frame(&mut h.remote).await.reason(), reasons::NOT_FOUND);
        match next_event(&mut h.events).await {
            PeerEvent::UploadFinished(report) => assert_eq!(report.outcome, UploadOutcome::NotFound),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_batch_entries_skip_credits() {
        let mut h = harness(false).await;
        skip_greeting(&mut h).await;

        let hash = ContentHash::parse(SHA1_ABC).unwrap();
        let mut batch = BatchRequest::new();
        batch.push(20, &hash);
        batch.push(21, &hash);
        h.remote.send(Frame::batch(&batch).unwrap()).await.unwrap();

        admit(&mut h, false).await;
        match next_event(&mut h.events).await {
            PeerEvent::Admit(req) => {
                assert!(!req.charge);
                req.reply
                    .send(Ok(UploadGrant {
                        upload_id: 2,
                        throttled: false,
                    }))
                    .unwrap();
            }
            other => panic!("unexpected {:?}", other),
        }

        let mut ended = Vec::new();
        while ended.len() < 2 {
            let frame = next_frame(&mut h.remote).await;
            if frame.kind == MessageKind::End {
                ended.push(frame.request_id);
            }
        }
        ended.sort();
        assert_eq!(ended, vec![20, 21]);
    }

    #[tokio::test]
    async fn test_small_requests_are_batched() {
        let mut h = harness(false).await;
        skip_greeting(&mut h).await;

        let hash = ContentHash::parse(SHA1_ABC).unwrap();
        for id in 1..=3 {
            h.commands
                .send(PeerCommand::Request {
                    request_id: id,
                    payload: RequestPayload::Hash(hash.clone()),
                    batchable: true,
                })
                .unwrap();
        }

        let frame = next_frame(&mut h.remote).await;
        assert_eq!(frame.kind, MessageKind::BatchRequest);
        let batch = BatchRequest::decode(&frame.payload).unwrap();
        let ids: Vec<u32> = batch.entries.iter().map(|e| e.request_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_unbatchable_request_sent_directly() {
        let mut h = harness(false).await;
        skip_greeting(&mut h).await;

        let hash = ContentHash::parse(SHA1_ABC).unwrap();
        h.commands
            .send(PeerCommand::Request {
                request_id: 8,
                payload: RequestPayload::Hash(hash),
                batchable: false,
            })
            .unwrap();

        let frame = next_frame(&mut h.remote).await;
        assert_eq!((frame.kind, frame.request_id), (MessageKind::Request, 8));
        assert_eq!(frame.payload.as_ref(), SHA1_ABC.as_bytes());
    }

    #[tokio::test]
    async fn test_transfer_frames_forwarded() {
        let mut h = harness(false).await;
        skip_greeting(&mut h).await;

        h.remote
            .send(Frame::data(11, Bytes::from_static(b"xy")))
            .await
            .unwrap();
        match next_event(&mut h.events).await {
            PeerEvent::Transfer { frame, .. } => assert_eq!(frame.request_id, 11),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_protocol_violation_disconnects() {
        let mut h = harness(false).await;
        skip_greeting(&mut h).await;

        use tokio::io::AsyncWriteExt;
        h.remote
            .get_mut()
            .write_all(&[99, 0, 0, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        match next_event(&mut h.events).await {
            PeerEvent::Disconnected { reason, .. } => assert!(reason.contains("protocol")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnect_command() {
        let mut h = harness(false).await;
        skip_greeting(&mut h).await;

        h.commands.send(PeerCommand::Disconnect).unwrap();
        match next_event(&mut h.events).await {
            PeerEvent::Disconnected { reason, .. } => assert_eq!(reason, CLOSED_LOCALLY),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_requests_over_serve_slots_are_busy() {
        let mut h = harness(false).await;
        skip_greeting(&mut h).await;

        let request = RequestPayload::Hash(ContentHash::parse(SHA1_ABC).unwrap());
        for id in 1..=4 {
            h.remote.send(Frame::request(id, &request).unwrap()).await.unwrap();
        }

        let mut pending = Vec::new();
        for _ in 0..3 {
            match next_event(&mut h.events).await {
                PeerEvent::Admit(req) => pending.push(req),
                other => panic!("expected admission, got {:?}", other),
            }
        }

        let frame = next_frame(&mut h.remote).await;
        assert_eq!((frame.kind, frame.request_id), (MessageKind::Error, 4));
        assert_eq!(frame.reason(), reasons::BUSY);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.events.try_recv().is_err());

        // Refusing the held requests frees their slots.
        for req in pending {
            req.reply.send(Err(reasons::BUSY)).unwrap();
        }
        for _ in 0..3 {
            assert_eq!(next_frame(&mut h.remote).await.reason(), reasons::BUSY);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        h.remote.send(Frame::request(5, &request).unwrap()).await.unwrap();
        assert!(matches!(next_event(&mut h.events).await, PeerEvent::Admit(_)));
    }

    #[tokio::test]
    async fn test_batch_over_serve_slots_is_partly_refused() {
        let mut h = harness(false).await;
        skip_greeting(&mut h).await;

        let hash = ContentHash::parse(SHA1_ABC).unwrap();
        let mut batch = BatchRequest::new();
        for id in 30..35 {
            batch.push(id, &hash);
        }
        h.remote.send(Frame::batch(&batch).unwrap()).await.unwrap();

        let mut refused = Vec::new();
        for _ in 0..2 {
            let frame = next_frame(&mut h.remote).await;
            assert_eq!(frame.reason(), reasons::BUSY);
            refused.push(frame.request_id);
        }
        assert_eq!(refused, vec![33, 34]);

        let mut admitted = 0;
        while let Ok(Some(PeerEvent::Admit(_))) =
            timeout(Duration::from_millis(100), h.events.recv()).await
        {
            admitted += 1;
        }
        assert_eq!(admitted, 3);
    }
}
