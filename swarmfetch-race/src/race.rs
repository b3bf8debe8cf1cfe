//! Racing HTTP against the swarm.
//!
//! For a URL carrying a content hash and a known size, the direct HTTP
//! request and the peer request start together and the first to produce a
//! response wins; the other future is dropped, which cancels it. A side that
//! fails leaves the race to the other. When both fail the configured mirrors
//! are tried in order. Whatever wins is verified against the content hash.
//!
//! [`RaceManager::download`] keeps going after a broken stream: a peer
//! delivery that fails or does not verify is fetched again from the origin
//! URL and then from the mirrors.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use swarmfetch_core::{extract_content_hash, ByteStream, ContentHash, HashVerifierStream};
use swarmfetch_p2p::{DownloadActivity, TrafficState};
use tokio::io::AsyncWriteExt;

use crate::error::{RaceError, RaceResult};
use crate::http::HttpClient;
use crate::source::PeerSource;

/// Consecutive peer wins that earn a weight boost.
pub const P2P_STREAK_BOOST: u32 = 10;

/// Race configuration.
#[derive(Debug, Clone)]
pub struct RaceConfig {
    /// Mirror base URLs, tried in order when the race fails.
    pub mirrors: Vec<String>,
    /// Consecutive peer wins before the engine weight is boosted.
    pub p2p_streak_boost: u32,
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            mirrors: Vec::new(),
            p2p_streak_boost: P2P_STREAK_BOOST,
        }
    }
}

impl RaceConfig {
    pub fn with_mirrors(mut self, mirrors: Vec<String>) -> Self {
        self.mirrors = mirrors;
        self
    }
}

/// An asset to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRequest {
    pub url: String,
    /// Expected size in bytes, when the caller knows it.
    pub size: Option<u64>,
}

impl AssetRequest {
    pub fn new(url: impl Into<String>, size: Option<u64>) -> Self {
        Self {
            url: url.into(),
            size,
        }
    }
}

/// Where a delivery came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverySource {
    /// Plain HTTP; no race was run.
    Direct,
    /// HTTP won the race, or served the asset after a peer delivery broke.
    Http,
    /// A peer won the race.
    Peer,
    /// The mirror at this index in [`RaceConfig::mirrors`].
    Mirror(usize),
}

/// A verified byte stream for one asset.
///
/// Ends with an `InvalidData` error carrying the integrity failure if the
/// bytes do not match the content hash. Counts as an active race until
/// dropped. HTTP bytes are added to the shared download counter as they are
/// read; the engine counts peer bytes itself.
pub struct Delivery {
    source: DeliverySource,
    hash: Option<ContentHash>,
    stream: ByteStream,
    traffic: Arc<TrafficState>,
    _activity: DownloadActivity,
}

impl Delivery {
    pub fn source(&self) -> DeliverySource {
        self.source
    }

    pub fn hash(&self) -> Option<&ContentHash> {
        self.hash.as_ref()
    }
}

impl Stream for Delivery {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let poll = this.stream.as_mut().poll_next(cx);
        if let Poll::Ready(Some(Ok(chunk))) = &poll {
            if this.source != DeliverySource::Peer {
                this.traffic.record_download(chunk.len() as u64);
            }
        }
        poll
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("source", &self.source)
            .field("hash", &self.hash)
            .finish_non_exhaustive()
    }
}

/// A completed download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downloaded {
    pub path: PathBuf,
    pub bytes: u64,
    pub source: DeliverySource,
}

fn verified(body: ByteStream, hash: Option<&ContentHash>) -> ByteStream {
    match hash {
        Some(hash) => Box::pin(HashVerifierStream::new(body, hash.clone())),
        None => body,
    }
}

/// Decides, per asset, where the bytes come from.
pub struct RaceManager {
    config: RaceConfig,
    http: Arc<dyn HttpClient>,
    peers: Option<Arc<dyn PeerSource>>,
    traffic: Arc<TrafficState>,
    p2p_streak: AtomicU32,
}

impl RaceManager {
    /// An HTTP-only manager. Add a peer source with [`with_peers`](Self::with_peers).
    pub fn new(config: RaceConfig, http: Arc<dyn HttpClient>, traffic: Arc<TrafficState>) -> Self {
        Self {
            config,
            http,
            peers: None,
            traffic,
            p2p_streak: AtomicU32::new(0),
        }
    }

    pub fn with_peers(mut self, peers: Arc<dyn PeerSource>) -> Self {
        self.peers = Some(peers);
        self
    }

    /// Downloads currently running through this manager's traffic state.
    pub fn active_races(&self) -> usize {
        self.traffic.active()
    }

    /// Current run of consecutive peer wins.
    pub fn p2p_streak(&self) -> u32 {
        self.p2p_streak.load(Ordering::Relaxed)
    }

    /// Fetch an asset as a verified stream.
    pub async fn fetch(&self, request: &AssetRequest) -> RaceResult<Delivery> {
        let activity = self.traffic.begin_download();
        let hash = extract_content_hash(&request.url);

        let raced = match (&hash, request.size, &self.peers) {
            (Some(hash), Some(size), Some(peers)) => {
                self.race(peers.as_ref(), &request.url, hash, size).await
            }
            _ => {
                tracing::debug!(url = %request.url, hashed = hash.is_some(), "Direct fetch");
                match self.http_body(&request.url).await {
                    Ok(body) => Some((DeliverySource::Direct, body)),
                    Err(e) => {
                        tracing::debug!(url = %request.url, error = %e, "Direct fetch failed");
                        None
                    }
                }
            }
        };

        let (source, body) = match raced {
            Some(found) => found,
            None => {
                let urls = self.mirror_urls(&request.url);
                let (index, body) = self.first_mirror(&request.url, &urls).await?;
                (DeliverySource::Mirror(index), body)
            }
        };

        tracing::debug!(url = %request.url, source = ?source, "Delivery ready");
        Ok(self.delivery(source, body, hash, activity))
    }

    /// Fetch an asset into `dest`, replacing it atomically.
    ///
    /// When the stream breaks or fails verification the download restarts
    /// from the next fallback source. A peer delivery falls back to the
    /// origin URL and then every mirror; an HTTP delivery falls back to the
    /// mirrors it has not tried yet.
    pub async fn download(&self, request: &AssetRequest, dest: &Path) -> RaceResult<Downloaded> {
        let mut delivery = self.fetch(request).await?;
        let hash = delivery.hash().cloned();
        let mut fallbacks = self.fallbacks(&request.url, delivery.source());

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = part_path(dest);

        let bytes = loop {
            let err = match write_stream(&mut delivery, &tmp).await {
                Ok(bytes) => break bytes,
                Err(WriteFailure::Source(err)) => err,
                Err(WriteFailure::Sink(err)) => {
                    let _ = tokio::fs::remove_file(&tmp).await;
                    return Err(RaceError::Io(err));
                }
            };
            tracing::warn!(url = %request.url, source = ?delivery.source(), error = %err, "Delivery broke, falling back");

            match self.next_fallback(&mut fallbacks).await {
                Some((source, body)) => {
                    let activity = self.traffic.begin_download();
                    delivery = self.delivery(source, body, hash.clone(), activity);
                }
                None => {
                    let _ = tokio::fs::remove_file(&tmp).await;
                    return Err(err);
                }
            }
        };

        tokio::fs::rename(&tmp, dest).await?;
        let source = delivery.source();
        tracing::info!(url = %request.url, path = %dest.display(), bytes, source = ?source, "Downloaded");
        Ok(Downloaded {
            path: dest.to_path_buf(),
            bytes,
            source,
        })
    }

    fn delivery(
        &self,
        source: DeliverySource,
        body: ByteStream,
        hash: Option<ContentHash>,
        activity: DownloadActivity,
    ) -> Delivery {
        Delivery {
            source,
            stream: verified(body, hash.as_ref()),
            hash,
            traffic: self.traffic.clone(),
            _activity: activity,
        }
    }

    /// HTTP sources still worth trying after `source` broke mid-stream.
    fn fallbacks(&self, url: &str, source: DeliverySource) -> VecDeque<(DeliverySource, String)> {
        let mirrors = self
            .mirror_urls(url)
            .into_iter()
            .enumerate()
            .map(|(index, mirror)| (DeliverySource::Mirror(index), mirror));

        match source {
            DeliverySource::Peer => std::iter::once((DeliverySource::Http, url.to_string()))
                .chain(mirrors)
                .collect(),
            DeliverySource::Direct | DeliverySource::Http => mirrors.collect(),
            DeliverySource::Mirror(tried) => mirrors.skip(tried + 1).collect(),
        }
    }

    async fn next_fallback(
        &self,
        fallbacks: &mut VecDeque<(DeliverySource, String)>,
    ) -> Option<(DeliverySource, ByteStream)> {
        while let Some((source, url)) = fallbacks.pop_front() {
            match self.http_body(&url).await {
                Ok(body) => return Some((source, body)),
                Err(e) => tracing::debug!(url = %url, error = %e, "Fallback failed"),
            }
        }
        None
    }

    async fn race(
        &self,
        peers: &dyn PeerSource,
        url: &str,
        hash: &ContentHash,
        size: u64,
    ) -> Option<(DeliverySource, ByteStream)> {
        let http = self.http_body(url);
        let p2p = peers.request_file(hash, size);
        tokio::pin!(http);
        tokio::pin!(p2p);

        let mut http_failed = false;
        let mut p2p_failed = false;

        loop {
            tokio::select! {
                result = &mut http, if !http_failed => match result {
                    Ok(body) => {
                        self.p2p_streak.store(0, Ordering::Relaxed);
                        tracing::debug!(hash = %hash, "HTTP won the race");
                        return Some((DeliverySource::Http, body));
                    }
                    Err(e) => {
                        tracing::debug!(url, error = %e, "HTTP side failed");
                        http_failed = true;
                    }
                },
                result = &mut p2p, if !p2p_failed => match result {
                    Ok(body) => {
                        self.record_peer_win(peers);
                        tracing::debug!(hash = %hash, "Peer won the race");
                        return Some((DeliverySource::Peer, body));
                    }
                    Err(e) => {
                        tracing::debug!(hash = %hash, error = %e, "Peer side failed");
                        p2p_failed = true;
                    }
                },
                else => {
                    tracing::debug!(url, "Both race sides failed");
                    return None;
                }
            }
        }
    }

    fn record_peer_win(&self, peers: &dyn PeerSource) {
        let streak = self.p2p_streak.fetch_add(1, Ordering::Relaxed) + 1;
        if streak >= self.config.p2p_streak_boost {
            self.p2p_streak.store(0, Ordering::Relaxed);
            tracing::info!(streak, "Peer win streak, boosting weight");
            peers.boost_weight();
        }
    }

    async fn http_body(&self, url: &str) -> RaceResult<ByteStream> {
        let response = self.http.get(url).await?;
        if !response.is_success() {
            return Err(RaceError::Http(format!("status {} from {}", response.status, url)));
        }
        Ok(response.body)
    }

    /// The request URL's path and query re-rooted on each mirror base.
    fn mirror_urls(&self, url: &str) -> Vec<String> {
        let Ok(parsed) = reqwest::Url::parse(url) else {
            return Vec::new();
        };
        let mut tail = parsed.path().to_string();
        if let Some(query) = parsed.query() {
            tail.push('?');
            tail.push_str(query);
        }
        self.config
            .mirrors
            .iter()
            .map(|base| format!("{}{}", base.trim_end_matches('/'), tail))
            .collect()
    }

    async fn first_mirror(
        &self,
        url: &str,
        urls: &[String],
    ) -> RaceResult<(usize, ByteStream)> {
        for (index, mirror) in urls.iter().enumerate() {
            match self.http_body(mirror).await {
                Ok(body) => {
                    tracing::debug!(mirror = %mirror, "Mirror responded");
                    return Ok((index, body));
                }
                Err(e) => tracing::debug!(mirror = %mirror, error = %e, "Mirror failed"),
            }
        }
        tracing::warn!(url, mirrors = urls.len(), "Asset unavailable from every source");
        Err(RaceError::NotFound {
            url: url.to_string(),
        })
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

/// Why a stream could not be written out.
enum WriteFailure {
    /// The delivery broke or failed verification.
    Source(RaceError),
    /// The local file could not be written.
    Sink(io::Error),
}

async fn write_stream<S>(stream: &mut S, path: &Path) -> Result<u64, WriteFailure>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    let mut file = tokio::fs::File::create(path).await.map_err(WriteFailure::Sink)?;
    let mut bytes = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| WriteFailure::Source(e.into()))?;
        file.write_all(&chunk).await.map_err(WriteFailure::Sink)?;
        bytes += chunk.len() as u64;
    }
    file.flush().await.map_err(WriteFailure::Sink)?;
    file.sync_all().await.map_err(WriteFailure::Sink)?;
    Ok(bytes)
}
