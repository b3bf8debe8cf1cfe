//! Race manager tests against mock HTTP and peer sources.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};

use swarmfetch_core::{integrity_error, ByteStream, ContentHash, HashAlgorithm, StreamingHasher};
use swarmfetch_p2p::{P2pError, TrafficState};
use swarmfetch_race::{
    AssetRequest, Delivery, DeliverySource, HttpClient, HttpResponse, PeerSource, RaceConfig,
    RaceError, RaceManager, RaceResult,
};

const ASSET: &[u8] = b"the quick brown fox jumps over the lazy dog";

fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = StreamingHasher::new(HashAlgorithm::Sha1);
    hasher.update(data);
    hasher.finalize_hex()
}

fn asset_url() -> String {
    format!("https://origin.example/objects/{}", sha1_hex(ASSET))
}

fn body(data: &[u8]) -> ByteStream {
    let mid = data.len() / 2;
    let chunks = vec![
        Ok(Bytes::copy_from_slice(&data[..mid])),
        Ok(Bytes::copy_from_slice(&data[mid..])),
    ];
    Box::pin(stream::iter(chunks))
}

#[derive(Default)]
struct MockHttp {
    responses: HashMap<String, (u16, Vec<u8>)>,
    delay: Duration,
    requests: Mutex<Vec<String>>,
}

impl MockHttp {
    fn with(mut self, url: &str, status: u16, data: &[u8]) -> Self {
        self.responses.insert(url.to_string(), (status, data.to_vec()));
        self
    }

    fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn requested(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpClient for MockHttp {
    async fn get(&self, url: &str) -> RaceResult<HttpResponse> {
        self.requests.lock().unwrap().push(url.to_string());
        tokio::time::sleep(self.delay).await;
        match self.responses.get(url) {
            Some((status, data)) => Ok(HttpResponse {
                status: *status,
                body: body(data),
            }),
            None => Err(RaceError::Http(format!("connection refused: {url}"))),
        }
    }
}

fn broken_body(data: &[u8], after: usize) -> ByteStream {
    let chunks = vec![
        Ok(Bytes::copy_from_slice(&data[..after])),
        Err(io::Error::new(io::ErrorKind::Other, "peer disconnected mid-transfer")),
    ];
    Box::pin(stream::iter(chunks))
}

struct MockPeers {
    data: Vec<u8>,
    delay: Duration,
    break_after: Option<usize>,
    failing: AtomicBool,
    calls: AtomicUsize,
    boosts: AtomicUsize,
}

impl MockPeers {
    fn serving(data: &[u8], delay: Duration) -> Self {
        Self {
            data: data.to_vec(),
            delay,
            break_after: None,
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            boosts: AtomicUsize::new(0),
        }
    }

    fn breaking(data: &[u8], after: usize) -> Self {
        let mut peers = Self::serving(data, Duration::ZERO);
        peers.break_after = Some(after);
        peers
    }

    fn failing() -> Self {
        let peers = Self::serving(b"", Duration::ZERO);
        peers.failing.store(true, Ordering::SeqCst);
        peers
    }
}

#[async_trait]
impl PeerSource for MockPeers {
    async fn request_file(&self, _hash: &ContentHash, _size: u64) -> Result<ByteStream, P2pError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.failing.load(Ordering::SeqCst) {
            return Err(P2pError::NoPeers);
        }
        match self.break_after {
            Some(after) => Ok(broken_body(&self.data, after)),
            None => Ok(body(&self.data)),
        }
    }

    fn boost_weight(&self) {
        self.boosts.fetch_add(1, Ordering::SeqCst);
    }
}

fn manager(http: Arc<MockHttp>, peers: Option<Arc<MockPeers>>, mirrors: &[&str]) -> RaceManager {
    let config = RaceConfig::default().with_mirrors(mirrors.iter().map(|m| m.to_string()).collect());
    let manager = RaceManager::new(config, http, TrafficState::new());
    match peers {
        Some(peers) => manager.with_peers(peers),
        None => manager,
    }
}

async fn collect(mut delivery: Delivery) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = delivery.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

fn sized(url: &str) -> AssetRequest {
    AssetRequest::new(url, Some(ASSET.len() as u64))
}

#[tokio::test]
async fn test_url_without_hash_skips_peers() {
    let url = "https://cdn.example/files/readme.txt";
    let http = Arc::new(MockHttp::default().with(url, 200, ASSET));
    let peers = Arc::new(MockPeers::serving(ASSET, Duration::ZERO));
    let m = manager(http, Some(peers.clone()), &[]);

    let delivery = m.fetch(&sized(url)).await.unwrap();
    assert_eq!(delivery.source(), DeliverySource::Direct);
    assert!(delivery.hash().is_none());
    assert_eq!(collect(delivery).await.unwrap(), ASSET);
    assert_eq!(peers.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unknown_size_skips_peers_but_verifies() {
    let url = asset_url();
    let http = Arc::new(MockHttp::default().with(&url, 200, b"tampered"));
    let peers = Arc::new(MockPeers::serving(ASSET, Duration::ZERO));
    let m = manager(http, Some(peers.clone()), &[]);

    let delivery = m.fetch(&AssetRequest::new(&url, None)).await.unwrap();
    assert_eq!(delivery.source(), DeliverySource::Direct);
    let err = collect(delivery).await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    assert_eq!(peers.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_faster_peer_wins() {
    let url = asset_url();
    let http = Arc::new(
        MockHttp::default()
            .with(&url, 200, ASSET)
            .delayed(Duration::from_millis(300)),
    );
    let peers = Arc::new(MockPeers::serving(ASSET, Duration::ZERO));
    let m = manager(http, Some(peers.clone()), &[]);

    let delivery = m.fetch(&sized(&url)).await.unwrap();
    assert_eq!(delivery.source(), DeliverySource::Peer);
    assert_eq!(collect(delivery).await.unwrap(), ASSET);
    assert_eq!(m.p2p_streak(), 1);
}

#[tokio::test]
async fn test_http_win_resets_streak() {
    let url = asset_url();
    let http = Arc::new(
        MockHttp::default()
            .with(&url, 200, ASSET)
            .delayed(Duration::from_millis(100)),
    );
    let peers = Arc::new(MockPeers::serving(ASSET, Duration::ZERO));
    let m = manager(http, Some(peers.clone()), &[]);

    for _ in 0..3 {
        collect(m.fetch(&sized(&url)).await.unwrap()).await.unwrap();
    }
    assert_eq!(m.p2p_streak(), 3);

    peers.failing.store(true, Ordering::SeqCst);
    let delivery = m.fetch(&sized(&url)).await.unwrap();
    assert_eq!(delivery.source(), DeliverySource::Http);
    assert_eq!(m.p2p_streak(), 0);
}

#[tokio::test]
async fn test_peer_streak_boosts_weight() {
    let url = asset_url();
    let http = Arc::new(
        MockHttp::default()
            .with(&url, 200, ASSET)
            .delayed(Duration::from_millis(200)),
    );
    let peers = Arc::new(MockPeers::serving(ASSET, Duration::ZERO));
    let m = manager(http, Some(peers.clone()), &[]);

    for _ in 0..10 {
        let delivery = m.fetch(&sized(&url)).await.unwrap();
        assert_eq!(delivery.source(), DeliverySource::Peer);
    }
    assert_eq!(peers.boosts.load(Ordering::SeqCst), 1);
    assert_eq!(m.p2p_streak(), 0);
}

#[tokio::test]
async fn test_corrupt_peer_stream_fails_verification() {
    let url = asset_url();
    let http = Arc::new(
        MockHttp::default()
            .with(&url, 200, ASSET)
            .delayed(Duration::from_millis(300)),
    );
    let peers = Arc::new(MockPeers::serving(b"not the asset at all", Duration::ZERO));
    let m = manager(http, Some(peers), &[]);

    let delivery = m.fetch(&sized(&url)).await.unwrap();
    assert_eq!(delivery.source(), DeliverySource::Peer);

    let err = collect(delivery).await.unwrap_err();
    let integrity = integrity_error(&err).expect("integrity error");
    assert_eq!(integrity.expected, sha1_hex(ASSET));
}

#[tokio::test]
async fn test_both_sides_fail_falls_back_to_mirrors() {
    let url = asset_url();
    let hash = sha1_hex(ASSET);
    let mirror_a = format!("https://a.example/objects/{hash}");
    let mirror_b = format!("https://b.example/pub/objects/{hash}");
    let http = Arc::new(
        MockHttp::default()
            .with(&url, 404, b"")
            .with(&mirror_a, 500, b"")
            .with(&mirror_b, 200, ASSET),
    );
    let m = manager(
        http.clone(),
        Some(Arc::new(MockPeers::failing())),
        &["https://a.example", "https://b.example/pub/"],
    );

    let delivery = m.fetch(&sized(&url)).await.unwrap();
    assert_eq!(delivery.source(), DeliverySource::Mirror(1));
    assert_eq!(collect(delivery).await.unwrap(), ASSET);
    assert_eq!(http.requested(), vec![url, mirror_a, mirror_b]);
}

#[tokio::test]
async fn test_all_sources_fail() {
    let url = asset_url();
    let http = Arc::new(MockHttp::default().with(&url, 503, b""));
    let m = manager(http, Some(Arc::new(MockPeers::failing())), &["https://a.example"]);

    let err = m.fetch(&sized(&url)).await.unwrap_err();
    assert!(matches!(err, RaceError::NotFound { url: u } if u == url));
}

#[tokio::test]
async fn test_download_retries_corrupt_delivery_on_mirror() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("assets").join("fox.txt");

    let url = asset_url();
    let mirror = format!("https://a.example/objects/{}", sha1_hex(ASSET));
    let http = Arc::new(
        MockHttp::default()
            .with(&url, 200, b"stale copy at the origin")
            .with(&mirror, 200, ASSET)
            .delayed(Duration::from_millis(200)),
    );
    let peers = Arc::new(MockPeers::serving(b"corrupted by a peer", Duration::ZERO));
    let m = manager(http, Some(peers), &["https://a.example"]);

    let downloaded = m.download(&sized(&url), &dest).await.unwrap();
    assert_eq!(downloaded.source, DeliverySource::Mirror(0));
    assert_eq!(downloaded.bytes, ASSET.len() as u64);
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), ASSET);
    assert!(!dir.path().join("assets").join("fox.txt.part").exists());
    assert_eq!(m.active_races(), 0);
}

#[tokio::test]
async fn test_download_without_mirrors_reports_integrity() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("fox.txt");

    let url = asset_url();
    let http = Arc::new(MockHttp::default().with(&url, 200, b"wrong bytes"));
    let m = manager(http, None, &[]);

    let err = m.download(&sized(&url), &dest).await.unwrap_err();
    assert!(err.is_integrity());
    assert!(!dest.exists());
    assert!(!dir.path().join("fox.txt.part").exists());
}

#[tokio::test]
async fn test_active_races_follow_deliveries() {
    let url = asset_url();
    let http = Arc::new(MockHttp::default().with(&url, 200, ASSET));
    let m = manager(http, None, &[]);

    let first = m.fetch(&sized(&url)).await.unwrap();
    let second = m.fetch(&sized(&url)).await.unwrap();
    assert_eq!(m.active_races(), 2);

    drop(first);
    assert_eq!(m.active_races(), 1);
    collect(second).await.unwrap();
    assert_eq!(m.active_races(), 0);
}

#[tokio::test]
async fn test_corrupt_peer_delivery_refetches_origin() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("fox.txt");

    let url = asset_url();
    let http = Arc::new(
        MockHttp::default()
            .with(&url, 200, ASSET)
            .delayed(Duration::from_millis(200)),
    );
    let peers = Arc::new(MockPeers::serving(b"corrupted by a peer", Duration::ZERO));
    let m = manager(http.clone(), Some(peers), &[]);

    let downloaded = m.download(&sized(&url), &dest).await.unwrap();
    assert_eq!(downloaded.source, DeliverySource::Http);
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), ASSET);
    assert_eq!(http.requested(), vec![url.clone(), url]);
}

#[tokio::test]
async fn test_peer_disconnect_mid_stream_falls_back_to_http() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("fox.txt");

    let url = asset_url();
    let mirror = format!("https://a.example/objects/{}", sha1_hex(ASSET));
    let http = Arc::new(
        MockHttp::default()
            .with(&url, 200, ASSET)
            .with(&mirror, 200, ASSET)
            .delayed(Duration::from_millis(200)),
    );
    let peers = Arc::new(MockPeers::breaking(ASSET, 5));
    let m = manager(http.clone(), Some(peers), &["https://a.example"]);

    let downloaded = m.download(&sized(&url), &dest).await.unwrap();
    assert_eq!(downloaded.source, DeliverySource::Http);
    assert_eq!(downloaded.bytes, ASSET.len() as u64);
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), ASSET);
    assert!(!dir.path().join("fox.txt.part").exists());
    assert_eq!(m.active_races(), 0);
}

#[tokio::test]
async fn test_broken_peer_stream_with_dead_fallbacks_reports_stream_error() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("fox.txt");

    let url = asset_url();
    let http = Arc::new(
        MockHttp::default()
            .with(&url, 503, b"")
            .delayed(Duration::from_millis(100)),
    );
    let peers = Arc::new(MockPeers::breaking(ASSET, 5));
    let m = manager(http, Some(peers), &[]);

    let err = m.download(&sized(&url), &dest).await.unwrap_err();
    assert!(matches!(err, RaceError::Io(ref e) if e.kind() == io::ErrorKind::Other));
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_http_bytes_count_toward_download_traffic() {
    let url = asset_url();
    let http = Arc::new(MockHttp::default().with(&url, 200, ASSET));
    let traffic = TrafficState::new();
    let m = RaceManager::new(RaceConfig::default(), http, traffic.clone());

    collect(m.fetch(&sized(&url)).await.unwrap()).await.unwrap();
    assert_eq!(traffic.take_downloaded(), ASSET.len() as u64);
}

#[tokio::test]
async fn test_peer_bytes_are_left_to_the_engine() {
    let url = asset_url();
    let http = Arc::new(
        MockHttp::default()
            .with(&url, 200, ASSET)
            .delayed(Duration::from_millis(300)),
    );
    let traffic = TrafficState::new();
    let peers = Arc::new(MockPeers::serving(ASSET, Duration::ZERO));
    let m = RaceManager::new(RaceConfig::default(), http, traffic.clone()).with_peers(peers);

    let delivery = m.fetch(&sized(&url)).await.unwrap();
    assert_eq!(delivery.source(), DeliverySource::Peer);
    collect(delivery).await.unwrap();
    assert_eq!(traffic.take_downloaded(), 0);
}
