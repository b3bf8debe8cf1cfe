//! Persistent peer cache.
//!
//! Peers that served us well are remembered across runs so a restart can
//! dial them before any other discovery result arrives. The file is a sealed
//! blob (see [`swarmfetch_core::seal`]) holding a JSON document with one list
//! per scope. Loading never fails: a missing, corrupt or foreign file is
//! treated as empty.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use swarmfetch_core::{open_sealed, seal};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{P2pError, P2pResult};

/// Version of the cache document.
pub const CACHE_VERSION: u32 = 1;

/// Records kept per scope.
pub const MAX_RECORDS_PER_SCOPE: usize = 100;

/// Records not seen for this long are dropped.
pub const RECORD_MAX_AGE: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// Snapshots queued for the background writer.
pub const WRITER_QUEUE_DEPTH: usize = 4;

/// Which list a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerScope {
    /// Same-subnet peers.
    Local,
    /// Internet peers.
    Global,
}

/// A remembered peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedPeerRecord {
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub public_key: Option<String>,
    /// Unix seconds.
    pub last_seen: u64,
    pub score: f64,
    /// Bytes/s.
    #[serde(default)]
    pub avg_speed: f64,
}

impl PersistedPeerRecord {
    pub fn new(addr: SocketAddr, score: f64, avg_speed: f64, last_seen: u64) -> Self {
        Self {
            ip: addr.ip().to_string(),
            port: addr.port(),
            public_key: None,
            last_seen,
            score,
            avg_speed,
        }
    }

    /// Try to parse the stored address.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let ip: IpAddr = self.ip.parse().ok()?;
        Some(SocketAddr::new(ip, self.port))
    }
}

/// Cache file document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct CacheDocument {
    version: u32,
    #[serde(default)]
    local: Vec<PersistedPeerRecord>,
    #[serde(default)]
    global: Vec<PersistedPeerRecord>,
}

/// In-memory peer cache bound to a sealing key.
#[derive(Debug, Clone)]
pub struct PeerCache {
    path: PathBuf,
    key: [u8; 32],
    doc: CacheDocument,
}

/// Current wall-clock time in Unix seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl PeerCache {
    /// Create an empty cache.
    pub fn empty(path: PathBuf, key: [u8; 32]) -> Self {
        Self {
            path,
            key,
            doc: CacheDocument {
                version: CACHE_VERSION,
                ..Default::default()
            },
        }
    }

    /// Load the cache at `path`, falling back to empty on any failure.
    pub async fn load(path: PathBuf, key: [u8; 32]) -> Self {
        match Self::try_load(&path, &key).await {
            Ok(Some(doc)) => {
                tracing::info!(
                    local = doc.local.len(),
                    global = doc.global.len(),
                    path = %path.display(),
                    "Loaded peer cache"
                );
                Self { path, key, doc }
            }
            Ok(None) => Self::empty(path, key),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable peer cache");
                Self::empty(path, key)
            }
        }
    }

    async fn try_load(path: &Path, key: &[u8; 32]) -> P2pResult<Option<CacheDocument>> {
        let blob = match fs::read(path).await {
            Ok(blob) => blob,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let plaintext = open_sealed(key, &blob)?;
        let doc: CacheDocument = serde_json::from_slice(&plaintext)?;
        if doc.version != CACHE_VERSION {
            return Err(P2pError::Persistence(format!(
                "unsupported cache version {}",
                doc.version
            )));
        }
        Ok(Some(doc))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self, scope: PeerScope) -> &[PersistedPeerRecord] {
        match scope {
            PeerScope::Local => &self.doc.local,
            PeerScope::Global => &self.doc.global,
        }
    }

    fn records_mut(&mut self, scope: PeerScope) -> &mut Vec<PersistedPeerRecord> {
        match scope {
            PeerScope::Local => &mut self.doc.local,
            PeerScope::Global => &mut self.doc.global,
        }
    }

    /// Insert or refresh a record, keyed by address. A full scope evicts
    /// its lowest-scored record, which may be the new one.
    pub fn upsert(&mut self, scope: PeerScope, record: PersistedPeerRecord) {
        let records = self.records_mut(scope);
        if let Some(existing) = records
            .iter_mut()
            .find(|r| r.ip == record.ip && r.port == record.port)
        {
            *existing = record;
            return;
        }

        records.push(record);
        if records.len() > MAX_RECORDS_PER_SCOPE {
            let lowest = records
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| a.score.total_cmp(&b.score))
                .map(|(i, _)| i);
            if let Some(i) = lowest {
                records.swap_remove(i);
            }
        }
    }

    /// Every cached address, local scope first.
    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.doc
            .local
            .iter()
            .chain(self.doc.global.iter())
            .filter_map(PersistedPeerRecord::socket_addr)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.doc.local.len() + self.doc.global.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop stale records, order by score and cap each scope.
    pub fn prune(&mut self, now_secs: u64) {
        let cutoff = now_secs.saturating_sub(RECORD_MAX_AGE.as_secs());
        for scope in [PeerScope::Local, PeerScope::Global] {
            let records = self.records_mut(scope);
            records.retain(|r| r.last_seen >= cutoff);
            records.sort_by(|a, b| b.score.total_cmp(&a.score));
            records.truncate(MAX_RECORDS_PER_SCOPE);
        }
    }

    /// Prune and encode the cache into a sealed blob.
    pub fn to_sealed(&mut self, now_secs: u64) -> P2pResult<Vec<u8>> {
        self.prune(now_secs);
        let json = serde_json::to_vec(&self.doc)?;
        Ok(seal(&self.key, &json)?)
    }

    /// Write the cache now.
    pub async fn save(&mut self) -> P2pResult<()> {
        let blob = self.to_sealed(unix_now())?;
        write_atomic(&self.path, &blob).await
    }
}

/// Write `data` to a temporary sibling and rename it over `path`.
pub async fn write_atomic(path: &Path, data: &[u8]) -> P2pResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&temp_path, path).await?;
    tracing::debug!(path = %path.display(), bytes = data.len(), "Saved peer cache");
    Ok(())
}

/// Background writer for sealed cache snapshots.
///
/// Snapshots are dropped when the queue is full; a later save carries the
/// same information.
#[derive(Debug)]
pub struct PersistenceWriter {
    tx: mpsc::Sender<Vec<u8>>,
    handle: JoinHandle<()>,
}

impl PersistenceWriter {
    pub fn spawn(path: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(WRITER_QUEUE_DEPTH);
        let handle = tokio::spawn(async move {
            while let Some(blob) = rx.recv().await {
                if let Err(e) = write_atomic(&path, &blob).await {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to write peer cache");
                }
            }
        });
        Self { tx, handle }
    }

    /// Queue a snapshot. Returns `false` if it was dropped.
    pub fn submit(&self, blob: Vec<u8>) -> bool {
        match self.tx.try_send(blob) {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!("Peer cache writer busy, snapshot dropped");
                false
            }
        }
    }

    /// Queue `blob` behind any pending snapshots, waiting for room, then
    /// close. The file ends up holding `blob`.
    pub async fn finish(self, blob: Vec<u8>) {
        if self.tx.send(blob).await.is_err() {
            tracing::warn!("Peer cache writer exited, final snapshot lost");
        }
        self.close().await;
    }

    /// Stop accepting snapshots and wait for queued ones to be written.
    pub async fn close(self) {
        drop(self.tx);
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const KEY: [u8; 32] = [7u8; 32];

    fn record(last: u8, score: f64, last_seen: u64) -> PersistedPeerRecord {
        PersistedPeerRecord::new(
            SocketAddr::from(([10, 0, 0, last], 47821)),
            score,
            1_000.0,
            last_seen,
        )
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("peers.dat");
        let now = unix_now();

        let mut cache = PeerCache::empty(path.clone(), KEY);
        cache.upsert(PeerScope::Local, record(1, 5.0, now));
        cache.upsert(PeerScope::Global, record(2, 3.0, now));
        cache.save().await.unwrap();

        let loaded = PeerCache::load(path, KEY).await;
        assert_eq!(loaded.records(PeerScope::Local).len(), 1);
        assert_eq!(loaded.records(PeerScope::Global).len(), 1);
        assert_eq!(
            loaded.addresses()[0],
            SocketAddr::from(([10, 0, 0, 1], 47821))
        );
    }

    #[tokio::test]
    async fn test_file_is_sealed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("peers.dat");

        let mut cache = PeerCache::empty(path.clone(), KEY);
        cache.upsert(PeerScope::Global, record(9, 1.0, unix_now()));
        cache.save().await.unwrap();

        let raw = std::fs::read(&path).unwrap();
        assert_eq!(&raw[..4], b"SWPC");
        assert!(!String::from_utf8_lossy(&raw).contains("10.0.0.9"));
    }

    #[tokio::test]
    async fn test_wrong_key_loads_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("peers.dat");

        let mut cache = PeerCache::empty(path.clone(), KEY);
        cache.upsert(PeerScope::Global, record(1, 1.0, unix_now()));
        cache.save().await.unwrap();

        let other = PeerCache::load(path, [8u8; 32]).await;
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_and_missing_load_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("peers.dat");
        assert!(PeerCache::load(path.clone(), KEY).await.is_empty());

        std::fs::write(&path, b"garbage").unwrap();
        assert!(PeerCache::load(path, KEY).await.is_empty());
    }

    #[test]
    fn test_prune_age_and_order() {
        let now = 10 * RECORD_MAX_AGE.as_secs();
        let mut cache = PeerCache::empty(PathBuf::from("unused"), KEY);

        cache.upsert(PeerScope::Global, record(1, 1000.0, now - RECORD_MAX_AGE.as_secs() - 1));
        for i in 0..MAX_RECORDS_PER_SCOPE as u32 {
            let addr = SocketAddr::from(([10, 1, 0, i as u8], 47821));
            cache.upsert(
                PeerScope::Global,
                PersistedPeerRecord::new(addr, i as f64, 0.0, now),
            );
        }

        cache.prune(now);
        let records = cache.records(PeerScope::Global);
        assert_eq!(records.len(), MAX_RECORDS_PER_SCOPE - 1);
        assert_eq!(records[0].score, (MAX_RECORDS_PER_SCOPE - 1) as f64);
        assert!(records.iter().all(|r| r.ip != "10.0.0.1"));
        assert!(records.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_upsert_caps_scope_by_score() {
        let mut cache = PeerCache::empty(PathBuf::from("unused"), KEY);
        for i in 0..MAX_RECORDS_PER_SCOPE as u32 {
            let addr = SocketAddr::from(([10, 2, 0, i as u8], 47821));
            cache.upsert(PeerScope::Global, PersistedPeerRecord::new(addr, 10.0 + i as f64, 0.0, 1));
        }
        assert_eq!(cache.records(PeerScope::Global).len(), MAX_RECORDS_PER_SCOPE);

        // A weaker newcomer is not kept
        cache.upsert(PeerScope::Global, record(1, 1.0, 1));
        let records = cache.records(PeerScope::Global);
        assert_eq!(records.len(), MAX_RECORDS_PER_SCOPE);
        assert!(records.iter().all(|r| r.ip != "10.0.0.1"));

        // A stronger one displaces the lowest score
        cache.upsert(PeerScope::Global, record(2, 500.0, 1));
        let records = cache.records(PeerScope::Global);
        assert_eq!(records.len(), MAX_RECORDS_PER_SCOPE);
        assert!(records.iter().any(|r| r.ip == "10.0.0.2"));
        assert!(records.iter().all(|r| r.score > 10.0));

        // The other scope is unaffected
        cache.upsert(PeerScope::Local, record(3, 0.5, 1));
        assert_eq!(cache.records(PeerScope::Local).len(), 1);
    }

    #[test]
    fn test_upsert_replaces_same_address() {
        let mut cache = PeerCache::empty(PathBuf::from("unused"), KEY);
        cache.upsert(PeerScope::Local, record(1, 1.0, 1));
        cache.upsert(PeerScope::Local, record(1, 2.0, 2));

        let records = cache.records(PeerScope::Local);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].score, 2.0);
    }

    #[tokio::test]
    async fn test_writer_persists_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("peers.dat");

        let mut cache = PeerCache::empty(path.clone(), KEY);
        cache.upsert(PeerScope::Local, record(3, 1.0, unix_now()));
        let blob = cache.to_sealed(unix_now()).unwrap();

        let writer = PersistenceWriter::spawn(path.clone());
        assert!(writer.submit(blob));
        writer.close().await;

        assert_eq!(PeerCache::load(path, KEY).await.len(), 1);
    }

    #[tokio::test]
    async fn test_writer_finish_lands_after_queued_snapshots() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("peers.dat");
        let now = unix_now();

        let mut cache = PeerCache::empty(path.clone(), KEY);
        let writer = PersistenceWriter::spawn(path.clone());
        for i in 0..WRITER_QUEUE_DEPTH as u8 {
            cache.upsert(PeerScope::Global, record(i + 1, 1.0, now));
            writer.submit(cache.to_sealed(now).unwrap());
        }

        cache.upsert(PeerScope::Local, record(200, 9.0, now));
        let final_len = cache.len();
        writer.finish(cache.to_sealed(now).unwrap()).await;

        let loaded = PeerCache::load(path.clone(), KEY).await;
        assert_eq!(loaded.len(), final_len);
        assert_eq!(loaded.records(PeerScope::Local).len(), 1);
        assert!(!path.with_extension("tmp").exists());
    }
}
