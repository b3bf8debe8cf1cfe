//! Active upload accounting.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::peer::PeerId;
use crate::protocol::reasons;

/// An upload in progress.
#[derive(Debug, Clone)]
pub struct ActiveUpload {
    pub peer_id: PeerId,
    pub ip: IpAddr,
    pub lan: bool,
    /// Whether a credit was reserved at admission.
    pub charged: bool,
    pub started: Instant,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    peer_id: PeerId,
    bytes: u64,
    elapsed: Duration,
    at: Instant,
}

/// Upload slots, global and per IP, plus recent throughput samples.
#[derive(Debug)]
pub struct UploadBook {
    uploads: HashMap<u64, ActiveUpload>,
    per_ip: HashMap<IpAddr, usize>,
    finished: Vec<Sample>,
    next_id: u64,
    max_total: usize,
    max_per_ip: usize,
}

impl UploadBook {
    pub fn new(max_total: usize, max_per_ip: usize) -> Self {
        Self {
            uploads: HashMap::new(),
            per_ip: HashMap::new(),
            finished: Vec::new(),
            next_id: 1,
            max_total,
            max_per_ip,
        }
    }

    /// Check the global and per-IP caps for a new upload to `ip`.
    pub fn check_capacity(&self, ip: IpAddr) -> Result<(), &'static str> {
        if self.uploads.len() >= self.max_total {
            return Err(reasons::BUSY);
        }
        if self.per_ip.get(&ip).copied().unwrap_or(0) >= self.max_per_ip {
            return Err(reasons::BUSY);
        }
        Ok(())
    }

    /// Take a slot. Call [`check_capacity`](Self::check_capacity) first.
    pub fn start(&mut self, peer_id: PeerId, ip: IpAddr, lan: bool, charged: bool, now: Instant) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        *self.per_ip.entry(ip).or_insert(0) += 1;
        self.uploads.insert(
            id,
            ActiveUpload {
                peer_id,
                ip,
                lan,
                charged,
                started: now,
                bytes: 0,
            },
        );
        id
    }

    pub fn progress(&mut self, upload_id: u64, bytes: u64) {
        if let Some(upload) = self.uploads.get_mut(&upload_id) {
            upload.bytes = bytes;
        }
    }

    /// Release a slot and keep its throughput for the health window.
    pub fn finish(&mut self, upload_id: u64, bytes: u64, elapsed: Duration, now: Instant) -> Option<ActiveUpload> {
        let mut upload = self.uploads.remove(&upload_id)?;
        upload.bytes = bytes;

        if let Some(count) = self.per_ip.get_mut(&upload.ip) {
            *count -= 1;
            if *count == 0 {
                self.per_ip.remove(&upload.ip);
            }
        }
        if bytes > 0 {
            self.finished.push(Sample {
                peer_id: upload.peer_id,
                bytes,
                elapsed,
                at: now,
            });
        }
        Some(upload)
    }

    pub fn active(&self) -> usize {
        self.uploads.len()
    }

    pub fn active_for(&self, ip: &IpAddr) -> usize {
        self.per_ip.get(ip).copied().unwrap_or(0)
    }

    /// Per-peer upload speeds (bytes/s) over the last `window`.
    ///
    /// Includes running uploads that have been going for at least a second
    /// and uploads that finished inside the window. Drops older samples.
    pub fn window_speeds(&mut self, now: Instant, window: Duration) -> Vec<f64> {
        self.finished
            .retain(|s| now.saturating_duration_since(s.at) < window);

        let mut per_peer: HashMap<PeerId, (u64, Duration)> = HashMap::new();
        for sample in &self.finished {
            let entry = per_peer.entry(sample.peer_id).or_default();
            entry.0 += sample.bytes;
            entry.1 += sample.elapsed;
        }
        for upload in self.uploads.values() {
            let elapsed = now.saturating_duration_since(upload.started);
            if elapsed >= Duration::from_secs(1) {
                let entry = per_peer.entry(upload.peer_id).or_default();
                entry.0 += upload.bytes;
                entry.1 += elapsed;
            }
        }

        per_peer
            .values()
            .filter(|(_, elapsed)| !elapsed.is_zero())
            .map(|(bytes, elapsed)| *bytes as f64 / elapsed.as_secs_f64())
            .collect()
    }

    /// Forget every upload; the engine is stopping.
    pub fn clear(&mut self) {
        self.uploads.clear();
        self.per_ip.clear();
        self.finished.clear();
    }
}
