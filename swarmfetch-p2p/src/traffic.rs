//! Local download activity.
//!
//! While the user is downloading, uploads to peers are refused with
//! "Owner Busy" so the local transfer gets the full link. Races hold a
//! [`DownloadActivity`] guard for their lifetime.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared busy flag and download byte counter.
#[derive(Debug, Default)]
pub struct TrafficState {
    active: AtomicUsize,
    downloaded: AtomicU64,
}

impl TrafficState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark a download as active until the guard is dropped.
    pub fn begin_download(self: &Arc<Self>) -> DownloadActivity {
        self.active.fetch_add(1, Ordering::SeqCst);
        DownloadActivity {
            state: Arc::clone(self),
        }
    }

    /// Whether any local download is active.
    pub fn is_busy(&self) -> bool {
        self.active() > 0
    }

    /// Number of active local downloads.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Add to the downloaded byte counter.
    pub fn record_download(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Read and reset the downloaded byte counter.
    pub fn take_downloaded(&self) -> u64 {
        self.downloaded.swap(0, Ordering::Relaxed)
    }
}

/// RAII guard for one active download.
#[derive(Debug)]
pub struct DownloadActivity {
    state: Arc<TrafficState>,
}

impl Drop for DownloadActivity {
    fn drop(&mut self) {
        self.state.active.fetch_sub(1, Ordering::SeqCst);
    }
}
