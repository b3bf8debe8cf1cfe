//! Self health checks and the upload ceiling.
//!
//! Every health interval the engine samples the speed of each active upload.
//! When at least three peers are pulling from us and every one of them is
//! slow, the fault is most likely on our side of the link, so we record a
//! self-strike. Three self-strikes isolate the node: it stops announcing for
//! an hour and only downloads.

use std::time::{Duration, Instant};

use crate::config::ISOLATION_DURATION;
use crate::system::SystemTier;

/// Upload speed below which an uploader counts as slow, bytes/s.
pub const SLOW_UPLOAD_BPS: f64 = 125_000.0;

/// Upload speed above which any uploader proves the link healthy, bytes/s.
pub const FAST_UPLOAD_BPS: f64 = 500_000.0;

/// Concurrent uploaders needed for a verdict.
pub const MIN_UPLOADERS_FOR_VERDICT: usize = 3;

/// Self-strikes that trigger isolation.
pub const SELF_STRIKES_TO_ISOLATE: u32 = 3;

/// Default upload ceiling, bytes/s.
pub const BASELINE_UPLOAD_CEILING: u64 = 2 * 1024 * 1024;

/// Upload ceiling on idle high-tier machines with fast downlinks, bytes/s.
pub const BOOSTED_UPLOAD_CEILING: u64 = 8 * 1024 * 1024;

/// Download throughput that unlocks the boosted ceiling, bytes/s.
pub const BOOST_DOWNLOAD_THRESHOLD: f64 = 10.0 * 1024.0 * 1024.0;

/// Load per core below which the boosted ceiling is allowed.
pub const BOOST_MAX_LOAD_PER_CORE: f64 = 0.7;

/// Outcome of one health evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    /// Too few uploaders to judge; the self-strike count is unchanged.
    Inconclusive,
    /// Uploads look fine; the self-strike count is reset.
    Healthy,
    /// Every uploader was slow; the node now holds this many self-strikes.
    SelfStrike(u32),
    /// Threshold reached; the node is isolated until the instant.
    Isolate(Instant),
}

/// Tracks self-strikes and the isolation window.
#[derive(Debug)]
pub struct HealthMonitor {
    self_strikes: u32,
    isolated_until: Option<Instant>,
    isolation: Duration,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(ISOLATION_DURATION)
    }
}

impl HealthMonitor {
    pub fn new(isolation: Duration) -> Self {
        Self {
            self_strikes: 0,
            isolated_until: None,
            isolation,
        }
    }

    /// Evaluate one window of per-upload speeds in bytes/s.
    pub fn evaluate(&mut self, upload_speeds: &[f64], now: Instant) -> HealthVerdict {
        if self.is_isolated(now) || upload_speeds.len() < MIN_UPLOADERS_FOR_VERDICT {
            return HealthVerdict::Inconclusive;
        }

        let all_slow = upload_speeds.iter().all(|s| *s < SLOW_UPLOAD_BPS);
        let any_fast = upload_speeds.iter().any(|s| *s > FAST_UPLOAD_BPS);

        if !all_slow || any_fast {
            self.self_strikes = 0;
            return HealthVerdict::Healthy;
        }

        self.self_strikes += 1;
        if self.self_strikes >= SELF_STRIKES_TO_ISOLATE {
            self.self_strikes = 0;
            let until = now + self.isolation;
            self.isolated_until = Some(until);
            HealthVerdict::Isolate(until)
        } else {
            HealthVerdict::SelfStrike(self.self_strikes)
        }
    }

    pub fn self_strikes(&self) -> u32 {
        self.self_strikes
    }

    pub fn is_isolated(&self, now: Instant) -> bool {
        matches!(self.isolated_until, Some(until) if until > now)
    }

    /// Returns `true` exactly once, when an isolation window has ended.
    pub fn take_expired_isolation(&mut self, now: Instant) -> bool {
        match self.isolated_until {
            Some(until) if until <= now => {
                self.isolated_until = None;
                true
            }
            _ => false,
        }
    }
}

/// Upload ceiling for the current conditions, in bytes/s.
pub fn upload_ceiling(tier: SystemTier, download_bps: f64, load_average: f64, cores: usize) -> u64 {
    let load_per_core = load_average / cores.max(1) as f64;
    if tier == SystemTier::High
        && download_bps > BOOST_DOWNLOAD_THRESHOLD
        && load_per_core < BOOST_MAX_LOAD_PER_CORE
    {
        BOOSTED_UPLOAD_CEILING
    } else {
        BASELINE_UPLOAD_CEILING
    }
}
