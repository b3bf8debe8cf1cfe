//! Per-IP fair-usage credits.
//!
//! Each requesting IP holds a token bucket of credits denominated in MiB.
//! Buckets regenerate continuously up to a maximum. The table is an LRU so
//! a flood of new addresses evicts the least recently seen entries instead
//! of growing without bound.

use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

/// Hard cap on tracked IPs.
pub const MAX_TRACKED_IPS: usize = 10_000;

/// Bucket capacity, in MiB credits.
pub const MAX_CREDITS: f64 = 2048.0;

/// Regeneration rate, credits per second.
pub const CREDITS_PER_SEC: f64 = 2.0;

/// Entries untouched for this long are purged.
pub const IDLE_TTL: Duration = Duration::from_secs(2 * 60 * 60);

const MIB: u64 = 1024 * 1024;

/// Credit cost of serving `bytes`.
pub fn cost_for(bytes: u64) -> u32 {
    let mib = bytes.div_ceil(MIB);
    u32::try_from(mib.max(1)).unwrap_or(u32::MAX)
}

/// One IP's bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CreditLedgerEntry {
    pub credits: f64,
    pub last_update: Instant,
}

/// LRU table of credit buckets.
#[derive(Debug)]
pub struct UsageTracker {
    entries: LruCache<IpAddr, CreditLedgerEntry>,
    max_credits: f64,
    regen_per_sec: f64,
}

impl Default for UsageTracker {
    fn default() -> Self {
        Self::new(MAX_TRACKED_IPS, MAX_CREDITS, CREDITS_PER_SEC)
    }
}

impl UsageTracker {
    pub fn new(capacity: usize, max_credits: f64, regen_per_sec: f64) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            max_credits,
            regen_per_sec,
        }
    }

    /// Bring the entry for `ip` up to date, creating it at half capacity.
    fn refresh(&mut self, ip: IpAddr, now: Instant) -> &mut CreditLedgerEntry {
        let max = self.max_credits;
        let regen = self.regen_per_sec;

        let entry = self
            .entries
            .get_or_insert_mut(ip, || CreditLedgerEntry {
                credits: max / 2.0,
                last_update: now,
            });
        let elapsed = now.saturating_duration_since(entry.last_update).as_secs_f64();
        entry.credits = (entry.credits + elapsed * regen).clamp(0.0, max);
        entry.last_update = now;
        entry
    }

    /// Deduct `cost` if the bucket holds enough. Returns whether it did.
    pub fn reserve(&mut self, ip: IpAddr, cost: u32, now: Instant) -> bool {
        let entry = self.refresh(ip, now);
        if entry.credits >= cost as f64 {
            entry.credits -= cost as f64;
            true
        } else {
            false
        }
    }

    /// Deduct `cost` unconditionally, flooring at zero.
    pub fn consume(&mut self, ip: IpAddr, cost: u32, now: Instant) {
        let entry = self.refresh(ip, now);
        entry.credits = (entry.credits - cost as f64).max(0.0);
    }

    /// Return `cost` to the bucket, capped at the maximum.
    pub fn refund(&mut self, ip: IpAddr, cost: u32, now: Instant) {
        let max = self.max_credits;
        let entry = self.refresh(ip, now);
        entry.credits = (entry.credits + cost as f64).min(max);
    }

    /// Current credits for `ip`.
    pub fn credits(&mut self, ip: IpAddr, now: Instant) -> f64 {
        self.refresh(ip, now).credits
    }

    /// Drop entries untouched for [`IDLE_TTL`]. Returns how many were removed.
    pub fn purge_idle(&mut self, now: Instant) -> usize {
        let stale: Vec<IpAddr> = self
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.last_update) >= IDLE_TTL)
            .map(|(ip, _)| *ip)
            .collect();
        for ip in &stale {
            self.entries.pop(ip);
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(198, 51, 100, last))
    }

    #[test]
    fn test_cost_for() {
        assert_eq!(cost_for(0), 1);
        assert_eq!(cost_for(1), 1);
        assert_eq!(cost_for(MIB), 1);
        assert_eq!(cost_for(MIB + 1), 2);
        assert_eq!(cost_for(10 * MIB), 10);
    }

    #[test]
    fn test_new_entry_starts_half_full() {
        let mut usage = UsageTracker::new(10, 100.0, 1.0);
        let now = Instant::now();
        assert_eq!(usage.credits(ip(1), now), 50.0);
    }

    #[test]
    fn test_reserve_and_refund() {
        let mut usage = UsageTracker::new(10, 100.0, 0.0);
        let now = Instant::now();

        assert!(usage.reserve(ip(1), 30, now));
        assert!(usage.reserve(ip(1), 20, now));
        assert!(!usage.reserve(ip(1), 1, now));

        usage.refund(ip(1), 500, now);
        assert_eq!(usage.credits(ip(1), now), 100.0);

        usage.consume(ip(1), 500, now);
        assert_eq!(usage.credits(ip(1), now), 0.0);
    }

    #[test]
    fn test_regeneration_clamped() {
        let mut usage = UsageTracker::new(10, 100.0, 10.0);
        let now = Instant::now();
        usage.consume(ip(1), 50, now);

        assert_eq!(usage.credits(ip(1), now + Duration::from_secs(3)), 30.0);
        assert_eq!(usage.credits(ip(1), now + Duration::from_secs(3600)), 100.0);
    }

    #[test]
    fn test_credits_stay_in_range() {
        let mut usage = UsageTracker::new(10, 64.0, 3.0);
        let mut now = Instant::now();
        for step in 0..200u32 {
            let addr = ip((step % 4) as u8);
            match step % 3 {
                0 => {
                    usage.reserve(addr, step % 40, now);
                }
                1 => usage.consume(addr, step % 70, now),
                _ => usage.refund(addr, step % 90, now),
            }
            now += Duration::from_millis(250 * (step % 7) as u64);
            let credits = usage.credits(addr, now);
            assert!((0.0..=64.0).contains(&credits), "credits out of range: {}", credits);
        }
    }

    #[test]
    fn test_lru_cap_and_purge() {
        let mut usage = UsageTracker::new(3, 100.0, 1.0);
        let now = Instant::now();
        for last in 0..5 {
            usage.credits(ip(last), now);
        }
        assert_eq!(usage.len(), 3);

        let later = now + IDLE_TTL;
        usage.credits(ip(9), later);
        assert_eq!(usage.purge_idle(later), 2);
        assert_eq!(usage.len(), 1);
    }
}
