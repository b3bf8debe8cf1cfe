//! Strikes, blacklisting and the circuit breaker.
//!
//! Security violations earn the offending identity a strike. Enough strikes
//! blacklist the identity for a cooldown period; strikes otherwise decay one
//! at a time on a periodic sweep. Separately, the circuit breaker watches
//! for abuse coming from many distinct identities at once and tells the
//! engine to stop entirely.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::config::{
    BLACKLIST_COOLDOWN, CIRCUIT_BREAKER_TRIGGERS, CIRCUIT_BREAKER_WINDOW, STRIKES_TO_BLACKLIST,
    STRIKE_DECAY_INTERVAL,
};
use crate::peer::PeerIdentity;

/// Result of recording a strike.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrikeOutcome {
    /// Strike recorded; the identity now holds this many.
    Recorded(u32),
    /// Threshold reached; the identity is blacklisted until the instant.
    Blacklisted(Instant),
}

#[derive(Debug, Clone, Copy)]
struct StrikeRecord {
    count: u32,
    last_strike: Instant,
}

/// Strike counts and blacklist, keyed by identity.
#[derive(Debug)]
pub struct Reputation {
    strikes: HashMap<PeerIdentity, StrikeRecord>,
    blacklist: HashMap<PeerIdentity, Instant>,
    threshold: u32,
    cooldown: Duration,
    decay_interval: Duration,
}

impl Default for Reputation {
    fn default() -> Self {
        Self::new(STRIKES_TO_BLACKLIST, BLACKLIST_COOLDOWN, STRIKE_DECAY_INTERVAL)
    }
}

impl Reputation {
    pub fn new(threshold: u32, cooldown: Duration, decay_interval: Duration) -> Self {
        Self {
            strikes: HashMap::new(),
            blacklist: HashMap::new(),
            threshold,
            cooldown,
            decay_interval,
        }
    }

    /// Record a strike against `identity`.
    pub fn strike(&mut self, identity: &PeerIdentity, now: Instant) -> StrikeOutcome {
        let record = self
            .strikes
            .entry(identity.clone())
            .or_insert(StrikeRecord {
                count: 0,
                last_strike: now,
            });
        record.count += 1;
        record.last_strike = now;

        if record.count >= self.threshold {
            self.strikes.remove(identity);
            let until = now + self.cooldown;
            self.blacklist.insert(identity.clone(), until);
            StrikeOutcome::Blacklisted(until)
        } else {
            StrikeOutcome::Recorded(record.count)
        }
    }

    /// Current strikes held by `identity`.
    pub fn strikes(&self, identity: &PeerIdentity) -> u32 {
        self.strikes.get(identity).map(|r| r.count).unwrap_or(0)
    }

    /// Check whether `identity` is blacklisted, expiring stale entries.
    pub fn is_blacklisted(&mut self, identity: &PeerIdentity, now: Instant) -> bool {
        match self.blacklist.get(identity) {
            Some(until) if *until > now => true,
            Some(_) => {
                self.blacklist.remove(identity);
                false
            }
            None => false,
        }
    }

    /// Periodic sweep: drop one strike from identities that have been quiet
    /// for a full decay interval and expire finished cooldowns.
    pub fn decay(&mut self, now: Instant) {
        let interval = self.decay_interval;
        self.strikes.retain(|_, record| {
            if now.saturating_duration_since(record.last_strike) >= interval {
                record.count = record.count.saturating_sub(1);
                record.last_strike = now;
            }
            record.count > 0
        });
        self.blacklist.retain(|_, until| *until > now);
    }

    /// Number of identities currently blacklisted.
    pub fn blacklisted_count(&self) -> usize {
        self.blacklist.len()
    }
}

/// Trips when enough distinct identities misbehave within a window.
#[derive(Debug)]
pub struct CircuitBreaker {
    events: VecDeque<(Instant, PeerIdentity)>,
    threshold: usize,
    window: Duration,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CIRCUIT_BREAKER_TRIGGERS, CIRCUIT_BREAKER_WINDOW)
    }
}

impl CircuitBreaker {
    pub fn new(threshold: usize, window: Duration) -> Self {
        Self {
            events: VecDeque::new(),
            threshold,
            window,
        }
    }

    /// Record an abuse trigger. Returns `true` when the breaker trips.
    pub fn record(&mut self, identity: &PeerIdentity, now: Instant) -> bool {
        while let Some((at, _)) = self.events.front() {
            if now.saturating_duration_since(*at) > self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
        self.events.push_back((now, identity.clone()));

        let distinct: HashSet<&PeerIdentity> = self.events.iter().map(|(_, id)| id).collect();
        distinct.len() >= self.threshold
    }

    /// Forget all triggers.
    pub fn reset(&mut self) {
        self.events.clear();
    }
}
