//! Peer discovery.
//!
//! This module provides:
//! - The routing table of dial candidates
//! - LAN beacons for same-subnet discovery
//! - The sealed peer cache used to pre-warm the table on start

pub mod beacon;
pub mod persistence;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

pub use beacon::{BeaconConfig, BeaconPacket, LanBeacon};
pub use persistence::{
    unix_now, write_atomic, PeerCache, PeerScope, PersistedPeerRecord, PersistenceWriter,
};

/// Failed dials after which a non-bootstrap candidate is forgotten.
pub const MAX_DIAL_FAILURES: u32 = 3;

/// Wait before redialling a candidate that failed.
pub const REDIAL_BACKOFF: Duration = Duration::from_secs(30);

/// Maximum dial candidates kept.
pub const MAX_CANDIDATES: usize = 1000;

/// How the engine takes part in the swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOptions {
    /// Look for and dial other peers.
    pub client: bool,
    /// Accept inbound peers and announce ourselves.
    pub server: bool,
}

impl JoinOptions {
    pub fn client_only() -> Self {
        Self {
            client: true,
            server: false,
        }
    }
}

/// Where a candidate address came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateSource {
    Bootstrap,
    Cache,
    Beacon,
    Manual,
}

#[derive(Debug, Clone)]
struct Candidate {
    source: CandidateSource,
    failures: u32,
    retry_at: Option<Instant>,
}

/// Candidate addresses to dial.
#[derive(Debug, Default)]
pub struct RoutingTable {
    candidates: HashMap<SocketAddr, Candidate>,
    /// Our own listen address, never dialled.
    own_addr: Option<SocketAddr>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_own_addr(&mut self, addr: Option<SocketAddr>) {
        self.own_addr = addr;
        if let Some(own) = addr {
            self.candidates.remove(&own);
        }
    }

    /// Add a candidate. Returns `false` if it was rejected or already known.
    pub fn add(&mut self, addr: SocketAddr, source: CandidateSource) -> bool {
        if addr.port() == 0 || addr.ip().is_unspecified() || Some(addr) == self.own_addr {
            return false;
        }
        if let Some(existing) = self.candidates.get_mut(&addr) {
            // A live sighting clears the backoff
            if source != CandidateSource::Cache {
                existing.failures = 0;
                existing.retry_at = None;
            }
            return false;
        }
        if self.candidates.len() >= MAX_CANDIDATES && source != CandidateSource::Bootstrap {
            return false;
        }
        self.candidates.insert(
            addr,
            Candidate {
                source,
                failures: 0,
                retry_at: None,
            },
        );
        true
    }

    /// Record a failed dial; unreliable discovered candidates are dropped.
    pub fn mark_failed(&mut self, addr: &SocketAddr, now: Instant) {
        let Some(candidate) = self.candidates.get_mut(addr) else {
            return;
        };
        candidate.failures += 1;
        candidate.retry_at = Some(now + REDIAL_BACKOFF);
        if candidate.failures >= MAX_DIAL_FAILURES && candidate.source != CandidateSource::Bootstrap
        {
            self.candidates.remove(addr);
        }
    }

    /// Record a successful dial.
    pub fn mark_connected(&mut self, addr: &SocketAddr) {
        if let Some(candidate) = self.candidates.get_mut(addr) {
            candidate.failures = 0;
            candidate.retry_at = None;
        }
    }

    /// Up to `max` candidates due for a dial that `should_dial` accepts,
    /// bootstrap peers first.
    pub fn due<F>(&self, now: Instant, max: usize, mut should_dial: F) -> Vec<SocketAddr>
    where
        F: FnMut(&SocketAddr) -> bool,
    {
        let mut due: Vec<(&SocketAddr, &Candidate)> = self
            .candidates
            .iter()
            .filter(|(_, c)| c.retry_at.map_or(true, |at| at <= now))
            .collect();
        due.sort_by_key(|(addr, c)| (c.source != CandidateSource::Bootstrap, c.failures, **addr));

        due.into_iter()
            .map(|(addr, _)| *addr)
            .filter(|addr| should_dial(addr))
            .take(max)
            .collect()
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.candidates.contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn clear(&mut self) {
        self.candidates.clear();
    }
}
