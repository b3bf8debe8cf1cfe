//! Hardware tiers and the adaptive node profile.
//!
//! A machine is classified once at startup and maps to a base profile. The
//! adapter then nudges the advertised weight up or down at runtime (CPU
//! pressure, race streaks) and can force the low-tier profile while the
//! node is isolated. Every change yields a new immutable [`Profile`]
//! snapshot; the engine publishes it to observers.

use std::fmt;

use sysinfo::System;

const GIB: u64 = 1024 * 1024 * 1024;

/// Highest weight a node can advertise.
pub const MAX_WEIGHT: u8 = 10;

/// Hardware class of the local machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemTier {
    Low,
    Mid,
    High,
}

impl SystemTier {
    /// Classify a machine by total memory (bytes) and logical cores.
    pub fn classify(total_memory: u64, cores: usize) -> Self {
        if total_memory >= 16 * GIB && cores >= 8 {
            SystemTier::High
        } else if total_memory >= 8 * GIB && cores >= 4 {
            SystemTier::Mid
        } else {
            SystemTier::Low
        }
    }

    /// The profile a freshly started node of this tier runs with.
    pub fn base_profile(self) -> Profile {
        match self {
            SystemTier::Low => Profile {
                tier: self,
                max_peers: 8,
                buffer_size: 64 * 1024,
                passive: true,
                weight: 1,
            },
            SystemTier::Mid => Profile {
                tier: self,
                max_peers: 24,
                buffer_size: 256 * 1024,
                passive: false,
                weight: 3,
            },
            SystemTier::High => Profile {
                tier: self,
                max_peers: 50,
                buffer_size: 1024 * 1024,
                passive: false,
                weight: 5,
            },
        }
    }
}

impl fmt::Display for SystemTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SystemTier::Low => write!(f, "low"),
            SystemTier::Mid => write!(f, "mid"),
            SystemTier::High => write!(f, "high"),
        }
    }
}

/// Runtime participation profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Profile {
    /// Hardware tier the profile was derived from.
    pub tier: SystemTier,
    /// Peer connections to aim for.
    pub max_peers: usize,
    /// Upload chunk size in bytes.
    pub buffer_size: usize,
    /// Passive nodes never announce themselves.
    pub passive: bool,
    /// Advertised capacity weight (0 means critical).
    pub weight: u8,
}

impl Profile {
    /// A critical node is too loaded to serve anyone.
    pub fn is_critical(&self) -> bool {
        self.weight == 0
    }
}

/// Owns the base and current profile.
#[derive(Debug, Clone)]
pub struct NodeAdapter {
    base: Profile,
    current: Profile,
    downgraded: bool,
}

impl NodeAdapter {
    /// Create an adapter for a known tier.
    pub fn new(tier: SystemTier) -> Self {
        let base = tier.base_profile();
        Self {
            base,
            current: base,
            downgraded: false,
        }
    }

    /// Detect the local tier from memory and core count.
    pub fn detect() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        let total_memory = sys.total_memory();
        let cores = num_cpus::get();
        let tier = SystemTier::classify(total_memory, cores);

        tracing::info!(
            tier = %tier,
            memory_gib = total_memory / GIB,
            cores,
            "Detected system tier"
        );
        Self::new(tier)
    }

    pub fn current(&self) -> Profile {
        self.current
    }

    pub fn base(&self) -> Profile {
        self.base
    }

    pub fn is_downgraded(&self) -> bool {
        self.downgraded
    }

    /// Raise the advertised weight by one, up to [`MAX_WEIGHT`].
    pub fn boost(&mut self) -> Profile {
        if !self.downgraded {
            self.current.weight = (self.current.weight + 1).min(MAX_WEIGHT);
        }
        self.current
    }

    /// Lower the advertised weight by one, down to zero (critical).
    pub fn penalize(&mut self) -> Profile {
        if !self.downgraded {
            self.current.weight = self.current.weight.saturating_sub(1);
        }
        self.current
    }

    /// Move the weight one step back toward the base weight.
    pub fn recover(&mut self) -> Profile {
        if !self.downgraded && self.current.weight < self.base.weight {
            self.current.weight += 1;
        }
        self.current
    }

    /// Switch to the low-tier profile until [`restore`](Self::restore).
    pub fn force_downgrade(&mut self) -> Profile {
        let mut low = SystemTier::Low.base_profile();
        low.tier = self.base.tier;
        self.current = low;
        self.downgraded = true;
        self.current
    }

    /// Return to the base profile.
    pub fn restore(&mut self) -> Profile {
        self.current = self.base;
        self.downgraded = false;
        self.current
    }
}
