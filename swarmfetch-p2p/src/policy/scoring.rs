//! Peer ranking.
//!
//! `score = weight² × 10000 / (rtt_ms + 10) × speed_factor × lan_factor`
//!
//! The speed factor is the last observed transfer speed relative to
//! 1 MiB/s, clamped to `[0.1, 10]`, and decays back to neutral once the
//! observation is stale. Same-subnet peers are boosted by a flat factor
//! so that a LAN seed always beats an internet peer of equal standing.

use std::time::{Duration, Instant};

use crate::peer::Peer;

/// Multiplier applied to same-subnet peers.
pub const LAN_FACTOR: f64 = 100.0;

/// Speed treated as neutral (factor 1.0), bytes/s.
pub const REFERENCE_SPEED: f64 = 1024.0 * 1024.0;

/// Bounds of the speed factor.
pub const SPEED_FACTOR_MIN: f64 = 0.1;
pub const SPEED_FACTOR_MAX: f64 = 10.0;

/// Observations older than this are ignored.
pub const SPEED_STALE_AFTER: Duration = Duration::from_secs(5 * 60);

/// RTT assumed before the first PONG.
pub const DEFAULT_RTT_MS: f64 = 250.0;

/// Compute the selection score of `peer` at `now`.
pub fn score(peer: &Peer, now: Instant) -> f64 {
    let weight = peer.weight as f64;
    let rtt_ms = peer
        .rtt
        .map(|rtt| rtt.as_secs_f64() * 1000.0)
        .unwrap_or(DEFAULT_RTT_MS);
    let lan = if peer.lan { LAN_FACTOR } else { 1.0 };

    weight * weight * (10_000.0 / (rtt_ms + 10.0)) * speed_factor(peer, now) * lan
}

/// The speed multiplier for `peer` at `now`.
pub fn speed_factor(peer: &Peer, now: Instant) -> f64 {
    match (peer.last_speed, peer.speed_observed_at) {
        (Some(speed), Some(at)) if now.saturating_duration_since(at) <= SPEED_STALE_AFTER => {
            (speed / REFERENCE_SPEED).clamp(SPEED_FACTOR_MIN, SPEED_FACTOR_MAX)
        }
        _ => 1.0,
    }
}

/// Pick the best-scoring peer among `candidates`.
pub fn best<'a, I>(candidates: I, now: Instant) -> Option<&'a Peer>
where
    I: IntoIterator<Item = &'a Peer>,
{
    candidates
        .into_iter()
        .map(|peer| (score(peer, now), peer))
        .max_by(|(a, _), (b, _)| a.total_cmp(b))
        .map(|(_, peer)| peer)
}
