//! Download concurrency limit.

/// Concurrent downloads allowed per connected peer.
pub const REQUESTS_PER_PEER: usize = 8;

/// Floor and ceiling of the peer-derived limit.
pub const MIN_CONCURRENCY: usize = 10;
pub const MAX_CONCURRENCY: usize = 150;

/// In-flight requests per peer above which the limit is halved.
pub const CONGESTION_PER_PEER: usize = 12;

/// Maximum concurrent P2P downloads for the current conditions.
///
/// Starts from `clamp(peers × 8, 10, 150)`, is capped at 24/16/8 when CPU
/// usage reaches 50/70/90 percent, and halves when the requests already in
/// flight average more than twelve per peer.
pub fn download_concurrency_limit(peer_count: usize, cpu_usage: f32, in_flight: usize) -> usize {
    let mut limit = (peer_count * REQUESTS_PER_PEER).clamp(MIN_CONCURRENCY, MAX_CONCURRENCY);

    let cpu_cap = if cpu_usage >= 90.0 {
        8
    } else if cpu_usage >= 70.0 {
        16
    } else if cpu_usage >= 50.0 {
        24
    } else {
        usize::MAX
    };
    limit = limit.min(cpu_cap);

    if peer_count > 0 && in_flight / peer_count > CONGESTION_PER_PEER {
        limit /= 2;
    }

    limit.max(1)
}
