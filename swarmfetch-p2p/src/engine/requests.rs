//! Outstanding download requests.
//!
//! The table routes DATA/END/ERROR frames to the requester that owns the
//! request id and enforces the size contract: bytes beyond the expected
//! size plus tolerance abort the request, and END is only a success when
//! the byte count matches exactly. Frames for unknown ids, or from a peer
//! other than the one the request was assigned to, are ignored.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use swarmfetch_core::ContentHash;
use tokio::sync::mpsc;

use crate::engine::commands::TransferEvent;
use crate::error::P2pError;
use crate::peer::PeerId;

/// An assigned request.
#[derive(Debug)]
pub struct PendingRequest {
    pub peer_id: PeerId,
    pub hash: ContentHash,
    pub expected: u64,
    pub received: u64,
    pub started: Instant,
    pub last_activity: Instant,
    events: mpsc::UnboundedSender<TransferEvent>,
}

impl PendingRequest {
    pub fn new(
        peer_id: PeerId,
        hash: ContentHash,
        expected: u64,
        events: mpsc::UnboundedSender<TransferEvent>,
        now: Instant,
    ) -> Self {
        Self {
            peer_id,
            hash,
            expected,
            received: 0,
            started: now,
            last_activity: now,
            events,
        }
    }

    fn fail(self, error: P2pError) {
        let _ = self.events.send(TransferEvent::Failed(error));
    }
}

/// What happened to a DATA frame.
#[derive(Debug, PartialEq, Eq)]
pub enum DataOutcome {
    /// Forwarded to the requester.
    Accepted,
    /// No matching request; dropped.
    Ignored,
    /// The requester is gone; the request was removed.
    Abandoned(PeerId),
    /// The sender overran the size limit; the request failed.
    Overflow(PeerId),
}

/// A request that reached END.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Finished {
    pub peer_id: PeerId,
    pub bytes: u64,
    pub elapsed: Duration,
    /// Whether the byte count matched.
    pub complete: bool,
}

/// Request id → pending request.
#[derive(Debug)]
pub struct RequestTable {
    requests: HashMap<u32, PendingRequest>,
    next_id: u32,
    tolerance: u64,
}

impl RequestTable {
    pub fn new(tolerance: u64) -> Self {
        Self {
            requests: HashMap::new(),
            next_id: 1,
            tolerance,
        }
    }

    /// Allocate an unused, non-zero request id.
    pub fn allocate_id(&mut self) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if !self.requests.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn insert(&mut self, request_id: u32, request: PendingRequest) {
        self.requests.insert(request_id, request);
    }

    pub fn get(&self, request_id: u32) -> Option<&PendingRequest> {
        self.requests.get(&request_id)
    }

    fn owned_by(&self, peer_id: PeerId, request_id: u32) -> bool {
        matches!(self.requests.get(&request_id), Some(r) if r.peer_id == peer_id)
    }

    /// Route a DATA chunk.
    pub fn on_data(&mut self, peer_id: PeerId, request_id: u32, chunk: Bytes, now: Instant) -> DataOutcome {
        if !self.owned_by(peer_id, request_id) {
            return DataOutcome::Ignored;
        }
        let tolerance = self.tolerance;
        let Some(request) = self.requests.get_mut(&request_id) else {
            return DataOutcome::Ignored;
        };

        request.received += chunk.len() as u64;
        request.last_activity = now;

        if request.received > request.expected.saturating_add(tolerance) {
            if let Some(request) = self.requests.remove(&request_id) {
                let error = P2pError::SizeLimitExceeded {
                    expected: request.expected,
                    received: request.received,
                };
                request.fail(error);
            }
            return DataOutcome::Overflow(peer_id);
        }

        if request.events.send(TransferEvent::Data(chunk)).is_err() {
            self.requests.remove(&request_id);
            return DataOutcome::Abandoned(peer_id);
        }
        DataOutcome::Accepted
    }

    /// Complete a request on END.
    pub fn on_end(&mut self, peer_id: PeerId, request_id: u32, now: Instant) -> Option<Finished> {
        if !self.owned_by(peer_id, request_id) {
            return None;
        }
        let request = self.requests.remove(&request_id)?;
        let finished = Finished {
            peer_id,
            bytes: request.received,
            elapsed: now.saturating_duration_since(request.started),
            complete: request.received == request.expected,
        };

        if finished.complete {
            let _ = request.events.send(TransferEvent::End);
        } else {
            let error = P2pError::Incomplete {
                expected: request.expected,
                received: request.received,
            };
            request.fail(error);
        }
        Some(finished)
    }

    /// Fail a request on ERROR. Returns the peer that refused.
    pub fn on_error(&mut self, peer_id: PeerId, request_id: u32, reason: String) -> Option<PeerId> {
        if !self.owned_by(peer_id, request_id) {
            return None;
        }
        let request = self.requests.remove(&request_id)?;
        let received = request.received;
        request.fail(P2pError::Remote { reason, received });
        Some(peer_id)
    }

    /// Fail every request assigned to a disconnected peer.
    pub fn fail_peer(&mut self, peer_id: PeerId, reason: &str) -> usize {
        let ids: Vec<u32> = self
            .requests
            .iter()
            .filter(|(_, r)| r.peer_id == peer_id)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(request) = self.requests.remove(id) {
                let received = request.received;
                request.fail(P2pError::PeerDisconnected {
                    reason: reason.to_string(),
                    received,
                });
            }
        }
        ids.len()
    }

    /// Drop a request whose requester went away.
    pub fn cancel(&mut self, request_id: u32) -> Option<PendingRequest> {
        self.requests.remove(&request_id)
    }

    /// Fail requests with no activity for `timeout`. Returns their peers.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<PeerId> {
        let ids: Vec<u32> = self
            .requests
            .iter()
            .filter(|(_, r)| now.saturating_duration_since(r.last_activity) >= timeout)
            .map(|(id, _)| *id)
            .collect();

        let mut peers = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(request) = self.requests.remove(&id) {
                tracing::debug!(
                    request_id = id,
                    peer = %request.peer_id,
                    hash = %request.hash,
                    received = request.received,
                    "Request timed out"
                );
                peers.push(request.peer_id);
                let received = request.received;
                request.fail(P2pError::Timeout { received });
            }
        }
        peers
    }

    /// Fail everything; the engine is stopping.
    pub fn fail_all(&mut self) {
        for (_, request) in self.requests.drain() {
            request.fail(P2pError::EngineStopped);
        }
    }

    /// Requests currently outstanding.
    pub fn in_flight(&self) -> usize {
        self.requests.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA1_ABC: &str = "a9993e364706816aba3e25717850c26c9cd0d89d";
    const TOLERANCE: u64 = 1024 * 1024;

    fn table_with(
        expected: u64,
    ) -> (RequestTable, u32, mpsc::UnboundedReceiver<TransferEvent>, Instant) {
        let mut table = RequestTable::new(TOLERANCE);
        let (tx, rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        let id = table.allocate_id();
        let hash = ContentHash::parse(SHA1_ABC).unwrap();
        table.insert(id, PendingRequest::new(PeerId::new(1), hash, expected, tx, now));
        (table, id, rx, now)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransferEvent>) -> (Vec<u8>, bool) {
        let mut data = Vec::new();
        let mut ended = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                TransferEvent::Data(chunk) => data.extend_from_slice(&chunk),
                TransferEvent::End => ended = true,
                TransferEvent::Failed(e) => panic!("unexpected failure {:?}", e),
            }
        }
        (data, ended)
    }

    #[test]
    fn test_interleaved_requests_for_same_hash_stay_separate() {
        let mut table = RequestTable::new(0);
        let now = Instant::now();
        let hash = ContentHash::parse(SHA1_ABC).unwrap();
        let peer = PeerId::new(1);

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = table.allocate_id();
        let b = table.allocate_id();
        assert_ne!(a, b);
        table.insert(a, PendingRequest::new(peer, hash.clone(), 4, tx_a, now));
        table.insert(b, PendingRequest::new(peer, hash, 6, tx_b, now));

        for (id, chunk) in [(a, "ab"), (b, "xyz"), (a, "cd"), (b, "uvw")] {
            assert_eq!(
                table.on_data(peer, id, Bytes::from(chunk), now),
                DataOutcome::Accepted
            );
        }
        assert_eq!(table.get(a).map(|r| r.received), Some(4));
        assert_eq!(table.get(b).map(|r| r.received), Some(6));

        assert!(table.on_end(peer, b, now).unwrap().complete);
        assert_eq!(table.in_flight(), 1);
        assert!(table.on_end(peer, a, now).unwrap().complete);

        assert_eq!(drain(&mut rx_a), (b"abcd".to_vec(), true));
        assert_eq!(drain(&mut rx_b), (b"xyzuvw".to_vec(), true));
    }

    #[test]
    fn test_allocate_skips_zero_and_used() {
        let mut table = RequestTable::new(0);
        table.next_id = u32::MAX;
        assert_eq!(table.allocate_id(), u32::MAX);
        assert_eq!(table.allocate_id(), 1);
    }

    #[test]
    fn test_exact_transfer_completes() {
        let (mut table, id, mut rx, now) = table_with(3);

        assert_eq!(
            table.on_data(PeerId::new(1), id, Bytes::from_static(b"abc"), now),
            DataOutcome::Accepted
        );
        let finished = table.on_end(PeerId::new(1), id, now).unwrap();
        assert!(finished.complete);
        assert_eq!(finished.bytes, 3);

        assert!(matches!(rx.try_recv(), Ok(TransferEvent::Data(_))));
        assert!(matches!(rx.try_recv(), Ok(TransferEvent::End)));
        assert_eq!(table.in_flight(), 0);
    }

    #[test]
    fn test_short_transfer_incomplete() {
        let (mut table, id, mut rx, now) = table_with(10);
        table.on_data(PeerId::new(1), id, Bytes::from_static(b"abc"), now);

        let finished = table.on_end(PeerId::new(1), id, now).unwrap();
        assert!(!finished.complete);

        let _ = rx.try_recv();
        match rx.try_recv() {
            Ok(TransferEvent::Failed(P2pError::Incomplete { expected, received })) => {
                assert_eq!((expected, received), (10, 3));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_within_tolerance_accepted() {
        let (mut table, id, _rx, now) = table_with(10);
        let chunk = Bytes::from(vec![0u8; (10 + TOLERANCE) as usize]);
        assert_eq!(table.on_data(PeerId::new(1), id, chunk, now), DataOutcome::Accepted);
    }

    #[test]
    fn test_overflow_keeps_received_count() {
        let expected = 1_000_000;
        let (mut table, id, mut rx, now) = table_with(expected);

        let mut outcome = DataOutcome::Accepted;
        let mut sent = 0u64;
        while outcome == DataOutcome::Accepted {
            outcome = table.on_data(PeerId::new(1), id, Bytes::from(vec![0u8; 500_000]), now);
            sent += 500_000;
        }
        assert_eq!(outcome, DataOutcome::Overflow(PeerId::new(1)));
        assert!(sent > expected + TOLERANCE);

        let failure = std::iter::from_fn(|| rx.try_recv().ok())
            .find_map(|e| match e {
                TransferEvent::Failed(err) => Some(err),
                _ => None,
            })
            .unwrap();
        assert!(failure.is_security_violation());
        assert_eq!(failure.bytes_received(), sent);
        assert_eq!(table.in_flight(), 0);
    }

    #[test]
    fn test_frames_from_other_peer_ignored() {
        let (mut table, id, _rx, now) = table_with(3);
        assert_eq!(
            table.on_data(PeerId::new(2), id, Bytes::from_static(b"abc"), now),
            DataOutcome::Ignored
        );
        assert!(table.on_end(PeerId::new(2), id, now).is_none());
        assert!(table.on_error(PeerId::new(2), id, "Busy".into()).is_none());
        assert_eq!(table.in_flight(), 1);
    }

    #[test]
    fn test_remote_error() {
        let (mut table, id, mut rx, _) = table_with(3);
        assert_eq!(
            table.on_error(PeerId::new(1), id, "Owner Busy".into()),
            Some(PeerId::new(1))
        );
        match rx.try_recv() {
            Ok(TransferEvent::Failed(P2pError::Remote { reason, received })) => {
                assert_eq!(reason, "Owner Busy");
                assert_eq!(received, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_expire_and_fail_peer() {
        let (mut table, id, mut rx, now) = table_with(3);
        assert!(table.expire(now, Duration::from_secs(15)).is_empty());
        let peers = table.expire(now + Duration::from_secs(15), Duration::from_secs(15));
        assert_eq!(peers, vec![PeerId::new(1)]);
        assert!(table.get(id).is_none());
        assert!(matches!(
            rx.try_recv(),
            Ok(TransferEvent::Failed(P2pError::Timeout { received: 0 }))
        ));

        let (mut table, _, mut rx, _) = table_with(3);
        assert_eq!(table.fail_peer(PeerId::new(1), "connection closed"), 1);
        assert!(matches!(
            rx.try_recv(),
            Ok(TransferEvent::Failed(P2pError::PeerDisconnected { .. }))
        ));
    }

    #[test]
    fn test_abandoned_requester() {
        let (mut table, id, rx, now) = table_with(3);
        drop(rx);
        assert_eq!(
            table.on_data(PeerId::new(1), id, Bytes::from_static(b"a"), now),
            DataOutcome::Abandoned(PeerId::new(1))
        );
        assert_eq!(table.in_flight(), 0);
    }
}
