//! HELLO exchange and round-trip measurement.
//!
//! Both sides send HELLO immediately after connecting, followed by a PING.
//! A peer becomes eligible for requests once its HELLO has arrived. Every
//! PONG matching the outstanding PING nonce yields a fresh RTT sample.

use std::time::{Duration, Instant};

use crate::error::{P2pError, P2pResult};
use crate::protocol::Hello;

/// Per-connection handshake state.
#[derive(Debug, Default)]
pub struct Handshake {
    remote: Option<Hello>,
    outstanding_ping: Option<(u32, Instant)>,
    rtt: Option<Duration>,
    next_nonce: u32,
}

impl Handshake {
    /// Create a new handshake state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the remote HELLO. A second HELLO is a protocol violation.
    pub fn on_hello(&mut self, hello: Hello) -> P2pResult<()> {
        if self.remote.is_some() {
            return Err(P2pError::Protocol("duplicate hello".into()));
        }
        self.remote = Some(hello);
        Ok(())
    }

    /// Whether the remote HELLO has arrived.
    pub fn is_complete(&self) -> bool {
        self.remote.is_some()
    }

    pub fn remote(&self) -> Option<Hello> {
        self.remote
    }

    /// Allocate a nonce for an outgoing PING sent at `now`.
    pub fn start_ping(&mut self, now: Instant) -> u32 {
        self.next_nonce = self.next_nonce.wrapping_add(1);
        self.outstanding_ping = Some((self.next_nonce, now));
        self.next_nonce
    }

    /// Handle a PONG and return the RTT sample if it matches.
    pub fn on_pong(&mut self, nonce: u32, now: Instant) -> Option<Duration> {
        match self.outstanding_ping {
            Some((expected, sent_at)) if expected == nonce => {
                self.outstanding_ping = None;
                let rtt = now.saturating_duration_since(sent_at);
                self.rtt = Some(rtt);
                Some(rtt)
            }
            _ => None,
        }
    }

    /// Latest RTT sample.
    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_once() {
        let mut hs = Handshake::new();
        assert!(!hs.is_complete());

        hs.on_hello(Hello::new(3, true)).unwrap();
        assert!(hs.is_complete());
        assert_eq!(hs.remote().map(|h| h.weight), Some(3));

        assert!(hs.on_hello(Hello::new(3, true)).is_err());
    }

    #[test]
    fn test_rtt_from_matching_pong() {
        let mut hs = Handshake::new();
        let sent = Instant::now();
        let nonce = hs.start_ping(sent);

        assert!(hs.on_pong(nonce + 1, sent + Duration::from_millis(5)).is_none());

        let rtt = hs.on_pong(nonce, sent + Duration::from_millis(40)).unwrap();
        assert_eq!(rtt, Duration::from_millis(40));
        assert_eq!(hs.rtt(), Some(rtt));

        // A repeated pong is ignored
        assert!(hs.on_pong(nonce, sent + Duration::from_millis(80)).is_none());
    }
}
