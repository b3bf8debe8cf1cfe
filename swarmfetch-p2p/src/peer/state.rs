//! Peer state machine.

use std::fmt;

/// State of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    /// TCP connection established, awaiting the remote HELLO.
    #[default]
    AwaitingHello,
    /// HELLO received, the peer can serve requests.
    Ready,
    /// Disconnect requested, waiting for the connection task to finish.
    Disconnecting,
}

impl PeerState {
    /// Check if the peer has completed the HELLO exchange.
    pub fn is_ready(&self) -> bool {
        matches!(self, PeerState::Ready)
    }

    /// Check if the peer is disconnecting.
    pub fn is_disconnecting(&self) -> bool {
        matches!(self, PeerState::Disconnecting)
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerState::AwaitingHello => write!(f, "awaiting_hello"),
            PeerState::Ready => write!(f, "ready"),
            PeerState::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(!PeerState::AwaitingHello.is_ready());
        assert!(PeerState::Ready.is_ready());
        assert!(PeerState::Disconnecting.is_disconnecting());
        assert_eq!(PeerState::default(), PeerState::AwaitingHello);
        assert_eq!(PeerState::Ready.to_string(), "ready");
    }
}
