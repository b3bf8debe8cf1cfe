//! Connected peer tracking.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use tokio::sync::mpsc;

use crate::peer::{Peer, PeerCommand, PeerId};

/// Connected peers, their command channels, and addresses being dialled.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    /// Connected peers by ID.
    peers: HashMap<PeerId, Peer>,
    /// Command channels to each connection.
    commands: HashMap<PeerId, mpsc::UnboundedSender<PeerCommand>>,
    /// Peer IDs by remote socket address.
    by_address: HashMap<SocketAddr, PeerId>,
    /// Addresses we're currently connecting to.
    connecting: HashSet<SocketAddr>,
    /// Next peer ID counter.
    next_peer_id: u64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            next_peer_id: 1,
            ..Default::default()
        }
    }

    /// Allocate a new peer ID.
    pub fn next_peer_id(&mut self) -> PeerId {
        let id = self.next_peer_id;
        self.next_peer_id += 1;
        PeerId::new(id)
    }

    /// Whether we hold a connection to `addr`, either as its socket address
    /// or as a known listen address.
    pub fn is_connected(&self, addr: &SocketAddr) -> bool {
        self.by_address.contains_key(addr)
            || self.peers.values().any(|p| p.listen_addr.as_ref() == Some(addr))
    }

    pub fn is_connecting(&self, addr: &SocketAddr) -> bool {
        self.connecting.contains(addr)
    }

    /// Whether a dial to `addr` should start while staying under `capacity`.
    pub fn should_dial(&self, addr: &SocketAddr, capacity: usize) -> bool {
        !self.is_connected(addr)
            && !self.is_connecting(addr)
            && self.peers.len() + self.connecting.len() < capacity
    }

    pub fn start_connecting(&mut self, addr: SocketAddr) {
        self.connecting.insert(addr);
    }

    pub fn stop_connecting(&mut self, addr: &SocketAddr) {
        self.connecting.remove(addr);
    }

    pub fn connecting_count(&self) -> usize {
        self.connecting.len()
    }

    /// Register a connected peer.
    pub fn add(&mut self, peer: Peer, commands: mpsc::UnboundedSender<PeerCommand>) {
        self.connecting.remove(&peer.addr);
        self.by_address.insert(peer.addr, peer.id);
        self.commands.insert(peer.id, commands);
        self.peers.insert(peer.id, peer);
    }

    /// Remove a peer.
    pub fn remove(&mut self, peer_id: &PeerId) -> Option<Peer> {
        self.commands.remove(peer_id);
        let peer = self.peers.remove(peer_id)?;
        self.by_address.remove(&peer.addr);
        Some(peer)
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(peer_id)
    }

    /// Send a command to a peer. Returns false if the peer is gone.
    pub fn send(&self, peer_id: &PeerId, command: PeerCommand) -> bool {
        match self.commands.get(peer_id) {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        }
    }

    /// Ask a peer's connection to close.
    pub fn disconnect(&mut self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.state = crate::peer::PeerState::Disconnecting;
        }
        if let Some(tx) = self.commands.get(peer_id) {
            if tx.send(PeerCommand::Disconnect).is_err() {
                tracing::debug!(peer = %peer_id, "Peer command channel already closed");
            }
        }
    }

    /// Close every connection and forget all peers.
    pub fn disconnect_all(&mut self) -> Vec<Peer> {
        for tx in self.commands.values() {
            let _ = tx.send(PeerCommand::Disconnect);
        }
        self.commands.clear();
        self.by_address.clear();
        self.connecting.clear();
        self.peers.drain().map(|(_, peer)| peer).collect()
    }

    /// Total connected peers, ready or not.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Peers that completed the HELLO exchange.
    pub fn ready(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values().filter(|p| p.is_ready())
    }

    pub fn ready_count(&self) -> usize {
        self.ready().count()
    }

    /// Iterate over all peers.
    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.values_mut()
    }
}
