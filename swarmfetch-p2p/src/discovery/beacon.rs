//! LAN beacon.
//!
//! A UDP datagram carrying the swarm topic and our TCP listen port is
//! broadcast periodically while we accept peers. Every node listens on the
//! same port; a beacon for our topic from another node becomes a dial
//! candidate at `source_ip:listen_port`.
//!
//! Packet layout (46 bytes):
//! - 4 bytes: magic `SWBN`
//! - 32 bytes: topic
//! - 8 bytes: sender nonce (filters out our own broadcasts)
//! - 2 bytes: big-endian TCP listen port

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use swarmfetch_core::SwarmTopic;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::P2pResult;

/// Beacon magic.
pub const BEACON_MAGIC: &[u8; 4] = b"SWBN";

/// Encoded beacon length.
pub const BEACON_SIZE: usize = 4 + 32 + 8 + 2;

/// Interval between announcements.
pub const BEACON_INTERVAL: Duration = Duration::from_secs(5);

/// One beacon datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeaconPacket {
    pub topic: [u8; 32],
    pub nonce: u64,
    pub port: u16,
}

impl BeaconPacket {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(BEACON_SIZE);
        buf.put_slice(BEACON_MAGIC);
        buf.put_slice(&self.topic);
        buf.put_u64(self.nonce);
        buf.put_u16(self.port);
        buf
    }

    /// Decode a datagram, or `None` if it is not a beacon.
    pub fn decode(datagram: &[u8]) -> Option<Self> {
        if datagram.len() != BEACON_SIZE || &datagram[..4] != BEACON_MAGIC {
            return None;
        }
        let mut buf = &datagram[4..];
        let mut topic = [0u8; 32];
        buf.copy_to_slice(&mut topic);
        let nonce = buf.get_u64();
        let port = buf.get_u16();
        if port == 0 {
            return None;
        }
        Some(Self { topic, nonce, port })
    }
}

/// Beacon socket settings.
#[derive(Debug, Clone)]
pub struct BeaconConfig {
    /// Address the UDP socket binds to.
    pub bind: SocketAddr,
    /// Where announcements are sent (normally the broadcast address).
    pub target: SocketAddr,
    pub topic: SwarmTopic,
    /// TCP port to announce, `None` to only listen.
    pub announce_port: Option<u16>,
    pub interval: Duration,
}

impl BeaconConfig {
    /// Broadcast on `port` for the given topic.
    pub fn broadcast(port: u16, topic: SwarmTopic, announce_port: Option<u16>) -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], port)),
            target: SocketAddr::from(([255, 255, 255, 255], port)),
            topic,
            announce_port,
            interval: BEACON_INTERVAL,
        }
    }
}

/// Running beacon task.
#[derive(Debug)]
pub struct LanBeacon {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl LanBeacon {
    /// Bind the socket and start announcing/listening.
    ///
    /// Discovered peer addresses are sent on `discovered`.
    pub async fn spawn(
        config: BeaconConfig,
        discovered: mpsc::UnboundedSender<SocketAddr>,
    ) -> P2pResult<Self> {
        let socket = UdpSocket::bind(config.bind).await?;
        socket.set_broadcast(true)?;
        let local_addr = socket.local_addr()?;
        let nonce = rand::random::<u64>();
        let cancel = CancellationToken::new();

        tracing::debug!(
            addr = %local_addr,
            announcing = config.announce_port.is_some(),
            "LAN beacon started"
        );

        let handle = tokio::spawn(run_beacon(socket, config, nonce, discovered, cancel.clone()));
        Ok(Self {
            local_addr,
            cancel,
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the beacon task.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        let _ = (&mut self.handle).await;
    }
}

impl Drop for LanBeacon {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_beacon(
    socket: UdpSocket,
    config: BeaconConfig,
    nonce: u64,
    discovered: mpsc::UnboundedSender<SocketAddr>,
    cancel: CancellationToken,
) {
    let announcement = config.announce_port.map(|port| {
        BeaconPacket {
            topic: *config.topic.as_bytes(),
            nonce,
            port,
        }
        .encode()
    });
    let mut ticker = tokio::time::interval(config.interval);
    let mut buf = [0u8; 64];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = ticker.tick(), if announcement.is_some() => {
                if let Some(packet) = &announcement {
                    if let Err(e) = socket.send_to(packet, config.target).await {
                        tracing::trace!(error = %e, "Beacon send failed");
                    }
                }
            }

            received = socket.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::debug!(error = %e, "Beacon receive failed");
                        continue;
                    }
                };
                let Some(packet) = BeaconPacket::decode(&buf[..len]) else {
                    continue;
                };
                if packet.nonce == nonce || &packet.topic != config.topic.as_bytes() {
                    continue;
                }
                let peer = SocketAddr::new(from.ip(), packet.port);
                tracing::trace!(peer = %peer, "Beacon received");
                if discovered.send(peer).is_err() {
                    break;
                }
            }
        }
    }
}
