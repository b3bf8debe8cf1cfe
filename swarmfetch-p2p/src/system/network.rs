//! Local network identification.
//!
//! The primary IPv4 address is the source address the OS would route
//! internet traffic from; it anchors the decision whether a peer is on the
//! same subnet. The network fingerprint combines it with every non-loopback
//! IPv4 interface address and netmask, so a new VPN, a second NIC or a
//! subnet change is noticed even when the routed address stays the same.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use if_addrs::IfAddr;

/// Address used only to select a route; no packet is sent.
const ROUTE_PROBE_TARGET: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53);

/// Source of the local network fingerprint.
pub trait InterfaceProbe: Send + Sync + 'static {
    /// The primary local IPv4 address, if any interface is up.
    fn primary_ipv4(&self) -> Option<Ipv4Addr>;

    /// A string that changes whenever the active network changes.
    fn fingerprint(&self) -> Option<String> {
        self.primary_ipv4().map(|ip| ip.to_string())
    }
}

/// Probe backed by the OS: the routing table for the primary address and
/// the interface list for the fingerprint.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInterfaceProbe;

impl InterfaceProbe for SystemInterfaceProbe {
    fn primary_ipv4(&self) -> Option<Ipv4Addr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
        socket.connect(ROUTE_PROBE_TARGET).ok()?;
        match socket.local_addr().ok()?.ip() {
            IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
            _ => None,
        }
    }

    fn fingerprint(&self) -> Option<String> {
        let interfaces = match if_addrs::get_if_addrs() {
            Ok(interfaces) => interfaces,
            Err(e) => {
                tracing::debug!(error = %e, "Interface enumeration failed");
                Vec::new()
            }
        };
        let addrs = interfaces
            .iter()
            .filter_map(|iface| match &iface.addr {
                IfAddr::V4(v4) => Some((v4.ip, v4.netmask)),
                IfAddr::V6(_) => None,
            })
            .collect();
        network_fingerprint(self.primary_ipv4(), addrs)
    }
}

/// Fingerprint of the routed address plus every non-loopback IPv4
/// `(address, netmask)` pair. Order of the interfaces does not matter.
pub fn network_fingerprint(
    primary: Option<Ipv4Addr>,
    mut addrs: Vec<(Ipv4Addr, Ipv4Addr)>,
) -> Option<String> {
    addrs.retain(|(ip, _)| !ip.is_loopback() && !ip.is_unspecified());
    if primary.is_none() && addrs.is_empty() {
        return None;
    }
    addrs.sort();
    addrs.dedup();

    let interfaces: Vec<String> = addrs
        .iter()
        .map(|(ip, mask)| format!("{}/{}", ip, mask))
        .collect();
    let primary = primary.map(|ip| ip.to_string()).unwrap_or_default();
    Some(format!("{}|{}", primary, interfaces.join(",")))
}

/// Whether `peer` is on the local network.
///
/// Loopback and link-local peers always are. Otherwise an IPv4 peer must
/// share the /24 of the primary address; when that address is unknown a
/// private-range peer is assumed local.
pub fn is_lan_peer(peer: IpAddr, local: Option<Ipv4Addr>) -> bool {
    match peer {
        IpAddr::V4(ip) => {
            if ip.is_loopback() || ip.is_link_local() {
                return true;
            }
            match local {
                Some(local) => ip.octets()[..3] == local.octets()[..3],
                None => ip.is_private(),
            }
        }
        IpAddr::V6(ip) => {
            if ip.is_loopback() {
                return true;
            }
            match ip.to_ipv4_mapped() {
                Some(v4) => is_lan_peer(IpAddr::V4(v4), local),
                // fe80::/10
                None => (ip.segments()[0] & 0xffc0) == 0xfe80,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_is_lan() {
        assert!(is_lan_peer("127.0.0.1".parse().unwrap(), None));
        assert!(is_lan_peer("::1".parse().unwrap(), Some(Ipv4Addr::new(10, 0, 0, 2))));
    }

    #[test]
    fn test_same_subnet() {
        let local = Some(Ipv4Addr::new(192, 168, 1, 20));
        assert!(is_lan_peer("192.168.1.77".parse().unwrap(), local));
        assert!(!is_lan_peer("192.168.2.77".parse().unwrap(), local));
        assert!(!is_lan_peer("203.0.113.9".parse().unwrap(), local));
        assert!(is_lan_peer("::ffff:192.168.1.5".parse().unwrap(), local));
    }

    #[test]
    fn test_unknown_local_falls_back_to_private_ranges() {
        assert!(is_lan_peer("10.4.5.6".parse().unwrap(), None));
        assert!(!is_lan_peer("8.8.4.4".parse().unwrap(), None));
        assert!(is_lan_peer("169.254.10.1".parse().unwrap(), None));
        assert!(is_lan_peer("fe80::1".parse().unwrap(), None));
    }

    struct Fixed(Option<Ipv4Addr>);

    impl InterfaceProbe for Fixed {
        fn primary_ipv4(&self) -> Option<Ipv4Addr> {
            self.0
        }
    }

    #[test]
    fn test_fingerprint_follows_address() {
        assert_eq!(
            Fixed(Some(Ipv4Addr::new(10, 0, 0, 3))).fingerprint().as_deref(),
            Some("10.0.0.3")
        );
        assert!(Fixed(None).fingerprint().is_none());
    }

    #[test]
    fn test_network_fingerprint_ignores_order_and_loopback() {
        let primary = Some(Ipv4Addr::new(192, 168, 1, 20));
        let mask = Ipv4Addr::new(255, 255, 255, 0);
        let a = network_fingerprint(
            primary,
            vec![
                (Ipv4Addr::new(10, 8, 0, 2), mask),
                (Ipv4Addr::LOCALHOST, Ipv4Addr::new(255, 0, 0, 0)),
                (Ipv4Addr::new(192, 168, 1, 20), mask),
            ],
        );
        let b = network_fingerprint(
            primary,
            vec![(Ipv4Addr::new(192, 168, 1, 20), mask), (Ipv4Addr::new(10, 8, 0, 2), mask)],
        );
        assert_eq!(a, b);
        assert_eq!(a.as_deref(), Some("192.168.1.20|10.8.0.2/255.255.255.0,192.168.1.20/255.255.255.0"));
    }

    #[test]
    fn test_network_fingerprint_sees_secondary_interfaces() {
        let primary = Some(Ipv4Addr::new(192, 168, 1, 20));
        let mask = Ipv4Addr::new(255, 255, 255, 0);
        let home = vec![(Ipv4Addr::new(192, 168, 1, 20), mask)];
        let mut vpn = home.clone();
        vpn.push((Ipv4Addr::new(10, 8, 0, 2), mask));

        assert_ne!(network_fingerprint(primary, home.clone()), network_fingerprint(primary, vpn));

        let wider = vec![(Ipv4Addr::new(192, 168, 1, 20), Ipv4Addr::new(255, 255, 0, 0))];
        assert_ne!(network_fingerprint(primary, home), network_fingerprint(primary, wider));
    }

    #[test]
    fn test_network_fingerprint_without_default_route() {
        let lan_only = vec![(Ipv4Addr::new(172, 16, 0, 9), Ipv4Addr::new(255, 255, 0, 0))];
        assert_eq!(
            network_fingerprint(None, lan_only).as_deref(),
            Some("|172.16.0.9/255.255.0.0")
        );
        assert!(network_fingerprint(None, vec![(Ipv4Addr::LOCALHOST, Ipv4Addr::new(255, 0, 0, 0))]).is_none());
    }
}
