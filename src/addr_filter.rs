//! Public-dialability predicate for multiaddrs.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use multiaddr::{Multiaddr, Protocol};

/// Checks whether `target` can be dialled publicly. More specifically:
///   - if it is of type IP, it is a public IP, and
///   - if it is of type DNS, it is not localhost
///
/// All other address types are treated as dialable.
pub fn is_publicly_dialable_addr(target: &Multiaddr) -> bool {
    let mut components = target.iter();
    match components.next() {
        Some(Protocol::Ip4(addr)) => is_public_ip(IpAddr::V4(addr)),
        Some(Protocol::Ip6(addr)) => is_public_ip(IpAddr::V6(addr)),
        // The zone prefixes an IP6 component; classify the address it wraps.
        Some(Protocol::Ip6zone(_)) => match components.next() {
            Some(Protocol::Ip6(addr)) => is_public_ip(IpAddr::V6(addr)),
            _ => false,
        },
        // A bare CIDR component carries no concrete address to classify.
        Some(Protocol::Ipcidr(_)) => false,
        Some(Protocol::Dns(host))
        | Some(Protocol::Dns4(host))
        | Some(Protocol::Dns6(host))
        | Some(Protocol::Dnsaddr(host)) => host != "localhost",
        Some(_) => true,
        None => false,
    }
}

/// Public-IP classification: rejects the unroutable ranges (loopback,
/// RFC1918, link-local, CGNAT, ULA, multicast, documentation, benchmarking,
/// reserved, unspecified).
fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => is_public_v4(addr),
        IpAddr::V6(addr) => match addr.to_ipv4_mapped() {
            Some(v4) => is_public_v4(v4),
            None => is_public_v6(addr),
        },
    }
}

fn is_public_v4(addr: Ipv4Addr) -> bool {
    let octets = addr.octets();
    !(addr.is_unspecified()
        || addr.is_loopback()
        || addr.is_private()
        || addr.is_link_local()
        || addr.is_broadcast()
        || addr.is_multicast()
        // CGNAT, 100.64.0.0/10
        || (octets[0] == 100 && octets[1] & 0xc0 == 0x40)
        // Documentation: 192.0.2.0/24, 198.51.100.0/24, 203.0.113.0/24
        || (octets[0] == 192 && octets[1] == 0 && octets[2] == 2)
        || (octets[0] == 198 && octets[1] == 51 && octets[2] == 100)
        || (octets[0] == 203 && octets[1] == 0 && octets[2] == 113)
        // Benchmarking, 198.18.0.0/15
        || (octets[0] == 198 && octets[1] & 0xfe == 18)
        // Reserved, 240.0.0.0/4
        || octets[0] >= 240)
}

fn is_public_v6(addr: Ipv6Addr) -> bool {
    let segments = addr.segments();
    !(addr.is_unspecified()
        || addr.is_loopback()
        || addr.is_multicast()
        // Unique-local, fc00::/7
        || segments[0] & 0xfe00 == 0xfc00
        // Link-local, fe80::/10
        || segments[0] & 0xffc0 == 0xfe80
        // Documentation, 2001:db8::/32
        || (segments[0] == 0x2001 && segments[1] == 0x0db8))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(addrs: &[&str]) -> Vec<String> {
        addrs
            .iter()
            .map(|a| a.parse::<Multiaddr>().expect("valid multiaddr"))
            .filter(is_publicly_dialable_addr)
            .map(|a| a.to_string())
            .collect()
    }

    #[test]
    fn empty_addr_is_not_dialable() {
        assert!(!is_publicly_dialable_addr(&Multiaddr::empty()));
    }

    #[test]
    fn bind_addr_is_not_dialable() {
        assert!(filter(&["/ip4/0.0.0.0"]).is_empty());
    }

    #[test]
    fn dns4_is_dialable_next_to_bind_addr() {
        assert_eq!(
            filter(&["/dns4/example.invalid", "/ip4/0.0.0.0"]),
            vec!["/dns4/example.invalid"]
        );
    }

    #[test]
    fn mixed_addrs_keep_public_only() {
        let got = filter(&[
            "/ip6/2604:1380:1000:6000::1/tcp/4001/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
            "/dnsaddr/sjc-1.bootstrap.libp2p.io/tcp/4001/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
            "/dnsaddr/localhost/tcp/4001/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
            "/ip4/147.75.83.83/tcp/4001/p2p/QmbLHAnMoJPWSCR5Zhtx6BHJX9KiKNN6tpvbUcqanj75Nb",
            "/ip4/127.0.0.1/tcp/4001",
            "/ip4/127.0.0.1/udp/4001",
        ]);
        assert_eq!(
            got,
            vec![
                "/ip6/2604:1380:1000:6000::1/tcp/4001/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
                "/dnsaddr/sjc-1.bootstrap.libp2p.io/tcp/4001/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
                "/ip4/147.75.83.83/tcp/4001/p2p/QmbLHAnMoJPWSCR5Zhtx6BHJX9KiKNN6tpvbUcqanj75Nb",
            ]
        );
    }

    #[test]
    fn dns_localhost_is_not_dialable() {
        let got = filter(&[
            "/dns/localhost/tcp/4001/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
            "/dns4/localhost/tcp/4001/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
            "/dns6/localhost/tcp/4001/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
            "/dnsaddr/localhost/tcp/4001/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
        ]);
        assert!(got.is_empty());
    }

    #[test]
    fn private_ranges_are_not_dialable() {
        assert!(filter(&[
            "/ip4/10.0.0.1/tcp/4001",
            "/ip4/192.168.1.10/tcp/4001",
            "/ip4/172.16.0.1/tcp/4001",
            "/ip4/100.64.0.1/tcp/4001",
            "/ip4/169.254.1.1/tcp/4001",
            "/ip6/fe80::1/tcp/4001",
            "/ip6/fd00::1/tcp/4001",
            "/ip6/::1/tcp/4001",
        ])
        .is_empty());
    }

    #[test]
    fn non_ip_non_dns_addr_is_dialable() {
        assert!(is_publicly_dialable_addr(
            &"/unix/gateway.sock".parse().expect("valid multiaddr")
        ));
    }
}
