//! Socket address formatting helpers.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Formats the advertised location of a TCP service.
///
/// When the service is bound to a wildcard address on a multi-homed host,
/// the advertised host is the local interface facing the querying client, so
/// every client sees an address within its own subnet.
pub fn service_location(bound: SocketAddr, client: Option<IpAddr>) -> Option<String> {
    let host = if bound.ip().is_unspecified() {
        local_address_towards(client?)?
    } else {
        bound.ip()
    };

    match host {
        IpAddr::V4(host) => Some(format!("tcp://{host}:{}", bound.port())),
        IpAddr::V6(host) => Some(format!("tcp://[{host}]:{}", bound.port())),
    }
}

/// Local address the OS would use to reach the given peer.
///
/// Works by "connecting" a UDP socket towards the peer, which selects a
/// route without sending anything.
pub fn local_address_towards(peer: IpAddr) -> Option<IpAddr> {
    let wildcard: SocketAddr = match peer {
        IpAddr::V4(_) => (IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0).into(),
        IpAddr::V6(_) => (IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0).into(),
    };

    let probe = std::net::UdpSocket::bind(wildcard).ok()?;
    probe.connect((peer, 9)).ok()?;
    probe.local_addr().ok().map(|address| address.ip())
}

#[cfg(test)]
mod net_tests {
    use super::*;

    #[test]
    fn concrete_addresses_format_directly() {
        let bound: SocketAddr = "192.168.1.5:5919".parse().unwrap();
        assert_eq!(
            service_location(bound, None),
            Some("tcp://192.168.1.5:5919".to_string())
        );
    }

    #[test]
    fn wildcard_addresses_need_a_client() {
        let bound: SocketAddr = "0.0.0.0:5919".parse().unwrap();
        assert_eq!(service_location(bound, None), None);
    }

    #[test]
    fn wildcard_addresses_resolve_towards_the_client() {
        let bound: SocketAddr = "0.0.0.0:5919".parse().unwrap();
        let location = service_location(bound, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(location, Some("tcp://127.0.0.1:5919".to_string()));
    }
}
