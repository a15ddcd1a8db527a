//! Picks the LAN address the router should forward to.

use core::net::Ipv4Addr;

use tracing::debug;

use super::GatewayError;

/// Chooses among candidate addresses.
///
/// A single candidate wins unconditionally. With several, the `192.168.x.x` address with
/// the highest third octet wins, since secondary virtual adapters tend to sit on low
/// subnets. Failing that, the first candidate.
///
/// # Errors
///
/// Returns [`GatewayError::NoLocalAddress`] for an empty slice.
pub fn select_local_address(candidates: &[Ipv4Addr]) -> Result<Ipv4Addr, GatewayError> {
    match candidates {
        [] => Err(GatewayError::NoLocalAddress),
        [only] => Ok(*only),
        [first, ..] => Ok(candidates
            .iter()
            .filter(|ip| matches!(ip.octets(), [192, 168, _, _]))
            .max_by_key(|ip| ip.octets()[2])
            .copied()
            .unwrap_or(*first)),
    }
}

const fn is_usable(ip: Ipv4Addr) -> bool {
    !ip.is_loopback() && !ip.is_link_local() && !ip.is_unspecified()
}

#[cfg(unix)]
fn candidate_addresses() -> Result<Vec<Ipv4Addr>, GatewayError> {
    use nix::{ifaddrs, net::if_::InterfaceFlags};

    let addrs = ifaddrs::getifaddrs()
        .map_err(|e| GatewayError::Transport(format!("listing interfaces: {e}")))?;
    Ok(addrs
        .filter(|ifa| ifa.flags.contains(InterfaceFlags::IFF_UP))
        .filter(|ifa| !ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK))
        .filter_map(|ifa| {
            let sin = ifa.address.as_ref()?.as_sockaddr_in()?;
            let ip = Ipv4Addr::from(sin.ip());
            debug!(interface = %ifa.interface_name, %ip, "Local IPv4 address");
            Some(ip)
        })
        .filter(|ip| is_usable(*ip))
        .collect())
}

#[cfg(not(unix))]
fn candidate_addresses() -> Result<Vec<Ipv4Addr>, GatewayError> {
    use core::net::{IpAddr, SocketAddr};
    use std::net::UdpSocket;

    // No packet is sent; connecting only makes the OS pick the outbound interface.
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect(SocketAddr::from(([8, 8, 8, 8], 53)))?;
    Ok(match socket.local_addr()?.ip() {
        IpAddr::V4(ip) if is_usable(ip) => vec![ip],
        _ => Vec::new(),
    })
}

/// Enumerates interfaces and selects the address to forward to.
///
/// # Errors
///
/// Returns [`GatewayError::NoLocalAddress`] if no interface has a usable IPv4 address.
pub fn resolve_local_address() -> Result<Ipv4Addr, GatewayError> {
    let candidates = candidate_addresses()?;
    let chosen = select_local_address(&candidates)?;
    debug!(?candidates, %chosen, "Selected local address");
    Ok(chosen)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_third_octet_wins() {
        let picked = select_local_address(&[
            Ipv4Addr::new(192, 168, 1, 5),
            Ipv4Addr::new(192, 168, 31, 10),
        ])
        .unwrap();
        assert_eq!(picked, Ipv4Addr::new(192, 168, 31, 10), "main LAN expected");
    }

    #[test]
    fn single_candidate_is_returned_as_is() {
        let only = Ipv4Addr::new(10, 0, 0, 7);
        assert_eq!(select_local_address(&[only]).unwrap(), only, "no heuristic for one");
    }

    #[test]
    fn no_candidates_is_an_error() {
        assert!(
            matches!(select_local_address(&[]), Err(GatewayError::NoLocalAddress)),
            "empty list has no answer"
        );
    }

    #[test]
    fn non_192_168_falls_back_to_first() {
        let first = Ipv4Addr::new(10, 0, 0, 7);
        let picked = select_local_address(&[first, Ipv4Addr::new(172, 16, 9, 1)]).unwrap();
        assert_eq!(picked, first, "first candidate when heuristic does not apply");
    }

    #[test]
    fn loopback_and_link_local_are_unusable() {
        assert!(!is_usable(Ipv4Addr::LOCALHOST), "loopback");
        assert!(!is_usable(Ipv4Addr::new(169, 254, 3, 4)), "link-local");
        assert!(is_usable(Ipv4Addr::new(192, 168, 1, 5)), "private LAN");
    }
}
