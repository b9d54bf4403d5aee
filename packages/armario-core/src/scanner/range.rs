//! Network range detection.
//!
//! Derives the /24 prefix to sweep from the caller's address (as seen by the
//! gateway, possibly through proxies) or, failing that, from the host's own
//! interfaces.

use std::net::{IpAddr, Ipv4Addr};

/// A local IPv4 interface address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalInterface {
    pub name: String,
    pub ip: Ipv4Addr,
    /// Loopback or otherwise host-internal
    pub internal: bool,
}

/// Enumerate the host's IPv4 interface addresses.
pub fn local_interfaces() -> Vec<LocalInterface> {
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces
            .into_iter()
            .filter_map(|iface| match iface.ip() {
                IpAddr::V4(ip) => Some(LocalInterface {
                    internal: iface.is_loopback() || ip.is_loopback(),
                    name: iface.name,
                    ip,
                }),
                IpAddr::V6(_) => None,
            })
            .collect(),
        Err(e) => {
            tracing::warn!("Failed to enumerate network interfaces: {}", e);
            Vec::new()
        }
    }
}

/// Normalize a raw client address: first hop of a forwarding chain,
/// trimmed, with any IPv6-mapped IPv4 wrapper removed.
pub fn normalize_client_address(raw: &str) -> Option<String> {
    let first = raw.split(',').next()?.trim();
    if first.is_empty() {
        return None;
    }

    let lower = first.to_ascii_lowercase();
    let unwrapped = match lower.strip_prefix("::ffff:") {
        Some(rest) if rest.contains('.') => &first[first.len() - rest.len()..],
        _ => first,
    };

    Some(unwrapped.to_string())
}

/// Addresses a locker can live on: private, loopback or link-local.
/// Nothing outside these is ever probed or commanded on a caller's behalf.
pub fn is_local_ipv4(ip: Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local()
}

/// Whether every host of a three-octet prefix is a local address.
pub fn is_local_prefix(prefix: &str) -> bool {
    format!("{}.1", prefix)
        .parse::<Ipv4Addr>()
        .is_ok_and(is_local_ipv4)
}

/// Three-octet prefix of a LAN address (`"10.0.0.5"` -> `"10.0.0"`).
/// Loopback, unspecified, public and non-IPv4 input yield `None`.
pub fn prefix_from_address(address: &str) -> Option<String> {
    let ip: Ipv4Addr = address.trim().parse().ok()?;
    if ip.is_loopback() || !is_local_ipv4(ip) {
        return None;
    }
    Some(prefix_of(ip))
}

/// Pick a prefix from local interfaces: a private non-internal address
/// first, then any non-internal address.
pub fn prefix_from_interfaces(interfaces: &[LocalInterface]) -> Option<String> {
    let external = || interfaces.iter().filter(|i| !i.internal);

    external()
        .find(|i| i.ip.is_private())
        .or_else(|| external().next())
        .map(|i| prefix_of(i.ip))
}

/// Resolve the prefix to sweep using the host's live interfaces.
pub fn resolve_prefix(client_address: Option<&str>) -> Option<String> {
    resolve_prefix_with(client_address, &local_interfaces())
}

/// Resolve the prefix to sweep against an explicit interface list.
pub fn resolve_prefix_with(
    client_address: Option<&str>,
    interfaces: &[LocalInterface],
) -> Option<String> {
    if let Some(prefix) = client_address
        .and_then(normalize_client_address)
        .and_then(|addr| prefix_from_address(&addr))
    {
        tracing::debug!("Using network range {}.x from client address", prefix);
        return Some(prefix);
    }

    let prefix = prefix_from_interfaces(interfaces);
    match &prefix {
        Some(p) => tracing::debug!("Using network range {}.x from local interfaces", p),
        None => tracing::debug!("No network range could be determined"),
    }
    prefix
}

/// Accept a user-supplied range in any of the forms `192.168.1`,
/// `192.168.1.`, `192.168.1.x`, `192.168.1.0` or `192.168.1.0/24`
/// and return the canonical three-octet prefix.
pub fn parse_prefix(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.contains('/') {
        let network = trimmed.parse::<ipnetwork::Ipv4Network>().ok()?;
        if network.prefix() != 24 {
            return None;
        }
        return Some(prefix_of(network.network()));
    }

    let parts: Vec<&str> = trimmed.trim_end_matches('.').split('.').collect();
    let octets = match parts.len() {
        3 => &parts[..],
        4 if matches!(parts[3], "x" | "X" | "*") || parts[3].parse::<u8>().is_ok() => &parts[..3],
        _ => return None,
    };

    let parsed: Option<Vec<u8>> = octets.iter().map(|o| o.parse::<u8>().ok()).collect();
    parsed.map(|o| format!("{}.{}.{}", o[0], o[1], o[2]))
}

fn prefix_of(ip: Ipv4Addr) -> String {
    let [a, b, c, _] = ip.octets();
    format!("{}.{}.{}", a, b, c)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(name: &str, ip: [u8; 4], internal: bool) -> LocalInterface {
        LocalInterface {
            name: name.to_string(),
            ip: Ipv4Addr::from(ip),
            internal,
        }
    }

    #[test]
    fn test_client_address_prefix() {
        assert_eq!(resolve_prefix_with(Some("10.0.0.5"), &[]), Some("10.0.0".to_string()));
    }

    #[test]
    fn test_forwarded_chain_uses_first_hop() {
        assert_eq!(
            resolve_prefix_with(Some(" 192.168.15.30 , 10.1.1.1"), &[]),
            Some("192.168.15".to_string())
        );
    }

    #[test]
    fn test_ipv6_mapped_address_is_unwrapped() {
        assert_eq!(
            normalize_client_address("::ffff:192.168.0.12"),
            Some("192.168.0.12".to_string())
        );
        assert_eq!(
            resolve_prefix_with(Some("::FFFF:172.20.3.4"), &[]),
            Some("172.20.3".to_string())
        );
    }

    #[test]
    fn test_loopback_falls_back_to_interfaces() {
        let interfaces = vec![
            iface("lo", [127, 0, 0, 1], true),
            iface("wlan0", [192, 168, 1, 42], false),
        ];
        assert_eq!(
            resolve_prefix_with(Some("::1"), &interfaces),
            Some("192.168.1".to_string())
        );
        assert_eq!(
            resolve_prefix_with(Some("127.0.0.1"), &interfaces),
            Some("192.168.1".to_string())
        );
    }

    #[test]
    fn test_private_interface_preferred() {
        let interfaces = vec![
            iface("lo", [127, 0, 0, 1], true),
            iface("eth0", [203, 0, 113, 7], false),
            iface("eth1", [172, 16, 4, 2], false),
        ];
        assert_eq!(prefix_from_interfaces(&interfaces), Some("172.16.4".to_string()));
    }

    #[test]
    fn test_public_interface_as_last_resort() {
        let interfaces = vec![iface("eth0", [203, 0, 113, 7], false)];
        assert_eq!(prefix_from_interfaces(&interfaces), Some("203.0.113".to_string()));
    }

    #[test]
    fn test_nothing_usable() {
        let interfaces = vec![iface("lo", [127, 0, 0, 1], true)];
        assert_eq!(resolve_prefix_with(None, &interfaces), None);
        assert_eq!(resolve_prefix_with(Some("garbage"), &[]), None);
        assert_eq!(resolve_prefix_with(Some(""), &[]), None);
    }

    #[test]
    fn test_public_client_address_is_ignored() {
        assert_eq!(prefix_from_address("8.8.8.8"), None);
        assert_eq!(resolve_prefix_with(Some("8.8.8.8"), &[]), None);

        let interfaces = vec![iface("eth0", [192, 168, 0, 20], false)];
        assert_eq!(
            resolve_prefix_with(Some("203.0.113.9, 10.0.0.1"), &interfaces),
            Some("192.168.0".to_string())
        );
    }

    #[test]
    fn test_local_prefixes() {
        assert!(is_local_prefix("192.168.1"));
        assert!(is_local_prefix("10.20.30"));
        assert!(is_local_prefix("172.16.4"));
        assert!(is_local_prefix("169.254.1"));
        assert!(is_local_prefix("127.0.0"));
        assert!(!is_local_prefix("8.8.8"));
        assert!(!is_local_prefix("172.32.0"));
        assert!(!is_local_prefix("garbage"));
    }

    #[test]
    fn test_malformed_addresses_rejected() {
        assert_eq!(prefix_from_address("192.168.1"), None);
        assert_eq!(prefix_from_address("192.168.1.300"), None);
        assert_eq!(prefix_from_address("0.0.0.0"), None);
    }

    #[test]
    fn test_parse_prefix_forms() {
        for input in ["192.168.1", "192.168.1.", "192.168.1.x", "192.168.1.0", "192.168.1.0/24"] {
            assert_eq!(parse_prefix(input), Some("192.168.1".to_string()), "{}", input);
        }
        assert_eq!(parse_prefix("192.168.1.77/24"), Some("192.168.1".to_string()));
        assert_eq!(parse_prefix("192.168.1.0/16"), None);
        assert_eq!(parse_prefix("192.168"), None);
        assert_eq!(parse_prefix("192.168.256"), None);
        assert_eq!(parse_prefix("a.b.c"), None);
    }
}
