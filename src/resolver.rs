//! Client address resolution
//!
//! Forwarded-address headers are only honoured when the direct peer is a
//! configured trusted proxy; otherwise the peer address is authoritative.

use ipnet::IpNet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::config::ResolverConfig;
use crate::models::RequestMeta;

/// A resolved client address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedAddress {
    pub address: IpAddr,
    /// Whether the address is believed to be globally routable
    pub routable: bool,
}

impl ResolvedAddress {
    pub fn new(address: IpAddr) -> Self {
        ResolvedAddress {
            address,
            routable: is_routable(&address),
        }
    }
}

/// Extracts the client address from request metadata
pub struct AddressResolver {
    trusted_proxies: Vec<IpNet>,
    headers: Vec<String>,
    use_first_ip: bool,
}

impl AddressResolver {
    /// Build a resolver from configuration. Unparseable proxy entries are
    /// skipped with a warning; `Config::validate` rejects them up front.
    pub fn new(config: &ResolverConfig) -> Self {
        let trusted_proxies = config
            .trusted_proxies
            .iter()
            .filter_map(|entry| {
                let parsed = parse_network(entry);
                if parsed.is_none() {
                    log::warn!("Ignoring invalid trusted proxy entry: {}", entry);
                }
                parsed
            })
            .collect();

        AddressResolver {
            trusted_proxies,
            headers: config
                .forwarded_headers
                .iter()
                .map(|h| h.to_lowercase())
                .collect(),
            use_first_ip: config.use_first_forwarded,
        }
    }

    /// Resolve the client address of a request
    ///
    /// Returns `None` when nothing parses as an IP literal; callers skip
    /// tracking for such requests.
    pub fn resolve(&self, request: &RequestMeta) -> Option<ResolvedAddress> {
        let peer = request.remote_addr.as_deref().and_then(parse_peer_addr);

        match peer {
            Some(peer) if self.is_trusted_proxy(&peer) => self
                .forwarded_address(request)
                .or(Some(peer))
                .map(ResolvedAddress::new),
            Some(peer) => Some(ResolvedAddress::new(peer)),
            None => None,
        }
    }

    fn is_trusted_proxy(&self, ip: &IpAddr) -> bool {
        let ip = canonical_address(ip);
        self.trusted_proxies.iter().any(|net| net.contains(&ip))
    }

    /// First valid address from the configured forwarding headers
    fn forwarded_address(&self, request: &RequestMeta) -> Option<IpAddr> {
        self.headers.iter().find_map(|name| {
            let value = request.header(name)?;
            let mut candidates = value
                .split(',')
                .map(str::trim)
                .filter_map(|s| s.parse::<IpAddr>().ok())
                .map(|ip| canonical_address(&ip));

            if self.use_first_ip {
                candidates.next()
            } else {
                candidates.last()
            }
        })
    }
}

/// Parse a trusted proxy entry, either a CIDR network or a single address
pub fn parse_network(entry: &str) -> Option<IpNet> {
    let entry = entry.trim();
    if let Ok(net) = entry.parse::<IpNet>() {
        return Some(net);
    }

    match entry.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => ipnet::Ipv4Net::new(v4, 32).ok().map(IpNet::V4),
        Ok(IpAddr::V6(v6)) => ipnet::Ipv6Net::new(v6, 128).ok().map(IpNet::V6),
        Err(_) => None,
    }
}

/// Parse a peer address given as `ip`, `ip:port` or `[v6]:port`
fn parse_peer_addr(value: &str) -> Option<IpAddr> {
    let value = value.trim();
    value
        .parse::<IpAddr>()
        .ok()
        .or_else(|| value.parse::<SocketAddr>().ok().map(|s| s.ip()))
        .map(|ip| canonical_address(&ip))
}

/// Canonical form used for every stored or compared address: IPv4-mapped
/// IPv6 addresses are unwrapped to IPv4
pub fn canonical_address(ip: &IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(*v6)),
        v4 => *v4,
    }
}

/// Whether an address is globally routable
pub fn is_routable(ip: &IpAddr) -> bool {
    match canonical_address(ip) {
        IpAddr::V4(v4) => is_routable_v4(&v4),
        IpAddr::V6(v6) => is_routable_v6(&v6),
    }
}

fn is_routable_v4(ip: &Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();
    let shared = a == 100 && (b & 0xc0) == 64;
    let benchmarking = a == 198 && (b & 0xfe) == 18;
    let protocol_assignments = a == 192 && b == 0 && c == 0;
    let reserved = a >= 240;

    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_unspecified()
        || ip.is_multicast()
        || a == 0
        || shared
        || benchmarking
        || protocol_assignments
        || reserved)
}

fn is_routable_v6(ip: &Ipv6Addr) -> bool {
    let segments = ip.segments();
    let unique_local = (segments[0] & 0xfe00) == 0xfc00;
    let link_local = (segments[0] & 0xffc0) == 0xfe80;
    let documentation = segments[0] == 0x2001 && segments[1] == 0x0db8;

    !(ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        || unique_local
        || link_local
        || documentation)
}
