//! Target address and metadata value types.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::error::TunnelError;

/// Maximum length of a domain name in bytes.
pub const MAX_DOMAIN_LEN: usize = 255;

/// Transport network of an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => f.write_str("tcp"),
            Network::Udp => f.write_str("udp"),
        }
    }
}

/// Kind of host an address names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    Domain,
    Ipv4,
    Ipv6,
}

/// Host part of an address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    Domain(String),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
}

impl Host {
    /// Parse a host, accepting bracketed IPv6 literals.
    pub fn parse(host: &str) -> Self {
        let bare = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        match bare.parse::<IpAddr>() {
            Ok(ip) => Host::from(ip),
            Err(_) => Host::Domain(host.to_string()),
        }
    }

    pub fn address_type(&self) -> AddressType {
        match self {
            Host::Domain(_) => AddressType::Domain,
            Host::Ipv4(_) => AddressType::Ipv4,
            Host::Ipv6(_) => AddressType::Ipv6,
        }
    }

    /// The IP address, if this host is a literal.
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Host::Domain(_) => None,
            Host::Ipv4(ip) => Some(IpAddr::V4(*ip)),
            Host::Ipv6(ip) => Some(IpAddr::V6(*ip)),
        }
    }
}

impl From<IpAddr> for Host {
    fn from(ip: IpAddr) -> Self {
        match ip.to_canonical() {
            IpAddr::V4(v4) => Host::Ipv4(v4),
            IpAddr::V6(v6) => Host::Ipv6(v6),
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Domain(d) => f.write_str(d),
            Host::Ipv4(ip) => write!(f, "{ip}"),
            Host::Ipv6(ip) => write!(f, "[{ip}]"),
        }
    }
}

/// A target address: network, host and port.
///
/// Domain hosts are resolved lazily by [`Address::resolve_ip`]; the first
/// successful lookup is cached and shared by every clone.
#[derive(Clone)]
pub struct Address {
    network: Network,
    host: Host,
    port: u16,
    resolved: Arc<OnceCell<IpAddr>>,
}

impl Address {
    pub fn new(network: Network, host: Host, port: u16) -> Self {
        let resolved = match host.ip() {
            Some(ip) => OnceCell::new_with(Some(ip)),
            None => OnceCell::new(),
        };
        Self {
            network,
            host,
            port,
            resolved: Arc::new(resolved),
        }
    }

    /// Build an address from a host string such as `example.com` or `::1`.
    pub fn from_host(network: Network, host: &str, port: u16) -> Self {
        Self::new(network, Host::parse(host), port)
    }

    pub fn from_socket_addr(network: Network, addr: SocketAddr) -> Self {
        Self::new(network, Host::from(addr.ip()), addr.port())
    }

    /// Parse `host:port`, with IPv6 hosts in brackets.
    pub fn parse(network: Network, s: &str) -> Result<Self, TunnelError> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TunnelError::InvalidAddress(s.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| TunnelError::InvalidAddress(s.to_string()))?;
        if host.is_empty() {
            return Err(TunnelError::InvalidAddress(s.to_string()));
        }
        Ok(Self::from_host(network, host, port))
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn address_type(&self) -> AddressType {
        self.host.address_type()
    }

    /// Same host and port on another network.
    pub fn with_network(&self, network: Network) -> Self {
        Self {
            network,
            host: self.host.clone(),
            port: self.port,
            resolved: self.resolved.clone(),
        }
    }

    /// Whether this address may be forwarded upstream.
    ///
    /// Rejects port 0, unspecified IPs and empty or oversized domains.
    pub fn is_valid(&self) -> bool {
        if self.port == 0 {
            return false;
        }
        match &self.host {
            Host::Domain(d) => !d.is_empty() && d.len() <= MAX_DOMAIN_LEN,
            Host::Ipv4(ip) => !ip.is_unspecified(),
            Host::Ipv6(ip) => !ip.is_unspecified(),
        }
    }

    /// The socket address, if the host is an IP literal or already resolved.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.resolved
            .get()
            .map(|ip| SocketAddr::new(*ip, self.port))
    }

    /// Resolve the host to an IP, caching the result.
    pub async fn resolve_ip(&self) -> Result<IpAddr, TunnelError> {
        let ip = self
            .resolved
            .get_or_try_init(|| async {
                let Host::Domain(domain) = &self.host else {
                    return Err(TunnelError::Resolve(self.to_string()));
                };
                let mut addrs = tokio::net::lookup_host((domain.as_str(), self.port))
                    .await
                    .map_err(|_| TunnelError::Resolve(domain.clone()))?;
                addrs
                    .next()
                    .map(|a| a.ip())
                    .ok_or_else(|| TunnelError::Resolve(domain.clone()))
            })
            .await?;
        Ok(*ip)
    }

    /// Resolve to a socket address.
    pub async fn to_socket_addr(&self) -> Result<SocketAddr, TunnelError> {
        Ok(SocketAddr::new(self.resolve_ip().await?, self.port))
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.network == other.network && self.host == other.host && self.port == other.port
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.network.hash(state);
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.network, self.host, self.port)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Routing information attached to a stream or to a single datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub address: Address,
}

impl Metadata {
    pub fn new(address: Address) -> Self {
        Self { address }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn is_valid(&self) -> bool {
        self.address.is_valid()
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_domain() {
        let addr = Address::parse(Network::Tcp, "example.com:80").unwrap();
        assert_eq!(addr.address_type(), AddressType::Domain);
        assert_eq!(addr.port(), 80);
        assert_eq!(addr.to_string(), "example.com:80");
        assert!(addr.socket_addr().is_none());
        assert!(addr.is_valid());
    }

    #[test]
    fn test_parse_ipv6() {
        let addr = Address::parse(Network::Udp, "[::1]:53").unwrap();
        assert_eq!(addr.address_type(), AddressType::Ipv6);
        assert_eq!(addr.to_string(), "[::1]:53");
        assert_eq!(addr.socket_addr(), Some("[::1]:53".parse().unwrap()));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Address::parse(Network::Tcp, "no-port").is_err());
        assert!(Address::parse(Network::Tcp, "host:http").is_err());
        assert!(Address::parse(Network::Tcp, ":80").is_err());
    }

    #[test]
    fn test_mapped_ipv4_is_canonical() {
        let mapped: SocketAddr = "[::ffff:10.0.0.1]:443".parse().unwrap();
        let addr = Address::from_socket_addr(Network::Tcp, mapped);
        assert_eq!(addr.address_type(), AddressType::Ipv4);
        assert_eq!(addr.to_string(), "10.0.0.1:443");
    }

    #[test]
    fn test_validity() {
        assert!(!Address::from_host(Network::Tcp, "example.com", 0).is_valid());
        assert!(!Address::from_host(Network::Tcp, "0.0.0.0", 80).is_valid());
        assert!(!Address::new(Network::Tcp, Host::Domain(String::new()), 80).is_valid());
        let long = "a".repeat(MAX_DOMAIN_LEN + 1);
        assert!(!Address::from_host(Network::Tcp, &long, 80).is_valid());
        assert!(Address::from_host(Network::Udp, "1.1.1.1", 53).is_valid());
    }

    #[test]
    fn test_equality_includes_network() {
        let a = Address::from_host(Network::Tcp, "example.com", 80);
        let b = a.with_network(Network::Udp);
        assert_ne!(a, b);
        assert_eq!(a, b.with_network(Network::Tcp));
    }

    #[tokio::test]
    async fn test_resolve_literal() {
        let addr = Address::from_host(Network::Tcp, "127.0.0.1", 8080);
        let sa = addr.to_socket_addr().await.unwrap();
        assert_eq!(sa, "127.0.0.1:8080".parse().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_localhost_is_cached() {
        let addr = Address::from_host(Network::Tcp, "localhost", 80);
        let ip = addr.resolve_ip().await.unwrap();
        assert!(ip.is_loopback());
        let clone = addr.clone();
        assert_eq!(clone.socket_addr(), Some(SocketAddr::new(ip, 80)));
    }
}
