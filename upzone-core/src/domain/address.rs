//! Peer addresses: parsing, resolution and their shared-memory form.

use crate::error::RegistryError;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};

/// Port assumed when the address names none.
pub const DEFAULT_PORT: u16 = 80;

/// Longest accepted unix socket path (`sun_path` minus the terminator).
pub const MAX_UNIX_PATH: usize = 107;

const UNIX_PREFIX: &str = "unix:";

/// Turns a host name into socket addresses.
///
/// Resolution runs before the zone lock is taken, so an implementation
/// may block.
pub trait Resolver {
    /// Resolve `host`, attaching `port` to every result.
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>>;
}

/// Resolver backed by the operating system (`getaddrinfo`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        Ok((host, port).to_socket_addrs()?.collect())
    }
}

/// Resolver that refuses every name. Only IP literals get through.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiteralResolver;

impl Resolver for LiteralResolver {
    fn resolve(&self, host: &str, _port: u16) -> io::Result<Vec<SocketAddr>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("name lookup disabled for {host:?}"),
        ))
    }
}

/// A resolved network endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// TCP endpoint.
    Inet(SocketAddr),
    /// Unix domain socket path.
    Unix(String),
}

impl Endpoint {
    /// Length of the matching C `sockaddr` structure.
    pub fn socklen(&self) -> u32 {
        match self {
            Endpoint::Inet(SocketAddr::V4(_)) => 16,
            Endpoint::Inet(SocketAddr::V6(_)) => 28,
            Endpoint::Unix(path) => 2 + path.len() as u32 + 1,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Inet(addr) => addr.fmt(f),
            Endpoint::Unix(path) => write!(f, "{UNIX_PREFIX}{path}"),
        }
    }
}

/// A peer address as given by the operator, with its resolved endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    name: String,
    endpoint: Endpoint,
}

impl PeerAddress {
    /// Parse and resolve `address`.
    ///
    /// Accepts `host:port`, `host`, `[v6]:port`, `[v6]` and `unix:/path`.
    /// A missing port means [`DEFAULT_PORT`]. Names go through `resolver`
    /// and the first result wins.
    pub fn parse(address: &str, resolver: &dyn Resolver) -> Result<Self, RegistryError> {
        let invalid = |reason: &str| RegistryError::invalid_address(address, reason);

        if address.is_empty() {
            return Err(invalid("empty address"));
        }

        if let Some(path) = address.strip_prefix(UNIX_PREFIX) {
            if path.is_empty() {
                return Err(invalid("empty unix socket path"));
            }
            if path.len() > MAX_UNIX_PATH {
                return Err(invalid("unix socket path too long"));
            }
            return Ok(Self::new(address, Endpoint::Unix(path.to_owned())));
        }

        let (host, port) = split_host_port(address).map_err(invalid)?;

        let addr = match host.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, port),
            Err(_) => resolver
                .resolve(host, port)
                .map_err(|e| RegistryError::invalid_address(address, format!("host not found: {e}")))?
                .into_iter()
                .next()
                .ok_or_else(|| invalid("host not found"))?,
        };

        Ok(Self::new(address, Endpoint::Inet(addr)))
    }

    /// Pair an already resolved endpoint with its display name.
    pub fn new(name: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            name: name.into(),
            endpoint,
        }
    }

    /// The address exactly as given.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The resolved endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

fn split_host_port(address: &str) -> Result<(&str, u16), &'static str> {
    if let Some(rest) = address.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or("missing ']'")?;
        if host.parse::<Ipv6Addr>().is_err() {
            return Err("invalid IPv6 literal");
        }
        let port = match after {
            "" => DEFAULT_PORT,
            _ => parse_port(after.strip_prefix(':').ok_or("junk after ']'")?)?,
        };
        return Ok((host, port));
    }

    let (host, port) = match address.rsplit_once(':') {
        None => (address, DEFAULT_PORT),
        Some((host, port)) if !host.contains(':') => (host, parse_port(port)?),
        Some(_) if address.parse::<Ipv6Addr>().is_ok() => (address, DEFAULT_PORT),
        Some(_) => return Err("IPv6 address must be enclosed in brackets"),
    };

    if host.is_empty() {
        return Err("no host");
    }
    Ok((host, port))
}

fn parse_port(port: &str) -> Result<u16, &'static str> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err("invalid port"),
        Ok(port) => Ok(port),
    }
}

pub(crate) const FAMILY_UNIX: u16 = 1;
pub(crate) const FAMILY_INET: u16 = 2;
pub(crate) const FAMILY_INET6: u16 = 10;

/// Endpoint as stored in a peer record. Unix paths are not copied: they
/// are recovered from the peer name.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SockAddrRecord {
    family: u16,
    port: u16,
    flowinfo: u32,
    addr: [u8; 16],
    scope_id: u32,
}

impl SockAddrRecord {
    pub(crate) fn encode(endpoint: &Endpoint) -> Self {
        match endpoint {
            Endpoint::Inet(SocketAddr::V4(v4)) => {
                let mut addr = [0u8; 16];
                addr[..4].copy_from_slice(&v4.ip().octets());
                Self {
                    family: FAMILY_INET,
                    port: v4.port(),
                    addr,
                    ..Self::default()
                }
            }
            Endpoint::Inet(SocketAddr::V6(v6)) => Self {
                family: FAMILY_INET6,
                port: v6.port(),
                flowinfo: v6.flowinfo(),
                addr: v6.ip().octets(),
                scope_id: v6.scope_id(),
            },
            Endpoint::Unix(_) => Self {
                family: FAMILY_UNIX,
                ..Self::default()
            },
        }
    }

    pub(crate) fn decode(&self, name: &str) -> Option<Endpoint> {
        match self.family {
            FAMILY_INET => {
                let octets: [u8; 4] = self.addr[..4].try_into().ok()?;
                Some(Endpoint::Inet(SocketAddr::V4(SocketAddrV4::new(
                    Ipv4Addr::from(octets),
                    self.port,
                ))))
            }
            FAMILY_INET6 => Some(Endpoint::Inet(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(self.addr),
                self.port,
                self.flowinfo,
                self.scope_id,
            )))),
            FAMILY_UNIX => name
                .strip_prefix(UNIX_PREFIX)
                .map(|path| Endpoint::Unix(path.to_owned())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    struct FixedResolver(Vec<SocketAddr>);

    impl Resolver for FixedResolver {
        fn resolve(&self, _host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
            Ok(self
                .0
                .iter()
                .map(|addr| SocketAddr::new(addr.ip(), port))
                .collect())
        }
    }

    fn parse(address: &str) -> Result<PeerAddress, RegistryError> {
        PeerAddress::parse(address, &LiteralResolver)
    }

    #[test]
    fn parses_literals_with_and_without_port() {
        let peer = parse("10.0.0.1:8080").unwrap();
        assert_eq!(peer.name(), "10.0.0.1:8080");
        assert_eq!(
            peer.endpoint(),
            &Endpoint::Inet("10.0.0.1:8080".parse().unwrap())
        );

        let peer = parse("10.0.0.2").unwrap();
        assert_eq!(peer.endpoint(), &Endpoint::Inet("10.0.0.2:80".parse().unwrap()));

        let peer = parse("[::1]:9000").unwrap();
        assert_eq!(peer.endpoint(), &Endpoint::Inet("[::1]:9000".parse().unwrap()));
        assert_eq!(peer.endpoint().socklen(), 28);

        let peer = parse("[fe80::1]").unwrap();
        assert_eq!(peer.endpoint(), &Endpoint::Inet("[fe80::1]:80".parse().unwrap()));
    }

    #[test]
    fn parses_unix_sockets() {
        let peer = parse("unix:/run/app.sock").unwrap();
        assert_eq!(peer.endpoint(), &Endpoint::Unix("/run/app.sock".into()));
        assert_eq!(peer.endpoint().socklen(), 2 + 13 + 1);
        assert_eq!(peer.endpoint().to_string(), "unix:/run/app.sock");
    }

    #[test]
    fn names_go_through_the_resolver() {
        let resolver = FixedResolver(vec!["192.168.1.7:0".parse().unwrap()]);
        let peer = PeerAddress::parse("backend.internal:81", &resolver).unwrap();
        assert_eq!(peer.name(), "backend.internal:81");
        assert_eq!(
            peer.endpoint(),
            &Endpoint::Inet("192.168.1.7:81".parse().unwrap())
        );

        let empty = FixedResolver(Vec::new());
        let err = PeerAddress::parse("nowhere", &empty).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidAddress);
    }

    #[test]
    fn rejects_malformed_addresses() {
        for bad in [
            "",
            "10.0.0.1:0",
            "10.0.0.1:65536",
            "10.0.0.1:http",
            ":80",
            "[::1",
            "[nope]:80",
            "[::1]x",
            "fe80::1:zz",
            "unix:",
            "backend.internal",
        ] {
            let err = parse(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidAddress, "{bad:?}");
        }

        let long = format!("unix:/{}", "p".repeat(MAX_UNIX_PATH));
        assert!(parse(&long).is_err());
    }

    #[test]
    fn socket_records_decode_to_the_same_endpoint() {
        for address in ["10.1.2.3:443", "[2001:db8::5]:8443", "unix:/tmp/s"] {
            let peer = parse(address).unwrap();
            let record = SockAddrRecord::encode(peer.endpoint());
            assert_eq!(record.decode(peer.name()).as_ref(), Some(peer.endpoint()));
        }
    }
}
