//! Address grammar: `host:port`, `/abs/path` for Unix sockets, `*:port` wildcard.
//!
//! # Why
//! [`Socket::connect`](crate::socket::Socket::connect) and
//! [`Socket::listen`](crate::socket::Socket::listen) both need to turn a
//! single string into "connect/bind to this concrete address," and the
//! source accepts the same three shapes for both operations. Parsing is in
//! scope; the asynchronous DNS resolver that backs a bare hostname stays an
//! external collaborator, so this module only goes as far as recognizing
//! *that* a string names an unresolved host and leaving resolution to
//! [`resolve`].
//!
//! # How
//! A literal IPv4/IPv6 address or a `/`-prefixed path needs no resolver;
//! anything else is a DNS name carried unresolved until [`resolve`] turns it
//! into a concrete [`std::net::SocketAddr`] on a background thread (the
//! stand-in for the source's `EvdResolver`), matching "if a literal IP, use
//! it directly, else resolve asynchronously."

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use crate::error::{EvdError, ErrorKind};

/// A parsed address, not yet necessarily resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// A literal IP address and port, usable directly.
    Literal(SocketAddr),
    /// A DNS hostname and port, requiring [`resolve`].
    Unresolved(String, u16),
    /// `*:port` — wildcard bind in the socket's current family.
    Wildcard(u16),
    /// An absolute filesystem path naming a Unix domain socket.
    Unix(PathBuf),
}

impl Address {
    /// Parse the grammar from §6: `/abs/path` for Unix, `*:port` for
    /// wildcard, else `host:port` where host may be a literal IP or a name.
    pub fn parse(s: &str) -> crate::error::Result<Address> {
        if s.starts_with('/') {
            return Ok(Address::Unix(PathBuf::from(s)));
        }

        let (host, port_str) = split_host_port(s)
            .ok_or_else(|| EvdError::new(ErrorKind::InvalidArgument, format!("malformed address: {s}")))?;
        let port: u16 = port_str
            .parse()
            .map_err(|_| EvdError::new(ErrorKind::InvalidArgument, format!("invalid port in address: {s}")))?;

        if host == "*" {
            return Ok(Address::Wildcard(port));
        }

        // Bracketed IPv6 literal, e.g. "[::1]:8080".
        let bare_host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
        if let Ok(ip) = bare_host.parse::<IpAddr>() {
            return Ok(Address::Literal(SocketAddr::new(ip, port)));
        }

        Ok(Address::Unresolved(bare_host.to_string(), port))
    }

    /// Resolve to a concrete socket address, synchronously. `Literal` and
    /// `Wildcard` resolve without I/O; `Unresolved` performs a blocking DNS
    /// lookup, so callers drive this off the context's thread (see
    /// [`resolve_async`]).
    pub fn resolve_family(&self, prefer_v6: bool) -> crate::error::Result<SocketAddr> {
        match self {
            Address::Literal(addr) => Ok(*addr),
            Address::Wildcard(port) => {
                let ip = if prefer_v6 { IpAddr::from([0u16; 8]) } else { IpAddr::from([0u8; 4]) };
                Ok(SocketAddr::new(ip, *port))
            }
            Address::Unresolved(host, port) => resolve_host(host, *port),
            Address::Unix(_) => Err(EvdError::new(ErrorKind::InvalidArgument, "unix address has no inet resolution")),
        }
    }
}

fn split_host_port(s: &str) -> Option<(&str, &str)> {
    if let Some(rest) = s.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')?;
        let port = rest.strip_prefix(':')?;
        return Some((host, port));
    }
    s.rsplit_once(':')
}

/// Picks the first resolved address whose family matches `prefer_v6`, or
/// simply the first one otherwise — "picks the first address whose family
/// matches (or the first, and adopts its family)".
fn resolve_host(host: &str, port: u16) -> crate::error::Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(EvdError::from_io)?
        .collect();
    if addrs.is_empty() {
        return Err(EvdError::new(ErrorKind::InvalidArgument, format!("no addresses found for host {host}")));
    }
    Ok(addrs[0])
}

/// Run DNS resolution (when needed) on a background thread and deliver the
/// result on `context`, so the caller's stack never blocks on a lookup. This
/// is the minimal stand-in for the source's `EvdResolver` collaborator: a
/// name is resolved once, with no caching or cancellation wiring of its own
/// beyond what the bound [`Cancellable`](crate::promise::Promise) already
/// provides at the socket layer.
pub fn resolve_async(addr: Address, context: crate::context::ContextHandle, on_done: impl FnOnce(crate::error::Result<SocketAddr>) + Send + 'static) {
    match &addr {
        Address::Literal(_) | Address::Wildcard(_) => {
            let result = addr.resolve_family(false);
            context.post_idle(move || on_done(result));
        }
        Address::Unresolved(..) => {
            std::thread::spawn(move || {
                let result = addr.resolve_family(false);
                context.post(Box::new(move || on_done(result)));
            });
        }
        Address::Unix(_) => {
            context.post_idle(move || on_done(Err(EvdError::new(ErrorKind::InvalidArgument, "unix address is not inet-resolvable"))));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4_literal() {
        let a = Address::parse("127.0.0.1:8080").unwrap();
        assert_eq!(a, Address::Literal("127.0.0.1:8080".parse().unwrap()));
    }

    #[test]
    fn parses_bracketed_ipv6_literal() {
        let a = Address::parse("[::1]:9000").unwrap();
        assert_eq!(a, Address::Literal("[::1]:9000".parse().unwrap()));
    }

    #[test]
    fn parses_wildcard() {
        let a = Address::parse("*:7000").unwrap();
        assert_eq!(a, Address::Wildcard(7000));
    }

    #[test]
    fn parses_unix_path() {
        let a = Address::parse("/tmp/evd.sock").unwrap();
        assert_eq!(a, Address::Unix(PathBuf::from("/tmp/evd.sock")));
    }

    #[test]
    fn parses_dns_name_as_unresolved() {
        let a = Address::parse("localhost:80").unwrap();
        assert_eq!(a, Address::Unresolved("localhost".to_string(), 80));
    }

    #[test]
    fn rejects_missing_port() {
        assert!(Address::parse("127.0.0.1").is_err());
    }

    #[test]
    fn wildcard_resolves_to_unspecified() {
        let a = Address::Wildcard(1234);
        let resolved = a.resolve_family(false).unwrap();
        assert!(resolved.ip().is_unspecified());
        assert_eq!(resolved.port(), 1234);
    }
}
