// Address helpers
// Literal bind addresses and resolver-ordered connect candidates

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use crate::error::{Error, Result};

/// Restricts resolved candidates to one address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum AddressFamily {
    #[default]
    Any,
    V4Only,
    V6Only,
}

impl AddressFamily {
    const fn admits(self, addr: &SocketAddr) -> bool {
        match self {
            Self::Any => true,
            Self::V4Only => addr.is_ipv4(),
            Self::V6Only => addr.is_ipv6(),
        }
    }
}

/// Parse a literal IPv4/IPv6 address. Host names are not resolved.
pub(crate) fn parse_literal(address: &str, port: u16) -> Result<SocketAddr> {
    let trimmed = address.trim_start_matches('[').trim_end_matches(']');
    trimmed
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, port))
        .map_err(|_| Error::invalid_argument(format!("bad address '{address}'")))
}

/// Resolve `host:port`, keeping resolver order.
pub(crate) fn resolve(host: &str, port: u16, family: AddressFamily) -> Result<Vec<SocketAddr>> {
    let candidates: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::invalid_argument(format!("cannot resolve '{host}': {e}")))?
        .filter(|addr| family.admits(addr))
        .collect();
    if candidates.is_empty() {
        return Err(Error::invalid_argument(format!(
            "no usable address for '{host}'"
        )));
    }
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_addresses() {
        assert_eq!(
            parse_literal("127.0.0.1", 9000).unwrap(),
            "127.0.0.1:9000".parse().unwrap()
        );
        assert_eq!(parse_literal("::1", 80).unwrap().port(), 80);
        assert_eq!(parse_literal("[::1]", 80).unwrap().port(), 80);
    }

    #[test]
    fn test_host_names_are_not_literals() {
        assert!(parse_literal("localhost", 9000).unwrap_err().is_invalid_argument());
        assert!(parse_literal("300.1.1.1", 9000).is_err());
    }

    #[test]
    fn test_family_filter() {
        let v4 = resolve("127.0.0.1", 1, AddressFamily::V4Only).unwrap();
        assert_eq!(v4.len(), 1);
        assert!(resolve("127.0.0.1", 1, AddressFamily::V6Only).is_err());
    }
}
