//! Canonical 16-byte node addresses.
//!
//! Every node address is stored and compared in one 16-byte form: an IPv4
//! address occupies the last four bytes with the first twelve zeroed, an
//! IPv6 address fills all sixteen. Equality is byte-wise over that form, so
//! the textual conversions here round-trip exactly.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::ADDR_LEN;
use crate::error::{SdError, SdResult};

/// Offset of the IPv4 octets inside the canonical form.
const V4_OFFSET: usize = ADDR_LEN - 4;

/// A node address in canonical 16-byte form.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CanonicalAddr(pub [u8; ADDR_LEN]);

impl CanonicalAddr {
    /// All-zero address (`0.0.0.0` under the IPv4 discriminator).
    pub const UNSPECIFIED: Self = Self([0; ADDR_LEN]);

    pub const fn from_bytes(bytes: [u8; ADDR_LEN]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; ADDR_LEN] {
        &self.0
    }

    /// First twelve bytes zero means IPv4.
    pub fn is_ipv4(&self) -> bool {
        self.0[..V4_OFFSET].iter().all(|b| *b == 0)
    }

    pub fn is_unspecified(&self) -> bool {
        self.0 == [0; ADDR_LEN]
    }

    /// Convert to a socket-level IP address.
    pub fn to_ip(&self) -> IpAddr {
        if self.is_ipv4() {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&self.0[V4_OFFSET..]);
            IpAddr::V4(Ipv4Addr::from(octets))
        } else {
            IpAddr::V6(Ipv6Addr::from(self.0))
        }
    }

    /// Resolve a host name or address literal into canonical form.
    ///
    /// Literals are parsed directly; anything else goes through the system
    /// resolver and the first result wins.
    pub fn resolve(host: &str) -> SdResult<Self> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip.into());
        }
        let mut addrs = (host, 0u16)
            .to_socket_addrs()
            .map_err(|_| SdError::InvalidParms)?;
        addrs
            .next()
            .map(|sa| sa.ip().into())
            .ok_or(SdError::InvalidParms)
    }
}

impl From<Ipv4Addr> for CanonicalAddr {
    fn from(ip: Ipv4Addr) -> Self {
        let mut bytes = [0u8; ADDR_LEN];
        bytes[V4_OFFSET..].copy_from_slice(&ip.octets());
        Self(bytes)
    }
}

impl From<Ipv6Addr> for CanonicalAddr {
    fn from(ip: Ipv6Addr) -> Self {
        Self(ip.octets())
    }
}

impl From<IpAddr> for CanonicalAddr {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => v4.into(),
            IpAddr::V6(v6) => v6.into(),
        }
    }
}

impl From<CanonicalAddr> for IpAddr {
    fn from(addr: CanonicalAddr) -> Self {
        addr.to_ip()
    }
}

impl fmt::Display for CanonicalAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_ip())
    }
}

impl fmt::Debug for CanonicalAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CanonicalAddr({})", self.to_ip())
    }
}

impl FromStr for CanonicalAddr {
    type Err = SdError;

    fn from_str(s: &str) -> SdResult<Self> {
        s.parse::<IpAddr>()
            .map(Self::from)
            .map_err(|_| SdError::InvalidParms)
    }
}

/// Format an endpoint for logs and configuration.
///
/// IPv4 renders as `a.b.c.d:port`, IPv6 as `[v6]:port`. A zero port is
/// omitted (and IPv6 is then left unbracketed).
pub fn addr_to_str(addr: &CanonicalAddr, port: u16) -> String {
    match (addr.to_ip(), port) {
        (ip, 0) => ip.to_string(),
        (IpAddr::V4(v4), p) => format!("{}:{}", v4, p),
        (IpAddr::V6(v6), p) => format!("[{}]:{}", v6, p),
    }
}

/// Parse an endpoint produced by [`addr_to_str`].
///
/// Accepts `a.b.c.d`, `a.b.c.d:port`, a bare IPv6 literal and
/// `[v6]:port`. A missing port yields 0. No name resolution is done.
pub fn parse_endpoint(s: &str) -> SdResult<(CanonicalAddr, u16)> {
    if let Some(rest) = s.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or(SdError::InvalidParms)?;
        let addr = host
            .parse::<Ipv6Addr>()
            .map_err(|_| SdError::InvalidParms)?;
        let port = match tail {
            "" => 0,
            t => parse_port(t.strip_prefix(':').ok_or(SdError::InvalidParms)?)?,
        };
        return Ok((addr.into(), port));
    }

    if let Ok(ip) = s.parse::<IpAddr>() {
        return Ok((ip.into(), 0));
    }

    let (host, port) = s.rsplit_once(':').ok_or(SdError::InvalidParms)?;
    let addr = host
        .parse::<Ipv4Addr>()
        .map_err(|_| SdError::InvalidParms)?;
    Ok((addr.into(), parse_port(port)?))
}

fn parse_port(s: &str) -> SdResult<u16> {
    s.parse::<u16>().map_err(|_| SdError::InvalidParms)
}

/// Check that `s` is a valid numeric IPv4 or IPv6 address.
///
/// A colon selects IPv6 parsing, otherwise IPv4.
pub fn inetaddr_is_valid(s: &str) -> bool {
    if s.contains(':') {
        s.parse::<Ipv6Addr>().is_ok()
    } else {
        s.parse::<Ipv4Addr>().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ipv4_layout() {
        let addr = CanonicalAddr::from(Ipv4Addr::new(192, 168, 1, 7));
        assert_eq!(&addr.0[..12], &[0u8; 12]);
        assert_eq!(&addr.0[12..], &[192, 168, 1, 7]);
        assert!(addr.is_ipv4());
        assert_eq!(addr_to_str(&addr, 7000), "192.168.1.7:7000");
        assert_eq!(addr_to_str(&addr, 0), "192.168.1.7");
    }

    #[test]
    fn test_ipv6_layout() {
        let ip: Ipv6Addr = "fe80::1".parse().unwrap();
        let addr = CanonicalAddr::from(ip);
        assert!(!addr.is_ipv4());
        assert_eq!(addr.to_ip(), IpAddr::V6(ip));
        assert_eq!(addr_to_str(&addr, 7000), "[fe80::1]:7000");
    }

    #[test]
    fn test_parse_endpoint_forms() {
        let (a, p) = parse_endpoint("10.0.0.1:7001").unwrap();
        assert_eq!(a, CanonicalAddr::from(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(p, 7001);

        let (a, p) = parse_endpoint("[::1]:7000").unwrap();
        assert_eq!(a, CanonicalAddr::from(Ipv6Addr::LOCALHOST));
        assert_eq!(p, 7000);

        let (_, p) = parse_endpoint("2001:db8::5").unwrap();
        assert_eq!(p, 0);

        assert!(parse_endpoint("[::1").is_err());
        assert!(parse_endpoint("10.0.0.1:notaport").is_err());
        assert!(parse_endpoint("host.example:7000").is_err());
    }

    #[test]
    fn test_resolve_literal() {
        let a = CanonicalAddr::resolve("127.0.0.1").unwrap();
        assert_eq!(a.to_ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn test_inetaddr_is_valid() {
        assert!(inetaddr_is_valid("127.0.0.1"));
        assert!(inetaddr_is_valid("::1"));
        assert!(!inetaddr_is_valid("256.0.0.1"));
        assert!(!inetaddr_is_valid("::zz"));
    }

    proptest! {
        #[test]
        fn prop_endpoint_roundtrip(bytes in any::<[u8; 16]>(), port in any::<u16>()) {
            let addr = CanonicalAddr::from_bytes(bytes);
            let s = addr_to_str(&addr, port);
            prop_assert_eq!(parse_endpoint(&s).unwrap(), (addr, port));
        }

        #[test]
        fn prop_ipv4_roundtrip(octets in any::<[u8; 4]>(), port in 1u16..) {
            let addr = CanonicalAddr::from(Ipv4Addr::from(octets));
            let s = addr_to_str(&addr, port);
            prop_assert_eq!(parse_endpoint(&s).unwrap(), (addr, port));
        }
    }
}
