//! Peer Addresses and Rank
//!
//! Every node in the fleet is identified by an `ip:port` pair. The same
//! pair also determines the node's rank in the Bully election, so the rank
//! function here must stay identical on every node.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Port assumed when a marker holds a bare IP
pub const DEFAULT_PORT: u16 = 5555;

/// Address of a node or proxy (host, port)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerAddress {
    ip: IpAddr,
    port: u16,
}

/// Election rank of a peer.
///
/// Ordered by the sum of the address octets first, then by the full
/// `ip:port` text so that two distinct peers never compare equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Rank {
    ordinal: u32,
    label: String,
}

impl PeerAddress {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Compute this peer's election rank
    pub fn rank(&self) -> Rank {
        let ordinal = match self.ip {
            IpAddr::V4(v4) => v4.octets().iter().map(|&b| b as u32).sum(),
            IpAddr::V6(v6) => v6.octets().iter().map(|&b| b as u32).sum(),
        };
        Rank {
            ordinal,
            label: self.to_string(),
        }
    }

    /// Whether this peer outranks `other`
    pub fn outranks(&self, other: &PeerAddress) -> bool {
        self.rank() > other.rank()
    }

    /// Parse `ip:port`, falling back to [`DEFAULT_PORT`] for a bare IP
    pub fn parse_lenient(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(addr.into());
        }
        s.parse::<IpAddr>()
            .map(|ip| Self::new(ip, DEFAULT_PORT))
            .map_err(|_| Error::InvalidAddress(s.to_string()))
    }
}

impl Rank {
    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl FromStr for PeerAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<SocketAddr>()
            .map(Into::into)
            .map_err(|_| Error::InvalidAddress(s.to_string()))
    }
}

impl TryFrom<String> for PeerAddress {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<PeerAddress> for String {
    fn from(addr: PeerAddress) -> Self {
        addr.to_string()
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> PeerAddress {
        s.parse().unwrap()
    }

    #[test]
    fn test_rank_uses_octet_sum() {
        assert_eq!(addr("10.0.0.3:5555").rank().ordinal(), 13);
        assert!(addr("10.0.0.3:5555").outranks(&addr("10.0.0.2:5555")));
        assert!(addr("10.0.0.2:5555").outranks(&addr("10.0.0.1:5555")));
        // Octet sum beats lexical order
        assert!(addr("9.0.0.9:5555").outranks(&addr("10.0.0.1:5555")));
    }

    #[test]
    fn test_rank_tie_break_is_total() {
        // Same octet sum, different addresses
        let a = addr("10.0.0.2:5555");
        let b = addr("10.0.1.1:5555");
        assert_eq!(a.rank().ordinal(), b.rank().ordinal());
        assert_ne!(a.rank(), b.rank());
        assert!(a.outranks(&b) ^ b.outranks(&a));

        // Same host, different ports
        let c = addr("127.0.0.1:7001");
        let d = addr("127.0.0.1:7002");
        assert!(d.outranks(&c));
        assert!(!c.outranks(&c));
    }

    #[test]
    fn test_parse_lenient_defaults_port() {
        let a = PeerAddress::parse_lenient("10.147.90.153\n").unwrap();
        assert_eq!(a.port(), DEFAULT_PORT);
        assert_eq!(a.to_string(), "10.147.90.153:5555");

        let b = PeerAddress::parse_lenient("10.0.0.1:6000").unwrap();
        assert_eq!(b.port(), 6000);

        assert!(PeerAddress::parse_lenient("not-an-ip").is_err());
    }

    #[test]
    fn test_strict_parse_requires_port() {
        assert!("10.0.0.1".parse::<PeerAddress>().is_err());
        assert!("[::1]:5555".parse::<PeerAddress>().is_ok());
    }
}
