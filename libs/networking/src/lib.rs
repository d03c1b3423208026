//! Networking utilities for cluster machines.
//!
//! This library provides helpers for:
//! - Parsing the cluster subnet base (`"10.10.2"` or `"10.10.2.0/24"`)
//! - Deriving deterministic static host addresses inside that subnet
//! - Forwarded port pairs and host-side conflict detection

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid subnet base or CIDR.
    #[error("invalid subnet: {0}")]
    InvalidSubnet(String),

    /// Host offset does not fit into the subnet.
    #[error("host offset {offset} is outside the usable range 1..=254 of {subnet}")]
    OffsetOutOfRange { subnet: String, offset: u32 },

    /// Port zero or otherwise unusable.
    #[error("invalid port: {0}")]
    InvalidPort(u16),

    /// Two forwards claim the same host port.
    #[error("host port {host_port} forwarded more than once ({first} and {second})")]
    PortConflict {
        host_port: u16,
        first: String,
        second: String,
    },
}

// ============================================================================
// Subnet
// ============================================================================

/// First usable host octet.
pub const MIN_HOST_OCTET: u32 = 1;

/// Last usable host octet (255 is broadcast).
pub const MAX_HOST_OCTET: u32 = 254;

/// A /24 IPv4 subnet used for private cluster networking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Subnet {
    /// Network address (last octet zero).
    network: Ipv4Addr,
}

impl Ipv4Subnet {
    /// Create a subnet from its three leading octets.
    pub fn new(a: u8, b: u8, c: u8) -> Self {
        Self {
            network: Ipv4Addr::new(a, b, c, 0),
        }
    }

    /// Parse either a three-octet base (`"10.10.2"`) or a /24 CIDR
    /// (`"10.10.2.0/24"`).
    pub fn parse(s: &str) -> Result<Self, NetworkError> {
        let s = s.trim();

        if let Some((addr, prefix)) = s.split_once('/') {
            if prefix != "24" {
                return Err(NetworkError::InvalidSubnet(format!(
                    "only /24 subnets are supported, got /{prefix}"
                )));
            }
            let addr = Ipv4Addr::from_str(addr)
                .map_err(|_| NetworkError::InvalidAddress(addr.to_string()))?;
            let [a, b, c, _] = addr.octets();
            return Ok(Self::new(a, b, c));
        }

        let octets: Vec<&str> = s.split('.').collect();
        if octets.len() != 3 {
            return Err(NetworkError::InvalidSubnet(format!(
                "expected three octets like \"10.10.2\", got {s:?}"
            )));
        }

        let mut parsed = [0u8; 3];
        for (slot, part) in parsed.iter_mut().zip(&octets) {
            *slot = part
                .parse::<u8>()
                .map_err(|_| NetworkError::InvalidSubnet(format!("bad octet {part:?} in {s:?}")))?;
        }

        Ok(Self::new(parsed[0], parsed[1], parsed[2]))
    }

    /// Address of host `offset` inside the subnet.
    pub fn host(&self, offset: u32) -> Result<Ipv4Addr, NetworkError> {
        if !(MIN_HOST_OCTET..=MAX_HOST_OCTET).contains(&offset) {
            return Err(NetworkError::OffsetOutOfRange {
                subnet: self.to_string(),
                offset,
            });
        }
        let [a, b, c, _] = self.network.octets();
        Ok(Ipv4Addr::new(a, b, c, offset as u8))
    }

    /// Check if an address lies within this subnet.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        addr.octets()[..3] == self.network.octets()[..3]
    }

    /// Check if an address is a usable host address in this subnet.
    pub fn is_usable_host(&self, addr: Ipv4Addr) -> bool {
        let last = u32::from(addr.octets()[3]);
        self.contains(addr) && (MIN_HOST_OCTET..=MAX_HOST_OCTET).contains(&last)
    }

    /// Network address.
    pub fn network(&self) -> Ipv4Addr {
        self.network
    }
}

impl FromStr for Ipv4Subnet {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for Ipv4Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/24", self.network)
    }
}

// ============================================================================
// Port forwarding
// ============================================================================

/// A guest port exposed on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortForward {
    /// Port inside the guest.
    pub guest: u16,

    /// Port on the host.
    pub host: u16,
}

impl PortForward {
    /// Create a forward, rejecting port zero.
    pub fn new(guest: u16, host: u16) -> Result<Self, NetworkError> {
        if guest == 0 {
            return Err(NetworkError::InvalidPort(guest));
        }
        if host == 0 {
            return Err(NetworkError::InvalidPort(host));
        }
        Ok(Self { guest, host })
    }

    /// Same port on both sides.
    pub fn same(port: u16) -> Result<Self, NetworkError> {
        Self::new(port, port)
    }
}

impl std::fmt::Display for PortForward {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.guest, self.host)
    }
}

/// Check that no host port is claimed twice across a set of owners.
///
/// `owners` yields `(owner_name, forwards)` pairs; all forwards share one
/// physical host, so host ports must be globally unique.
pub fn check_host_ports<'a, I>(owners: I) -> Result<(), NetworkError>
where
    I: IntoIterator<Item = (&'a str, &'a [PortForward])>,
{
    let mut claimed: BTreeMap<u16, &'a str> = BTreeMap::new();

    for (owner, forwards) in owners {
        for forward in forwards {
            if forward.guest == 0 {
                return Err(NetworkError::InvalidPort(forward.guest));
            }
            if forward.host == 0 {
                return Err(NetworkError::InvalidPort(forward.host));
            }
            if let Some(first) = claimed.insert(forward.host, owner) {
                return Err(NetworkError::PortConflict {
                    host_port: forward.host,
                    first: first.to_string(),
                    second: owner.to_string(),
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_three_octets() {
        let subnet = Ipv4Subnet::parse("10.10.2").unwrap();
        assert_eq!(subnet.network(), Ipv4Addr::new(10, 10, 2, 0));
        assert_eq!(subnet.to_string(), "10.10.2.0/24");
    }

    #[test]
    fn test_parse_cidr() {
        let subnet: Ipv4Subnet = "192.168.56.7/24".parse().unwrap();
        assert_eq!(subnet.network(), Ipv4Addr::new(192, 168, 56, 0));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Ipv4Subnet::parse("10.10").is_err());
        assert!(Ipv4Subnet::parse("10.10.300").is_err());
        assert!(Ipv4Subnet::parse("10.10.2.0/16").is_err());
        assert!(Ipv4Subnet::parse("x.y.z").is_err());
    }

    #[test]
    fn test_host_addresses() {
        let subnet = Ipv4Subnet::parse("10.10.2").unwrap();
        assert_eq!(subnet.host(10).unwrap(), Ipv4Addr::new(10, 10, 2, 10));
        assert_eq!(subnet.host(21).unwrap(), Ipv4Addr::new(10, 10, 2, 21));
    }

    #[test]
    fn test_host_offset_bounds() {
        let subnet = Ipv4Subnet::parse("10.10.2").unwrap();
        assert!(subnet.host(0).is_err());
        assert!(subnet.host(255).is_err());
        assert!(matches!(
            subnet.host(300),
            Err(NetworkError::OffsetOutOfRange { offset: 300, .. })
        ));
    }

    #[test]
    fn test_usable_host() {
        let subnet = Ipv4Subnet::parse("10.10.2").unwrap();
        assert!(subnet.is_usable_host(Ipv4Addr::new(10, 10, 2, 10)));
        assert!(!subnet.is_usable_host(Ipv4Addr::new(10, 10, 2, 0)));
        assert!(!subnet.is_usable_host(Ipv4Addr::new(10, 10, 3, 10)));
    }

    #[test]
    fn test_port_conflict_detected() {
        let api = [PortForward::same(6443).unwrap()];
        let other = [PortForward::new(8080, 6443).unwrap()];
        let err = check_host_ports([("master", &api[..]), ("node1", &other[..])]).unwrap_err();
        assert_eq!(
            err,
            NetworkError::PortConflict {
                host_port: 6443,
                first: "master".to_string(),
                second: "node1".to_string(),
            }
        );
    }

    #[test]
    fn test_port_zero_rejected() {
        assert!(PortForward::new(0, 80).is_err());
        assert!(PortForward::new(80, 0).is_err());
    }

    proptest! {
        #[test]
        fn prop_host_stays_in_subnet(a: u8, b: u8, c: u8, offset in 1u32..=254) {
            let subnet = Ipv4Subnet::new(a, b, c);
            let addr = subnet.host(offset).unwrap();
            prop_assert!(subnet.is_usable_host(addr));
            prop_assert_eq!(u32::from(addr.octets()[3]), offset);
        }
    }
}
