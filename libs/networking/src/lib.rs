//! Networking value types for the routing control plane.
//!
//! This library provides validated types for:
//! - BGP peer addresses (IPv4 or IPv6 literals)
//! - Autonomous system numbers (4-byte, non-zero)
//! - CIDR prefixes advertised by routing instances
//!
//! Values are validated once at the API boundary and carried typed from
//! there on, so stores and agents never re-check raw strings.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// Invalid AS number.
    #[error("invalid AS number: {0}")]
    InvalidAsNumber(String),
}

// ============================================================================
// Peer addresses
// ============================================================================

/// Parse a BGP peer address.
///
/// Only bare IP literals are accepted; hostnames are rejected because the
/// address doubles as the session key inside the routing engine.
pub fn parse_peer_address(s: &str) -> Result<IpAddr, NetworkError> {
    IpAddr::from_str(s.trim()).map_err(|_| NetworkError::InvalidAddress(s.to_string()))
}

// ============================================================================
// AS numbers
// ============================================================================

/// A 4-byte autonomous system number (RFC 6793). AS 0 is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AsNumber(u32);

impl AsNumber {
    /// Create an AS number, rejecting the reserved value 0.
    pub fn new(value: u32) -> Result<Self, NetworkError> {
        if value == 0 {
            return Err(NetworkError::InvalidAsNumber("AS 0 is reserved".to_string()));
        }
        Ok(Self(value))
    }

    /// Validate a wider integer (as received from JSON or SQL).
    pub fn from_i64(value: i64) -> Result<Self, NetworkError> {
        let narrowed = u32::try_from(value)
            .map_err(|_| NetworkError::InvalidAsNumber(value.to_string()))?;
        Self::new(narrowed)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for AsNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for AsNumber {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.0)
    }
}

impl<'de> Deserialize<'de> for AsNumber {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = i64::deserialize(deserializer)?;
        Self::from_i64(raw).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// CIDR prefixes
// ============================================================================

/// An IPv4 or IPv6 prefix in CIDR notation.
///
/// Host bits must be zero, so `10.0.0.0/24` is accepted and `10.0.0.1/24`
/// is rejected. Host routes (`/32`, `/128`) are always valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cidr {
    address: IpAddr,
    prefix_len: u8,
}

impl Cidr {
    /// Create a prefix from an address and length.
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self, NetworkError> {
        let max_len = match address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max_len {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds {}",
                prefix_len, max_len
            )));
        }

        if mask(address, prefix_len) != address {
            return Err(NetworkError::InvalidPrefix(format!(
                "{}/{} has host bits set",
                address, prefix_len
            )));
        }

        Ok(Self {
            address,
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g. "10.0.0.0/24" or "2001:db8::/32").
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let Some((addr_str, prefix_str)) = s.trim().split_once('/') else {
            return Err(NetworkError::InvalidPrefix(format!(
                "missing '/' in CIDR: {}",
                s
            )));
        };

        let address = IpAddr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Check if an address is within this prefix.
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.address, addr) {
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => {
                mask(addr, self.prefix_len) == self.address
            }
            _ => false,
        }
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for Cidr {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_cidr(s)
    }
}

impl Serialize for Cidr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cidr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_cidr(&s).map_err(serde::de::Error::custom)
    }
}

/// Mask an address to a prefix length.
fn mask(addr: IpAddr, prefix_len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let bits = u32::from_be_bytes(v4.octets());
            let mask = if prefix_len == 0 {
                0
            } else {
                u32::MAX << (32 - u32::from(prefix_len.min(32)))
            };
            IpAddr::V4(Ipv4Addr::from(bits & mask))
        }
        IpAddr::V6(v6) => {
            let bits = u128::from_be_bytes(v6.octets());
            let mask = if prefix_len == 0 {
                0
            } else {
                u128::MAX << (128 - u32::from(prefix_len.min(128)))
            };
            IpAddr::V6(Ipv6Addr::from(bits & mask))
        }
    }
}
