//! Networking primitives for the listener core.
//!
//! This library provides:
//! - The [`Address`] model for local and remote socket addresses, including
//!   non-IP transports (pipes, in-process listeners)
//! - [`CidrRange`] parsing and normalization
//! - [`AddressMatcher`], a longest-prefix-match trie keyed by CIDR ranges

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use thiserror::Error;

mod matcher;

pub use matcher::AddressMatcher;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR range.
    #[error("invalid CIDR range '{value}': {reason}")]
    InvalidCidr { value: String, reason: String },

    /// Invalid CIDR prefix length.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// The same prefix was registered for two different entries.
    #[error("prefix {0} is mapped to more than one entry")]
    DuplicatePrefix(String),
}

// ============================================================================
// Addresses
// ============================================================================

/// Address substituted for non-IP sockets so that catch-all ranges still match.
pub const PLACEHOLDER_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::BROADCAST);

/// A socket address as seen by the listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IPv4 or IPv6 socket address.
    Ip(SocketAddr),
    /// Unix domain socket or named pipe path.
    Pipe(String),
    /// In-process listener address.
    Internal(String),
}

impl Address {
    /// IP of this address, if it has one.
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Address::Ip(addr) => Some(addr.ip()),
            _ => None,
        }
    }

    /// Port of this address, if it has one.
    pub fn port(&self) -> Option<u16> {
        match self {
            Address::Ip(addr) => Some(addr.port()),
            _ => None,
        }
    }

    /// IP to use for range matching.
    ///
    /// Non-IP addresses map to [`PLACEHOLDER_ADDRESS`].
    pub fn ip_or_placeholder(&self) -> IpAddr {
        self.ip().unwrap_or(PLACEHOLDER_ADDRESS)
    }

    pub fn is_ip(&self) -> bool {
        matches!(self, Address::Ip(_))
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Ip(addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(addr) => write!(f, "{}", addr),
            Address::Pipe(path) => write!(f, "pipe:{}", path),
            Address::Internal(name) => write!(f, "internal:{}", name),
        }
    }
}

// ============================================================================
// CIDR ranges
// ============================================================================

/// A normalized CIDR range.
///
/// Host bits are cleared on parse, so `10.1.2.3/8` and `10.0.0.0/8` compare
/// equal and render as `10.0.0.0/8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CidrRange {
    net: IpNet,
}

impl CidrRange {
    /// Parse from CIDR notation (`192.168.0.0/16`) or a bare address, which
    /// becomes a host range (`/32` or `/128`).
    pub fn parse(s: &str) -> Result<Self, NetworkError> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(NetworkError::InvalidCidr {
                value: s.to_string(),
                reason: "empty range".to_string(),
            });
        }

        let net = if trimmed.contains('/') {
            IpNet::from_str(trimmed).map_err(|e| NetworkError::InvalidCidr {
                value: s.to_string(),
                reason: e.to_string(),
            })?
        } else {
            let ip = IpAddr::from_str(trimmed).map_err(|e| NetworkError::InvalidCidr {
                value: s.to_string(),
                reason: e.to_string(),
            })?;
            IpNet::from(ip)
        };

        Ok(Self { net: net.trunc() })
    }

    /// Build a range from an address and prefix length.
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self, NetworkError> {
        let net = IpNet::new(address, prefix_len)
            .map_err(|_| NetworkError::InvalidPrefix(format!("{}/{}", address, prefix_len)))?;
        Ok(Self { net: net.trunc() })
    }

    /// `0.0.0.0/0`.
    pub fn catch_all_v4() -> Self {
        Self {
            net: IpNet::V4(Ipv4Net::default()),
        }
    }

    /// `::/0`.
    pub fn catch_all_v6() -> Self {
        Self {
            net: IpNet::V6(Ipv6Net::default()),
        }
    }

    pub fn address(&self) -> IpAddr {
        self.net.network()
    }

    pub fn prefix_len(&self) -> u8 {
        self.net.prefix_len()
    }

    pub fn is_ipv4(&self) -> bool {
        matches!(self.net, IpNet::V4(_))
    }

    /// Check if an address is within this range.
    pub fn contains(&self, addr: IpAddr) -> bool {
        self.net.contains(&addr)
    }
}

impl FromStr for CidrRange {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CidrRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.net)
    }
}

/// Left-align an address into 128 bits so both families share one bit walk.
pub(crate) fn address_bits(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => (u32::from(v4) as u128) << 96,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// True for loopback addresses, including IPv4-mapped IPv6 loopback.
pub fn is_loopback(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6
                    .to_ipv4_mapped()
                    .map(|mapped| mapped.is_loopback())
                    .unwrap_or(false)
        }
    }
}
