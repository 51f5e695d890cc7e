//! IPv4 and IPv6 prefixes.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::NetworkError;

/// IPv4 prefix, stored masked to its network address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Prefix {
    /// Network address.
    pub address: Ipv4Addr,

    /// Prefix length (e.g., 24 for /24).
    pub prefix_len: u8,
}

impl Ipv4Prefix {
    /// Create a new prefix, masking the address.
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, NetworkError> {
        if prefix_len > 32 {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds 32",
                prefix_len
            )));
        }

        Ok(Self {
            address: Ipv4Addr::from(u32::from(address) & mask_v4(prefix_len)),
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g., "10.196.0.0/16").
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            return Err(NetworkError::InvalidPrefix(format!(
                "missing '/' in CIDR: {}",
                s
            )));
        };

        let address = Ipv4Addr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    /// Check if an address is within this prefix.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & mask_v4(self.prefix_len) == u32::from(self.address)
    }

    /// First usable host address, used as the gateway of a virtual network.
    pub fn first_host(&self) -> Ipv4Addr {
        if self.prefix_len >= 31 {
            self.address
        } else {
            Ipv4Addr::from(u32::from(self.address) + 1)
        }
    }

    /// Iterate usable host addresses (network and broadcast excluded below /31).
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let base = u32::from(self.address);
        let size = 1u64 << (32 - u32::from(self.prefix_len));
        let (start, end) = if self.prefix_len >= 31 {
            (0, size)
        } else {
            (1, size - 1)
        };
        (start..end).map(move |offset| Ipv4Addr::from(base + offset as u32))
    }
}

impl std::fmt::Display for Ipv4Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

fn mask_v4(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len))
    }
}

/// IPv6 prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv6Prefix {
    /// Base address of the prefix.
    pub address: Ipv6Addr,

    /// Prefix length (e.g., 64 for /64).
    pub prefix_len: u8,
}

impl Ipv6Prefix {
    /// Create a new prefix.
    pub fn new(address: Ipv6Addr, prefix_len: u8) -> Result<Self, NetworkError> {
        if prefix_len > 128 {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds 128",
                prefix_len
            )));
        }

        Ok(Self {
            address: mask_ipv6(address, prefix_len),
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g., "fd97:30bf:d456:a3bc::/64").
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            return Err(NetworkError::InvalidPrefix(format!(
                "missing '/' in CIDR: {}",
                s
            )));
        };

        let address = Ipv6Addr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    /// Check if an address is within this prefix.
    pub fn contains(&self, addr: Ipv6Addr) -> bool {
        mask_ipv6(addr, self.prefix_len) == self.address
    }
}

impl std::fmt::Display for Ipv6Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

/// Mask an IPv6 address to a prefix length.
fn mask_ipv6(addr: Ipv6Addr, prefix_len: u8) -> Ipv6Addr {
    let bits = u128::from_be_bytes(addr.octets());
    let mask = if prefix_len == 0 {
        0
    } else if prefix_len >= 128 {
        u128::MAX
    } else {
        u128::MAX << (128 - prefix_len)
    };
    Ipv6Addr::from((bits & mask).to_be_bytes())
}

/// Embed an IPv4 address into the low 32 bits of an IPv6 prefix.
///
/// Gives every private IPv4 address a stable IPv6 twin inside the virtual
/// network's v6 prefix.
pub fn embed_ipv4(prefix: &Ipv6Prefix, addr: Ipv4Addr) -> Ipv6Addr {
    let base = u128::from_be_bytes(prefix.address.octets());
    Ipv6Addr::from(base | u128::from(u32::from(addr)))
}
