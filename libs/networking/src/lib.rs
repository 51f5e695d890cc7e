//! Networking helpers for the node agent.
//!
//! This library is pure: nothing here touches the host. It provides:
//! - IPv4/IPv6 prefixes and address embedding for virtual networks
//! - Static address blocks configured on the node
//! - The MTU budget for jumbo frames and VLAN-over-VXLAN overlays
//! - Deterministic MAC address derivation
//! - Parsing of `ip --json` output

use thiserror::Error;

mod block;
mod iproute;
mod mac;
mod mtu;
mod prefix;

pub use block::{Block, ResolvedBlock};
pub use iproute::{parse_iface_addresses, parse_routes, IfaceAddresses, Route};
pub use mac::MacAddr;
pub use mtu::{
    validate_mtu, MtuPlan, MTU_DEFAULT_ETHERNET, MTU_MAX_JUMBO, MTU_MIN_IPV6, OVERLAY_OVERHEAD,
    VLAN_OVERHEAD,
};
pub use prefix::{embed_ipv4, Ipv4Prefix, Ipv6Prefix};

/// Networking errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// Invalid MTU value.
    #[error("invalid MTU: {value} (must be between {min} and {max})")]
    InvalidMtu { value: u16, min: u16, max: u16 },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Unparseable tool output.
    #[error("failed to parse {what}: {source}")]
    Parse {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}
