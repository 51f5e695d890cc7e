//! Static address blocks configured on the node.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::{Ipv4Prefix, NetworkError};

/// A node-local reserved address block.
///
/// Values are kept as configured and resolved lazily; a block that only
/// partially resolves is a configuration error, never a transient one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block name (for logs).
    pub name: String,

    /// Subnet in CIDR notation (e.g., "10.200.0.0/24").
    pub subnet: String,

    /// Gateway address (e.g., "10.200.0.1").
    pub gateway: String,

    /// Host bridge the block is reachable through.
    pub interface: String,
}

/// A block whose gateway and mask both resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBlock {
    pub name: String,
    pub subnet: Ipv4Prefix,
    pub gateway: Ipv4Addr,
    pub interface: String,
}

impl Block {
    /// Gateway address, if it parses.
    pub fn gateway(&self) -> Option<Ipv4Addr> {
        self.gateway.parse().ok()
    }

    /// Prefix length of the subnet, if it parses.
    pub fn mask(&self) -> Option<u8> {
        Ipv4Prefix::from_cidr(&self.subnet)
            .ok()
            .map(|prefix| prefix.prefix_len)
    }

    /// Resolve gateway and mask together.
    pub fn resolve(&self) -> Result<ResolvedBlock, NetworkError> {
        let subnet = Ipv4Prefix::from_cidr(&self.subnet).map_err(|e| {
            NetworkError::Config(format!("block {}: invalid subnet: {}", self.name, e))
        })?;

        let Some(gateway) = self.gateway() else {
            return Err(NetworkError::Config(format!(
                "block {}: invalid gateway {:?}",
                self.name, self.gateway
            )));
        };

        if !subnet.contains(gateway) {
            return Err(NetworkError::Config(format!(
                "block {}: gateway {} outside {}",
                self.name, gateway, subnet
            )));
        }

        if self.interface.is_empty() {
            return Err(NetworkError::Config(format!(
                "block {}: missing interface",
                self.name
            )));
        }

        Ok(ResolvedBlock {
            name: self.name.clone(),
            subnet,
            gateway,
            interface: self.interface.clone(),
        })
    }
}

impl ResolvedBlock {
    /// Render an address from this block with the block's mask.
    pub fn cidr(&self, addr: Ipv4Addr) -> String {
        format!("{}/{}", addr, self.subnet.prefix_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(subnet: &str, gateway: &str) -> Block {
        Block {
            name: "public".to_string(),
            subnet: subnet.to_string(),
            gateway: gateway.to_string(),
            interface: "br0".to_string(),
        }
    }

    #[test]
    fn test_block_resolves() {
        let resolved = block("203.0.113.0/24", "203.0.113.1").resolve().unwrap();
        assert_eq!(resolved.gateway, Ipv4Addr::new(203, 0, 113, 1));
        assert_eq!(resolved.subnet.prefix_len, 24);
        assert_eq!(
            resolved.cidr(Ipv4Addr::new(203, 0, 113, 9)),
            "203.0.113.9/24"
        );
    }

    #[test]
    fn test_partially_resolved_block_is_config_error() {
        let missing_gateway = block("203.0.113.0/24", "");
        assert!(missing_gateway.mask().is_some());
        assert!(missing_gateway.gateway().is_none());
        assert!(matches!(
            missing_gateway.resolve(),
            Err(NetworkError::Config(_))
        ));

        let missing_mask = block("203.0.113.0", "203.0.113.1");
        assert!(missing_mask.gateway().is_some());
        assert!(missing_mask.mask().is_none());
        assert!(matches!(missing_mask.resolve(), Err(NetworkError::Config(_))));
    }

    #[test]
    fn test_gateway_outside_subnet_is_config_error() {
        assert!(matches!(
            block("203.0.113.0/24", "198.51.100.1").resolve(),
            Err(NetworkError::Config(_))
        ));
    }
}
