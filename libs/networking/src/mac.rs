//! Deterministic MAC addresses.

use sha2::{Digest, Sha256};

/// A 48-bit MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// Derive a locally administered unicast MAC from seed strings.
    ///
    /// The same seeds always produce the same address, so re-provisioning a
    /// VM reuses the MACs its guest already knows.
    pub fn derive(seeds: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        for seed in seeds {
            hasher.update(seed.as_bytes());
            hasher.update([0u8]);
        }
        let digest = hasher.finalize();

        let mut octets = [0u8; 6];
        octets.copy_from_slice(&digest[..6]);
        octets[0] = (octets[0] & 0xfe) | 0x02;
        Self(octets)
    }
}

impl std::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a, b, c, d, e, g
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_is_deterministic() {
        let a = MacAddr::derive(&["vm_1", "vnet_1", "external"]);
        let b = MacAddr::derive(&["vm_1", "vnet_1", "external"]);
        let c = MacAddr::derive(&["vm_1", "vnet_1", "internal"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_mac_is_local_unicast() {
        let mac = MacAddr::derive(&["vm_2"]);
        assert_eq!(mac.0[0] & 0x01, 0);
        assert_eq!(mac.0[0] & 0x02, 0x02);
        assert_eq!(mac.to_string().len(), 17);
    }

    #[test]
    fn test_seed_boundaries_matter() {
        assert_ne!(MacAddr::derive(&["ab", "c"]), MacAddr::derive(&["a", "bc"]));
    }
}
