//! Deterministic interface and namespace names.
//!
//! Linux caps interface names at 15 bytes, so names are a one-letter role,
//! an index and a short hash of the VM id.

use sha2::{Digest, Sha256};
use stratus_id::{NetworkId, VmId};
use stratus_networking::MacAddr;

const SUFFIX_LEN: usize = 10;

fn suffix(id: &VmId) -> String {
    let digest = Sha256::digest(id.to_string().as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(SUFFIX_LEN);
    hex
}

/// Tap interface QEMU creates for an adapter.
pub fn tap_name(id: &VmId, index: usize) -> String {
    format!("v{}{}", index, suffix(id))
}

/// Names of every interface provisioned for a VM's primary adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfaceNames {
    /// Instance tap, moved into the namespace.
    pub tap: String,
    /// Host ends of the veth pairs.
    pub external_virt: String,
    pub internal_virt: String,
    pub host_virt: String,
    /// Namespace ends of the veth pairs.
    pub external: String,
    pub internal: String,
    pub host: String,
    /// VLAN sub-interface over the internal link.
    pub vlan: String,
    pub namespace: String,
}

impl IfaceNames {
    pub fn for_vm(id: &VmId) -> Self {
        let s = suffix(id);
        Self {
            tap: format!("v0{}", s),
            external_virt: format!("k0{}", s),
            internal_virt: format!("k1{}", s),
            host_virt: format!("k2{}", s),
            external: format!("e0{}", s),
            internal: format!("i0{}", s),
            host: format!("h0{}", s),
            vlan: format!("x0{}", s),
            namespace: format!("n0{}", s),
        }
    }

    /// Host-side veth ends, in teardown order.
    pub fn virt_ends(&self) -> [&str; 3] {
        [&self.external_virt, &self.internal_virt, &self.host_virt]
    }
}

/// MAC addresses of the namespace ends of the veth pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Macs {
    pub external: MacAddr,
    pub internal: MacAddr,
    pub host: MacAddr,
}

impl Macs {
    pub fn derive(id: &VmId, network: &NetworkId) -> Self {
        let vm = id.to_string();
        let net = network.to_string();
        Self {
            external: MacAddr::derive(&[&vm, &net, "external"]),
            internal: MacAddr::derive(&[&vm, &net, "internal"]),
            host: MacAddr::derive(&[&vm, &net, "host"]),
        }
    }
}

/// MAC of an adapter's guest-facing NIC.
pub fn adapter_mac(id: &VmId, network: &NetworkId, index: usize) -> MacAddr {
    let index = index.to_string();
    MacAddr::derive(&[&id.to_string(), &network.to_string(), "adapter", &index])
}
