//! Virtual machine, instance and disk records.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use stratus_id::{DiskId, ImageId, NetworkId, VmId};
use stratus_networking::{embed_ipv4, Ipv4Prefix, Ipv6Prefix};

/// VM lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    #[default]
    Provisioning,
    Starting,
    Running,
    Stopped,
    Failed,
    Cleanup,
}

impl VmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Cleanup => "cleanup",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "provisioning" => Some(Self::Provisioning),
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "stopped" => Some(Self::Stopped),
            "failed" => Some(Self::Failed),
            "cleanup" => Some(Self::Cleanup),
            _ => None,
        }
    }

    /// Process is gone, either cleanly or not.
    pub fn is_down(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an adapter is wired on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// Tap interface joined to the VM's namespace bridge.
    #[default]
    Bridged,
    /// QEMU user-mode networking.
    User,
}

/// One virtual NIC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAdapter {
    pub network: NetworkId,
    #[serde(default)]
    pub kind: AdapterKind,
    #[serde(default)]
    pub ip_address: Option<Ipv4Addr>,
    #[serde(default)]
    pub ip_address6: Option<Ipv6Addr>,
}

impl NetworkAdapter {
    pub fn bridged(network: NetworkId) -> Self {
        Self {
            network,
            kind: AdapterKind::Bridged,
            ip_address: None,
            ip_address6: None,
        }
    }
}

/// A disk attached to a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    pub index: u32,
    pub path: PathBuf,
}

impl Disk {
    /// Persisted disk id, taken from the file stem (`dsk_<ulid>.qcow2`).
    pub fn id(&self) -> Option<DiskId> {
        self.path.file_stem()?.to_str()?.parse().ok()
    }
}

/// Desired specification and observed state of one VM.
///
/// Serialized into the unit descriptor so it can be rebuilt after a crash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub id: VmId,
    #[serde(default)]
    pub state: VmState,
    pub image: ImageId,
    #[serde(default)]
    pub network_adapters: Vec<NetworkAdapter>,
    #[serde(default)]
    pub disks: Vec<Disk>,
    #[serde(default)]
    pub no_public_address: bool,
    #[serde(default)]
    pub no_host_address: bool,
    #[serde(default)]
    pub vnc: bool,
    #[serde(default)]
    pub vnc_display: u16,
    pub kvm: bool,
    pub machine: String,
    pub cpu: String,
    pub processors: u32,
    pub cores: u32,
    pub threads: u32,
    pub memory_mib: u32,
    pub boot: String,
}

impl VirtualMachine {
    /// A single-adapter VM with default tunables.
    pub fn new(id: VmId, image: ImageId, network: NetworkId) -> Self {
        Self {
            id,
            state: VmState::Provisioning,
            image,
            network_adapters: vec![NetworkAdapter::bridged(network)],
            disks: Vec::new(),
            no_public_address: false,
            no_host_address: false,
            vnc: false,
            vnc_display: 0,
            kvm: true,
            machine: "pc".to_string(),
            cpu: "host".to_string(),
            processors: 1,
            cores: 1,
            threads: 1,
            memory_mib: 1024,
            boot: "c".to_string(),
        }
    }
}

/// Intended state requested for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    #[default]
    Start,
    Stop,
    Restart,
    Cleanup,
    Destroy,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Cleanup => "cleanup",
            Self::Destroy => "destroy",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "restart" => Some(Self::Restart),
            "cleanup" => Some(Self::Cleanup),
            "destroy" => Some(Self::Destroy),
            _ => None,
        }
    }
}

/// Intended record for a VM, owned by instance management.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    /// Same as the VM id.
    pub id: VmId,
    pub name: String,
    pub image: ImageId,
    /// Boot disk size in GiB.
    pub init_disk_size: u32,
    /// Use the source image as a qcow2 backing file instead of copying it.
    pub image_backing: bool,
    pub vnc_password: Option<String>,
    pub state: InstanceState,
    pub vm_state: VmState,
    pub private_ips: Vec<Ipv4Addr>,
    pub private_ips6: Vec<Ipv6Addr>,
    pub host_ips: Vec<Ipv4Addr>,
}

impl Instance {
    pub fn new(id: VmId, name: impl Into<String>, image: ImageId) -> Self {
        Self {
            id,
            name: name.into(),
            image,
            init_disk_size: 10,
            image_backing: false,
            vnc_password: None,
            state: InstanceState::Start,
            vm_state: VmState::Provisioning,
            private_ips: Vec::new(),
            private_ips6: Vec::new(),
            host_ips: Vec::new(),
        }
    }
}

/// Addresses persisted on an instance after network provisioning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrivateAddresses {
    pub private_ips: Vec<Ipv4Addr>,
    pub private_ips6: Vec<Ipv6Addr>,
    pub host_ips: Vec<Ipv4Addr>,
}

/// Persisted disk record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskRecord {
    pub id: DiskId,
    pub name: String,
    /// Current attachment.
    pub instance: Option<VmId>,
    /// Instance that created the disk.
    pub source_instance: VmId,
    pub image: ImageId,
    pub index: u32,
    /// Size in GiB.
    pub size: u32,
    pub backing: bool,
    pub backing_image: Option<PathBuf>,
}

/// Virtual network a VM's primary adapter joins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualNetwork {
    pub id: NetworkId,
    /// VLAN tag on the internal link.
    pub vlan_id: u16,
    pub subnet: Ipv4Prefix,
    pub subnet6: Ipv6Prefix,
}

impl VirtualNetwork {
    pub fn gateway(&self) -> Ipv4Addr {
        self.subnet.first_host()
    }

    /// IPv6 twin of a private IPv4 address.
    pub fn address6(&self, addr: Ipv4Addr) -> Ipv6Addr {
        embed_ipv4(&self.subnet6, addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_id_from_path() {
        let id = DiskId::new();
        let disk = Disk {
            index: 0,
            path: PathBuf::from(format!("/var/lib/stratus/disks/{}.qcow2", id)),
        };
        assert_eq!(disk.id(), Some(id));

        let foreign = Disk {
            index: 1,
            path: PathBuf::from("/srv/scratch.img"),
        };
        assert_eq!(foreign.id(), None);
    }

    #[test]
    fn test_vm_state_strings() {
        for state in [
            VmState::Provisioning,
            VmState::Starting,
            VmState::Running,
            VmState::Stopped,
            VmState::Failed,
            VmState::Cleanup,
        ] {
            assert_eq!(VmState::parse(state.as_str()), Some(state));
        }
        assert!(VmState::Failed.is_down());
        assert!(!VmState::Running.is_down());
    }

    #[test]
    fn test_vm_json_defaults() {
        let vm = VirtualMachine::new(VmId::new(), ImageId::new(), NetworkId::new());
        let mut value = serde_json::to_value(&vm).unwrap();
        let obj = value.as_object_mut().unwrap();
        obj.remove("state");
        obj.remove("disks");
        obj.remove("vnc");

        let parsed: VirtualMachine = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.state, VmState::Provisioning);
        assert!(parsed.disks.is_empty());
        assert_eq!(parsed.network_adapters, vm.network_adapters);
    }

    #[test]
    fn test_network_addresses() {
        let network = VirtualNetwork {
            id: NetworkId::new(),
            vlan_id: 42,
            subnet: Ipv4Prefix::from_cidr("10.196.0.0/16").unwrap(),
            subnet6: Ipv6Prefix::from_cidr("fd00:10::/64").unwrap(),
        };
        assert_eq!(network.gateway(), Ipv4Addr::new(10, 196, 0, 1));
        assert_eq!(
            network.address6(Ipv4Addr::new(10, 196, 0, 1)),
            "fd00:10::ac4:1".parse::<Ipv6Addr>().unwrap()
        );
    }
}
