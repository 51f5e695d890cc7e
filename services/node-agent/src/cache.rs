//! Time-stamped cache of per-VM runtime facts.
//!
//! Four independent facts are kept per VM: the VM snapshot with its process state, the
//! disk list, the public address pair and the namespace route table. The
//! cache never expires anything by itself; readers compare [`Entry::age`]
//! against their own refresh interval, and entries only go away through
//! explicit removal.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use stratus_id::VmId;
use stratus_networking::Route;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::vm::{Disk, VirtualMachine};

/// A cached value and the moment it was captured.
#[derive(Debug, Clone)]
pub struct Entry<T> {
    pub timestamp: Instant,
    pub value: T,
}

impl<T> Entry<T> {
    fn new(value: T) -> Self {
        Self {
            timestamp: Instant::now(),
            value,
        }
    }

    pub fn age(&self) -> Duration {
        self.timestamp.elapsed()
    }
}

/// Public address pair of a VM's external interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressPair {
    pub addr: Option<Ipv4Addr>,
    pub addr6: Option<Ipv6Addr>,
}

pub type VirtEntry = Entry<VirtualMachine>;
pub type DisksEntry = Entry<Vec<Disk>>;
pub type AddressEntry = Entry<AddressPair>;
pub type RoutesEntry = Entry<Vec<Route>>;

struct Slot<T>(RwLock<HashMap<VmId, Entry<T>>>);

impl<T: Clone> Slot<T> {
    fn new() -> Self {
        Self(RwLock::new(HashMap::new()))
    }

    async fn get(&self, id: &VmId) -> Option<Entry<T>> {
        self.0.read().await.get(id).cloned()
    }

    async fn set(&self, id: VmId, value: T) {
        self.0.write().await.insert(id, Entry::new(value));
    }

    async fn remove(&self, id: &VmId) {
        self.0.write().await.remove(id);
    }
}

/// Per-node cache shared by the lifecycle controller and network engine.
pub struct StateCache {
    virts: Slot<VirtualMachine>,
    disks: Slot<Vec<Disk>>,
    addresses: Slot<AddressPair>,
    routes: Slot<Vec<Route>>,
}

impl Default for StateCache {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCache {
    pub fn new() -> Self {
        Self {
            virts: Slot::new(),
            disks: Slot::new(),
            addresses: Slot::new(),
            routes: Slot::new(),
        }
    }

    pub async fn get_virt(&self, id: &VmId) -> Option<VirtEntry> {
        self.virts.get(id).await
    }

    pub async fn set_virt(&self, vm: &VirtualMachine) {
        self.virts.set(vm.id, vm.clone()).await;
    }

    pub async fn remove_virt(&self, id: &VmId) {
        self.virts.remove(id).await;
    }

    pub async fn get_disks(&self, id: &VmId) -> Option<DisksEntry> {
        self.disks.get(id).await
    }

    pub async fn set_disks(&self, id: VmId, disks: Vec<Disk>) {
        self.disks.set(id, disks).await;
    }

    pub async fn remove_disks(&self, id: &VmId) {
        self.disks.remove(id).await;
    }

    pub async fn get_address(&self, id: &VmId) -> Option<AddressEntry> {
        self.addresses.get(id).await
    }

    pub async fn set_address(&self, id: VmId, pair: AddressPair) {
        self.addresses.set(id, pair).await;
    }

    pub async fn remove_address(&self, id: &VmId) {
        self.addresses.remove(id).await;
    }

    pub async fn get_routes(&self, id: &VmId) -> Option<RoutesEntry> {
        self.routes.get(id).await
    }

    pub async fn set_routes(&self, id: VmId, routes: Vec<Route>) {
        self.routes.set(id, routes).await;
    }

    pub async fn remove_routes(&self, id: &VmId) {
        self.routes.remove(id).await;
    }

    /// Drop every fact about one VM.
    pub async fn clear(&self, id: &VmId) {
        self.remove_virt(id).await;
        self.remove_disks(id).await;
        self.remove_address(id).await;
        self.remove_routes(id).await;
    }

    /// Whether any fact about the VM is cached.
    pub async fn contains(&self, id: &VmId) -> bool {
        self.virts.get(id).await.is_some()
            || self.disks.get(id).await.is_some()
            || self.addresses.get(id).await.is_some()
            || self.routes.get(id).await.is_some()
    }
}
