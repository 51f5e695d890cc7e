//! Record store collaborator.
//!
//! The lifecycle controller persists VM state, addresses and disks through
//! [`RecordStore`]. Records can disappear underneath a running operation
//! (an instance deleted concurrently), so [`StoreError::NotFound`] is a
//! normal outcome on update paths.

mod store;

use std::net::Ipv4Addr;

use async_trait::async_trait;
use stratus_id::{DiskId, NetworkId, VmId};
use stratus_networking::Ipv4Prefix;
use thiserror::Error;

use crate::vm::{
    DiskRecord, Instance, InstanceState, PrivateAddresses, VirtualMachine, VirtualNetwork,
};

pub use store::SqliteRecordStore;

/// Errors from record store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("invalid record: {0}")]
    Invalid(String),

    #[error("address pool exhausted: {0}")]
    Exhausted(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Persistent records the node agent reads and updates.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Persist the full VM (state, disks, adapters) on its instance.
    async fn commit_vm(&self, vm: &VirtualMachine) -> Result<(), StoreError>;

    /// Persist the VM and move the instance to `state`.
    async fn commit_vm_state(
        &self,
        vm: &VirtualMachine,
        state: InstanceState,
    ) -> Result<(), StoreError>;

    async fn commit_addresses(
        &self,
        id: &VmId,
        addresses: &PrivateAddresses,
    ) -> Result<(), StoreError>;

    async fn get_instance(&self, id: &VmId) -> Result<Instance, StoreError>;

    async fn list_instances(&self) -> Result<Vec<Instance>, StoreError>;

    /// Disk attached to an instance at `index`, if any.
    async fn instance_disk(
        &self,
        instance: &VmId,
        index: u32,
    ) -> Result<Option<DiskRecord>, StoreError>;

    async fn get_disk(&self, id: &DiskId) -> Result<DiskRecord, StoreError>;

    async fn insert_disk(&self, disk: &DiskRecord) -> Result<(), StoreError>;

    async fn delete_disk(&self, id: &DiskId) -> Result<(), StoreError>;

    /// Clear a disk's current attachment.
    async fn detach_disk(&self, id: &DiskId) -> Result<(), StoreError>;

    async fn get_network(&self, id: &NetworkId) -> Result<VirtualNetwork, StoreError>;

    /// Lease an address from `pool` for `vm`, reusing an existing lease.
    async fn lease_address(
        &self,
        pool: &str,
        vm: &VmId,
        subnet: &Ipv4Prefix,
        reserved: &[Ipv4Addr],
    ) -> Result<Ipv4Addr, StoreError>;
}
