//! Reconciliation tests: unit discovery, concurrent commits, orphan and
//! dead-VM handling.

mod common;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::TestNode;
use stratus_id::{DiskId, NetworkId, VmId};
use stratus_networking::Ipv4Prefix;
use stratus_node_agent::reconciler::get_vms;
use stratus_node_agent::systemd::UnitState;
use stratus_node_agent::vm::{DiskRecord, PrivateAddresses, VirtualNetwork};
use stratus_node_agent::{
    Error, Instance, InstanceState, Reconciler, ReconcilerConfig, RecordStore, SqliteRecordStore,
    StoreError, VirtualMachine, VmState,
};
use tokio::sync::watch;

/// Delegates reads and refuses every VM commit.
struct FailingCommits(Arc<SqliteRecordStore>);

#[async_trait]
impl RecordStore for FailingCommits {
    async fn commit_vm(&self, vm: &VirtualMachine) -> Result<(), StoreError> {
        Err(StoreError::Invalid(format!("refusing commit of {}", vm.id)))
    }

    async fn commit_vm_state(
        &self,
        vm: &VirtualMachine,
        _state: InstanceState,
    ) -> Result<(), StoreError> {
        Err(StoreError::Invalid(format!("refusing commit of {}", vm.id)))
    }

    async fn commit_addresses(
        &self,
        id: &VmId,
        addresses: &PrivateAddresses,
    ) -> Result<(), StoreError> {
        self.0.commit_addresses(id, addresses).await
    }

    async fn get_instance(&self, id: &VmId) -> Result<Instance, StoreError> {
        self.0.get_instance(id).await
    }

    async fn list_instances(&self) -> Result<Vec<Instance>, StoreError> {
        self.0.list_instances().await
    }

    async fn instance_disk(
        &self,
        instance: &VmId,
        index: u32,
    ) -> Result<Option<DiskRecord>, StoreError> {
        self.0.instance_disk(instance, index).await
    }

    async fn get_disk(&self, id: &DiskId) -> Result<DiskRecord, StoreError> {
        self.0.get_disk(id).await
    }

    async fn insert_disk(&self, disk: &DiskRecord) -> Result<(), StoreError> {
        self.0.insert_disk(disk).await
    }

    async fn delete_disk(&self, id: &DiskId) -> Result<(), StoreError> {
        self.0.delete_disk(id).await
    }

    async fn detach_disk(&self, id: &DiskId) -> Result<(), StoreError> {
        self.0.detach_disk(id).await
    }

    async fn get_network(&self, id: &NetworkId) -> Result<VirtualNetwork, StoreError> {
        self.0.get_network(id).await
    }

    async fn lease_address(
        &self,
        pool: &str,
        vm: &VmId,
        subnet: &Ipv4Prefix,
        reserved: &[Ipv4Addr],
    ) -> Result<Ipv4Addr, StoreError> {
        self.0.lease_address(pool, vm, subnet, reserved).await
    }
}

async fn instances(node: &TestNode) -> HashMap<VmId, Instance> {
    node.records
        .list_instances()
        .await
        .unwrap()
        .into_iter()
        .map(|inst| (inst.id, inst))
        .collect()
}

/// Seed a VM whose unit is installed and running.
async fn running_vm(node: &TestNode, name: &str) -> VirtualMachine {
    let (_, vm) = node.seed(name).await;
    node.install_unit(&vm);
    node.supervisor.set_state(&node.unit(&vm), UnitState::Running);
    vm
}

#[tokio::test]
async fn test_get_vms_returns_every_unit() {
    let node = TestNode::new().await;
    let mut expected = Vec::new();
    for name in ["web-1", "web-2", "web-3"] {
        expected.push(running_vm(&node, name).await.id);
    }
    expected.sort();

    let vms = get_vms(&node.manager, node.manager.records(), &instances(&node).await)
        .await
        .unwrap();

    let ids: Vec<VmId> = vms.iter().map(|vm| vm.id).collect();
    assert_eq!(ids, expected);
    for vm in &vms {
        assert_eq!(vm.state, VmState::Running);
        let committed = node.records.committed_vm(&vm.id).await.unwrap().unwrap();
        assert_eq!(committed.state, VmState::Running);
    }
}

#[tokio::test]
async fn test_get_vms_skips_foreign_and_empty_units() {
    let node = TestNode::new().await;
    let dir = node.paths.systemd_dir();
    std::fs::write(dir.join("sshd.service"), "[Service]\n").unwrap();
    std::fs::write(dir.join("stratus_garbage.service"), "[Service]\n").unwrap();
    let empty = VmId::new();
    std::fs::write(node.paths.unit_path(&empty), "[Service]\nType=simple\n").unwrap();

    let vms = get_vms(&node.manager, node.manager.records(), &HashMap::new())
        .await
        .unwrap();

    assert!(vms.is_empty());
}

#[tokio::test]
async fn test_commit_failures_are_not_fatal() {
    let node = TestNode::new().await;
    running_vm(&node, "web-1").await;
    running_vm(&node, "web-2").await;
    let records: Arc<dyn RecordStore> = Arc::new(FailingCommits(Arc::clone(&node.records)));

    let vms = get_vms(&node.manager, &records, &instances(&node).await)
        .await
        .unwrap();

    assert_eq!(vms.len(), 2);
    for vm in &vms {
        assert_eq!(node.records.committed_vm(&vm.id).await.unwrap(), None);
    }
}

#[tokio::test]
async fn test_unreadable_systemd_dir_fails_the_pass() {
    let node = TestNode::new().await;
    std::fs::remove_dir_all(node.paths.systemd_dir()).unwrap();

    let err = get_vms(&node.manager, node.manager.records(), &HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Read { .. }), "unexpected error: {err}");

    let reconciler = Reconciler::new(Arc::clone(&node.manager), ReconcilerConfig::default());
    assert!(reconciler.sync().await.is_err());
}

#[tokio::test]
async fn test_sync_reports_orphans() {
    let node = TestNode::new().await;
    let known = running_vm(&node, "web-1").await;

    let stray = VirtualMachine::new(VmId::new(), known.image, node.network.id);
    node.install_unit(&stray);
    node.supervisor.set_state(&node.unit(&stray), UnitState::Running);

    let reconciler = Reconciler::new(Arc::clone(&node.manager), ReconcilerConfig::default());
    let snapshot = reconciler.sync().await.unwrap();

    assert_eq!(snapshot.vms.len(), 2);
    assert_eq!(snapshot.orphans, vec![stray.id]);
    assert_eq!(snapshot.down().count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_sync_marks_dead_vm_for_cleanup() {
    let node = TestNode::new().await;
    let (mut inst, vm) = node.seed("web-1").await;
    inst.vm_state = VmState::Running;
    node.records.upsert_instance(&inst).await.unwrap();
    node.install_unit(&vm);
    node.supervisor.set_state(&node.unit(&vm), UnitState::Failed);

    let reconciler = Reconciler::new(Arc::clone(&node.manager), ReconcilerConfig::default());
    let snapshot = reconciler.sync().await.unwrap();

    assert_eq!(snapshot.down().count(), 1);
    let record = node.records.get_instance(&inst.id).await.unwrap();
    assert_eq!(record.state, InstanceState::Cleanup);
    assert_eq!(record.vm_state, VmState::Failed);
    assert_eq!(node.runner.count("ip netns del"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sync_revalidates_cached_running_vm() {
    let node = TestNode::new().await;
    let (mut inst, vm) = node.seed("web-1").await;
    inst.vm_state = VmState::Running;
    node.records.upsert_instance(&inst).await.unwrap();
    node.install_unit(&vm);
    node.supervisor.set_state(&node.unit(&vm), UnitState::Running);

    let warm = node.manager.get_vm_info(&vm.id, false, false).await.unwrap().unwrap();
    assert_eq!(warm.state, VmState::Running);
    node.supervisor.set_state(&node.unit(&vm), UnitState::Failed);

    let reconciler = Reconciler::new(Arc::clone(&node.manager), ReconcilerConfig::default());
    let snapshot = reconciler.sync().await.unwrap();

    assert_eq!(snapshot.down().count(), 1);
    let record = node.records.get_instance(&inst.id).await.unwrap();
    assert_eq!(record.state, InstanceState::Cleanup);
    assert_eq!(record.vm_state, VmState::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_stopped_vm_without_running_record_is_left_alone() {
    let node = TestNode::new().await;
    let (_, vm) = node.seed("web-1").await;
    node.install_unit(&vm);

    let reconciler = Reconciler::new(Arc::clone(&node.manager), ReconcilerConfig::default());
    reconciler.sync().await.unwrap();

    let record = node.records.get_instance(&vm.id).await.unwrap();
    assert_eq!(record.state, InstanceState::Start);
    assert_eq!(record.vm_state, VmState::Stopped);
    assert_eq!(node.runner.count("ip netns del"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_run_stops_on_shutdown() {
    let node = TestNode::new().await;
    let reconciler = Reconciler::new(
        Arc::clone(&node.manager),
        ReconcilerConfig {
            interval: Duration::from_secs(1),
        },
    );
    let (tx, rx) = watch::channel(false);

    let handle = tokio::spawn(async move { reconciler.run(rx).await });
    tokio::time::sleep(Duration::from_secs(3)).await;
    tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("reconciler did not stop")
        .unwrap();
}
