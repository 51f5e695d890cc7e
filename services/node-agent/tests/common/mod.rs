//! Test harness for node agent integration tests.
//!
//! Builds a `VmManager` over a temporary directory tree, an in-memory
//! record store and the in-memory collaborators from `testing`.

#![allow(dead_code)]

use std::sync::Arc;

use stratus_id::{ImageId, NetworkId, VmId};
use stratus_networking::{Ipv4Prefix, Ipv6Prefix};
use stratus_node_agent::network::names::IfaceNames;
use stratus_node_agent::paths::Paths;
use stratus_node_agent::qemu::UnitDescriptor;
use stratus_node_agent::testing::{
    fake_interface, MockCloudInit, MockCommandRunner, MockGuest, MockImageStore, MockSupervisor,
};
use stratus_node_agent::vm::VirtualNetwork;
use stratus_node_agent::{
    Collaborators, Config, Instance, SqliteRecordStore, StateCache, VirtualMachine, VmManager,
};
use tempfile::TempDir;

pub const PUBLIC_V4: &str = "203.0.113.10";
pub const PUBLIC_V6: &str = "2001:db8::10";

pub struct TestNode {
    pub dir: TempDir,
    pub config: Arc<Config>,
    pub paths: Paths,
    pub cache: Arc<StateCache>,
    pub runner: Arc<MockCommandRunner>,
    pub supervisor: Arc<MockSupervisor>,
    pub guest: Arc<MockGuest>,
    pub records: Arc<SqliteRecordStore>,
    pub images: Arc<MockImageStore>,
    pub cloud_init: Arc<MockCloudInit>,
    pub manager: Arc<VmManager>,
    pub network: VirtualNetwork,
}

impl TestNode {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(tune: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config {
            lib_dir: dir.path().join("lib"),
            systemd_dir: dir.path().join("systemd"),
            run_dir: dir.path().join("run"),
            sysfs_net_dir: dir.path().join("sys"),
            ..Config::default()
        };
        tune(&mut config);
        let config = Arc::new(config);

        let paths = Paths::from_config(&config);
        std::fs::create_dir_all(paths.systemd_dir()).unwrap();

        let cache = Arc::new(StateCache::new());
        let runner = Arc::new(MockCommandRunner::new());
        let supervisor = Arc::new(MockSupervisor::new());
        let guest = Arc::new(MockGuest::linked(Arc::clone(&supervisor)));
        let records = Arc::new(SqliteRecordStore::open_in_memory().unwrap());
        let images = Arc::new(MockImageStore::new(paths.clone()));
        let cloud_init = Arc::new(MockCloudInit::new());

        let network = VirtualNetwork {
            id: NetworkId::new(),
            vlan_id: 42,
            subnet: Ipv4Prefix::from_cidr("10.196.0.0/24").unwrap(),
            subnet6: Ipv6Prefix::from_cidr("fd00:10::/64").unwrap(),
        };
        records.upsert_network(&network).await.unwrap();

        let parts = Collaborators {
            runner: runner.clone(),
            supervisor: supervisor.clone(),
            guest: guest.clone(),
            records: records.clone(),
            images: images.clone(),
            cloud_init: cloud_init.clone(),
        };
        let manager = Arc::new(VmManager::new(
            Arc::clone(&config),
            Arc::clone(&cache),
            parts,
        ));

        Self {
            dir,
            config,
            paths,
            cache,
            runner,
            supervisor,
            guest,
            records,
            images,
            cloud_init,
            manager,
            network,
        }
    }

    /// Register an instance, make its tap appear and give its external
    /// interface a public address pair.
    pub async fn seed(&self, name: &str) -> (Instance, VirtualMachine) {
        let inst = Instance::new(VmId::new(), name, ImageId::new());
        self.records.upsert_instance(&inst).await.unwrap();

        let vm = VirtualMachine::new(inst.id, inst.image, self.network.id);
        let names = IfaceNames::for_vm(&vm.id);
        fake_interface(&self.paths, &names.tap).unwrap();
        self.runner.respond(
            format!("addr show dev {}", names.external),
            addr_json(&names.external, Some(PUBLIC_V4), Some(PUBLIC_V6)),
        );

        (inst, vm)
    }

    /// Write a unit file for `vm` as if it had been created earlier.
    pub fn install_unit(&self, vm: &VirtualMachine) {
        let descriptor = UnitDescriptor::from_vm(vm, &self.paths).unwrap();
        std::fs::write(self.paths.unit_path(&vm.id), descriptor.render()).unwrap();
    }

    pub fn unit(&self, vm: &VirtualMachine) -> String {
        Paths::unit_name(&vm.id)
    }
}

/// `ip --json addr show` output for one interface.
pub fn addr_json(ifname: &str, v4: Option<&str>, v6: Option<&str>) -> String {
    let mut addrs = Vec::new();
    if let Some(v4) = v4 {
        addrs.push(serde_json::json!({
            "family": "inet", "local": v4, "prefixlen": 24, "scope": "global"
        }));
    }
    if let Some(v6) = v6 {
        addrs.push(serde_json::json!({
            "family": "inet6", "local": v6, "prefixlen": 64, "scope": "global"
        }));
    }
    addrs.push(serde_json::json!({
        "family": "inet6", "local": "fe80::1", "prefixlen": 64, "scope": "link"
    }));

    serde_json::json!([{ "ifname": ifname, "addr_info": addrs }]).to_string()
}
