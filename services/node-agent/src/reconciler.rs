//! Reconciliation of running VM units against instance records.
//!
//! The reconciler:
//! - Discovers VM units in the systemd directory
//! - Queries every VM concurrently and commits what it finds
//! - Marks instances whose VM died underneath them for cleanup

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use stratus_id::{DiskId, VmId};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::lifecycle::VmManager;
use crate::paths::{Paths, UNIT_PREFIX};
use crate::state::RecordStore;
use crate::vm::{Instance, InstanceState, VirtualMachine, VmState};

/// Whether a VM whose record claims it is running has actually gone down.
pub fn needs_cleanup(inst: Option<&Instance>, vm: &VirtualMachine) -> bool {
    inst.is_some_and(|inst| inst.vm_state == VmState::Running && vm.state.is_down())
}

/// Query every VM unit on the node and commit its state.
///
/// One task runs per unit. Failures of a single VM are logged and never
/// abort the pass; only an unreadable systemd directory fails it.
pub async fn get_vms(
    manager: &Arc<VmManager>,
    records: &Arc<dyn RecordStore>,
    instances: &HashMap<VmId, Instance>,
) -> Result<Vec<VirtualMachine>> {
    let ids = unit_ids(manager.paths()).await?;
    debug!(units = ids.len(), "Discovered VM units");

    let found = Arc::new(Mutex::new(Vec::with_capacity(ids.len())));
    let mut tasks = JoinSet::new();

    for id in ids {
        let manager = Arc::clone(manager);
        let records = Arc::clone(records);
        let found = Arc::clone(&found);
        let inst = instances.get(&id).cloned();

        tasks.spawn(async move {
            let vm = match manager.get_vm_info(&id, true, true).await {
                Ok(Some(vm)) => vm,
                Ok(None) => {
                    debug!(vm_id = %id, "Unit carries no VM data");
                    return;
                }
                Err(e) => {
                    error!(vm_id = %id, error = %e, "Failed to get VM info");
                    return;
                }
            };

            let committed = if needs_cleanup(inst.as_ref(), &vm) {
                info!(vm_id = %id, state = %vm.state, "Virtual machine went down, marking for cleanup");
                records.commit_vm_state(&vm, InstanceState::Cleanup).await
            } else {
                records.commit_vm(&vm).await
            };
            if let Err(e) = committed {
                error!(vm_id = %id, error = %e, "Failed to commit VM state");
            }

            found.lock().await.push(vm);
        });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "VM query task failed");
        }
    }

    let mut vms = std::mem::take(&mut *found.lock().await);
    vms.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(vms)
}

async fn unit_ids(paths: &Paths) -> Result<Vec<VmId>> {
    let dir = paths.systemd_dir();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| Error::read(dir.display().to_string(), e))?;

    let mut ids = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::read(dir.display().to_string(), e))?
    {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(UNIT_PREFIX) {
            continue;
        }
        match Paths::parse_unit_name(name) {
            Some(id) => ids.push(id),
            None => debug!(unit = %name, "Skipping unrecognized unit"),
        }
    }
    Ok(ids)
}

/// Result of one reconciliation pass.
#[derive(Debug, Default)]
pub struct NodeSnapshot {
    pub vms: HashMap<VmId, VirtualMachine>,
    pub instances: HashMap<VmId, Instance>,
    /// Units with no instance record.
    pub orphans: Vec<VmId>,
}

impl NodeSnapshot {
    pub fn new(vms: Vec<VirtualMachine>, instances: HashMap<VmId, Instance>) -> Self {
        let mut orphans: Vec<VmId> = vms
            .iter()
            .map(|vm| vm.id)
            .filter(|id| !instances.contains_key(id))
            .collect();
        orphans.sort();

        Self {
            vms: vms.into_iter().map(|vm| (vm.id, vm)).collect(),
            instances,
            orphans,
        }
    }

    /// VM currently using a disk, if any.
    pub fn disk_in_use(&self, disk: &DiskId) -> Option<VmId> {
        self.vms
            .values()
            .find(|vm| vm.disks.iter().any(|d| d.id().as_ref() == Some(disk)))
            .map(|vm| vm.id)
    }

    /// VMs whose instance expected them to be running.
    pub fn down(&self) -> impl Iterator<Item = &VirtualMachine> {
        self.vms
            .values()
            .filter(|vm| needs_cleanup(self.instances.get(&vm.id), vm))
    }
}

/// Reconciliation loop configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Interval between passes.
    pub interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
        }
    }
}

/// Periodic reconciler for one node.
pub struct Reconciler {
    manager: Arc<VmManager>,
    records: Arc<dyn RecordStore>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(manager: Arc<VmManager>, config: ReconcilerConfig) -> Self {
        let records = Arc::clone(manager.records());
        Self {
            manager,
            records,
            config,
        }
    }

    /// Run the reconciliation loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting reconciliation loop"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sync().await {
                        error!(error = %e, "Reconciliation failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Perform a single reconciliation pass.
    pub async fn sync(&self) -> Result<NodeSnapshot> {
        let instances: HashMap<VmId, Instance> = self
            .records
            .list_instances()
            .await?
            .into_iter()
            .map(|inst| (inst.id, inst))
            .collect();

        let vms = get_vms(&self.manager, &self.records, &instances).await?;
        let snapshot = NodeSnapshot::new(vms, instances);

        for id in &snapshot.orphans {
            warn!(vm_id = %id, "Unknown instance");
        }

        for vm in snapshot.down() {
            self.manager.cleanup(vm).await;
        }

        debug!(
            vms = snapshot.vms.len(),
            orphans = snapshot.orphans.len(),
            "Reconciliation pass complete"
        );
        Ok(snapshot)
    }
}
