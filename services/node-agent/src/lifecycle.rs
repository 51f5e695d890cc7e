//! VM lifecycle controller.
//!
//! [`VmManager`] drives one VM through create, power-on, power-off, destroy
//! and cleanup. The unit descriptor on disk is the durable record of a VM;
//! the [`StateCache`] only saves process and network queries.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use stratus_id::{DiskId, VmId};
use stratus_networking::Route;
use stratus_reconcile::{poll_until, retry, PollError, PollPolicy};
use tracing::{debug, error, info, warn};

use crate::cache::StateCache;
use crate::cloudinit::CloudInit;
use crate::command::CommandRunner;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::image::ImageStore;
use crate::network::NetworkEngine;
use crate::paths::Paths;
use crate::qemu::{GuestControl, UnitDescriptor};
use crate::state::RecordStore;
use crate::systemd::Supervisor;
use crate::vm::{Disk, DiskRecord, Instance, VirtualMachine, VmState};

const DISK_POLL: PollPolicy = PollPolicy::new(20, Duration::from_millis(100));
const SHUTDOWN_RETRY: PollPolicy = PollPolicy::new(10, Duration::from_millis(500));
const POWER_INTERVAL: Duration = Duration::from_secs(1);

/// Re-send the shutdown request every this many stop-poll attempts.
const SHUTDOWN_NUDGE: u32 = 15;

/// External collaborators of the lifecycle controller.
#[derive(Clone)]
pub struct Collaborators {
    pub runner: Arc<dyn CommandRunner>,
    pub supervisor: Arc<dyn Supervisor>,
    pub guest: Arc<dyn GuestControl>,
    pub records: Arc<dyn RecordStore>,
    pub images: Arc<dyn ImageStore>,
    pub cloud_init: Arc<dyn CloudInit>,
}

/// Lifecycle controller for the VMs of one node.
pub struct VmManager {
    config: Arc<Config>,
    paths: Paths,
    cache: Arc<StateCache>,
    supervisor: Arc<dyn Supervisor>,
    guest: Arc<dyn GuestControl>,
    records: Arc<dyn RecordStore>,
    images: Arc<dyn ImageStore>,
    cloud_init: Arc<dyn CloudInit>,
    network: NetworkEngine,
}

impl VmManager {
    pub fn new(config: Arc<Config>, cache: Arc<StateCache>, parts: Collaborators) -> Self {
        let paths = Paths::from_config(&config);
        let network = NetworkEngine::new(
            Arc::clone(&config),
            paths.clone(),
            Arc::clone(&cache),
            parts.runner,
            Arc::clone(&parts.records),
        );

        Self {
            config,
            paths,
            cache,
            supervisor: parts.supervisor,
            guest: parts.guest,
            records: parts.records,
            images: parts.images,
            cloud_init: parts.cloud_init,
            network,
        }
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    pub fn network(&self) -> &NetworkEngine {
        &self.network
    }

    /// Current view of a VM.
    ///
    /// Returns `None` when the unit file carries no VM data.
    pub async fn get_vm_info(
        &self,
        id: &VmId,
        get_disks: bool,
        force: bool,
    ) -> Result<Option<VirtualMachine>> {
        let mut vm = match self.cache.get_virt(id).await {
            Some(entry) => {
                let age = entry.age();
                let mut vm = entry.value;
                if force || vm.state != VmState::Running || age > self.config.virt_refresh {
                    self.refresh_state(&mut vm).await;
                }
                vm
            }
            None => {
                let unit_path = self.paths.unit_path(id);
                let text = tokio::fs::read_to_string(&unit_path)
                    .await
                    .map_err(|e| Error::read(unit_path.display().to_string(), e))?;

                let parsed = UnitDescriptor::parse_vm(&text)
                    .map_err(|e| Error::parse(unit_path.display().to_string(), e))?;
                let Some(mut vm) = parsed else {
                    return Ok(None);
                };
                self.refresh_state(&mut vm).await;
                vm
            }
        };

        if get_disks && vm.state == VmState::Running {
            self.load_disks(&mut vm).await?;
        }

        let public = if self.config.internal_only() {
            self.cache.get_address(id).await.map(|entry| entry.value)
        } else {
            Some(self.network.public_addresses(id).await?)
        };
        if let (Some(pair), Some(adapter)) = (public, vm.network_adapters.first_mut()) {
            adapter.ip_address = pair.addr;
            adapter.ip_address6 = pair.addr6;
        }

        Ok(Some(vm))
    }

    /// Refresh a VM's state from the supervisor and cache it.
    pub async fn update_vm_state(&self, vm: &mut VirtualMachine) -> Result<()> {
        let unit = Paths::unit_name(&vm.id);
        vm.state = self.supervisor.state(&unit).await?.vm_state();
        self.cache.set_virt(vm).await;
        Ok(())
    }

    async fn refresh_state(&self, vm: &mut VirtualMachine) {
        if let Err(e) = self.update_vm_state(vm).await {
            warn!(vm_id = %vm.id, error = %e, "Failed to query VM state");
        }
    }

    async fn load_disks(&self, vm: &mut VirtualMachine) -> Result<()> {
        if let Some(entry) = self.cache.get_disks(&vm.id).await {
            if entry.age() <= self.config.refresh_rate {
                vm.disks = entry.value;
                return Ok(());
            }
        }

        let mut attempt = 0;
        while vm.state == VmState::Running {
            match self.guest.list_disks(&vm.id).await {
                Ok(disks) => {
                    self.cache.set_disks(vm.id, disks.clone()).await;
                    vm.disks = disks;
                    break;
                }
                Err(e) if attempt + 1 < DISK_POLL.attempts => {
                    debug!(vm_id = %vm.id, attempt, error = %e, "Disk query failed, retrying");
                    tokio::time::sleep(DISK_POLL.interval).await;
                    self.refresh_state(vm).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Wait for a started VM to report running. Stops the unit on timeout.
    pub async fn wait(&self, vm: &mut VirtualMachine) -> Result<()> {
        let unit = Paths::unit_name(&vm.id);
        let policy = PollPolicy::new(self.config.start_timeout, POWER_INTERVAL);

        let result = poll_until(policy, |_| {
            let unit = &unit;
            async move {
                let state = self.supervisor.state(unit).await?.vm_state();
                Ok::<_, Error>((state == VmState::Running).then_some(state))
            }
        })
        .await;

        match result {
            Ok(state) => {
                vm.state = state;
                self.cache.set_virt(vm).await;
                Ok(())
            }
            Err(PollError::Exhausted { attempts }) => {
                self.supervisor.stop(&unit).await?;
                self.refresh_state(vm).await;
                Err(Error::Timeout(format!(
                    "{} not running after {} attempts",
                    vm.id, attempts
                )))
            }
            Err(PollError::Probe(e)) => Err(e),
        }
    }

    /// Provision and boot a new VM.
    pub async fn create(&self, inst: &Instance, vm: &mut VirtualMachine) -> Result<()> {
        info!(vm_id = %vm.id, "Creating virtual machine");

        vm.state = VmState::Provisioning;
        self.records.commit_vm(vm).await?;

        for dir in [
            self.paths.lib_dir().to_path_buf(),
            self.paths.vm_dir(&vm.id),
            self.paths.runtime_dir(),
            self.paths.disks_dir(),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }

        if self.records.instance_disk(&inst.id, 0).await?.is_none() {
            let disk = self.materialize_boot_disk(inst, vm).await?;
            vm.disks.push(Disk {
                index: 0,
                path: self.paths.disk_path(&disk),
            });
        }

        self.cloud_init.write(inst, vm, true).await?;
        self.write_unit(vm).await?;

        self.boot(inst, vm).await
    }

    /// Boot an existing VM.
    pub async fn power_on(&self, inst: &Instance, vm: &mut VirtualMachine) -> Result<()> {
        info!(vm_id = %vm.id, "Starting virtual machine");

        self.cloud_init.write(inst, vm, false).await?;
        self.write_unit(vm).await?;

        self.boot(inst, vm).await
    }

    async fn materialize_boot_disk(&self, inst: &Instance, vm: &VirtualMachine) -> Result<DiskId> {
        let id = DiskId::new();
        let backing_image = self
            .images
            .write_image(&vm.image, &id, inst.init_disk_size, inst.image_backing)
            .await?;

        let record = DiskRecord {
            id,
            name: inst.name.clone(),
            instance: Some(inst.id),
            source_instance: inst.id,
            image: vm.image,
            index: 0,
            size: inst.init_disk_size,
            backing: inst.image_backing,
            backing_image,
        };
        self.records.insert_disk(&record).await?;

        debug!(vm_id = %vm.id, disk_id = %id, "Boot disk registered");
        Ok(id)
    }

    async fn write_unit(&self, vm: &VirtualMachine) -> Result<()> {
        let unit_path = self.paths.unit_path(&vm.id);
        let descriptor = UnitDescriptor::from_vm(vm, &self.paths)
            .map_err(|e| Error::parse(unit_path.display().to_string(), e))?;

        tokio::fs::create_dir_all(self.paths.systemd_dir()).await?;
        tokio::fs::write(&unit_path, descriptor.render()).await?;
        self.supervisor.reload().await?;
        Ok(())
    }

    async fn boot(&self, inst: &Instance, vm: &mut VirtualMachine) -> Result<()> {
        let vnc_password = match (vm.vnc, inst.vnc_password.as_deref()) {
            (false, _) => None,
            (true, Some(password)) if !password.is_empty() => Some(password),
            (true, _) => {
                return Err(Error::Configuration(format!(
                    "{} has VNC enabled without a password",
                    vm.id
                )));
            }
        };

        vm.state = VmState::Starting;
        self.records.commit_vm(vm).await?;

        self.supervisor.start(&Paths::unit_name(&vm.id)).await?;
        self.wait(vm).await?;
        self.records.commit_vm(vm).await?;

        if let Some(password) = vnc_password {
            self.guest.set_vnc_password(&vm.id, password).await?;
        }

        self.network.configure(vm).await?;

        self.cache.remove_virt(&vm.id).await;
        self.cache.remove_disks(&vm.id).await;
        Ok(())
    }

    /// Ask the guest to shut down and wait for the process to exit.
    ///
    /// Returns `false` when the guest never confirmed, leaving the caller to
    /// force the unit down.
    async fn shutdown_gracefully(&self, id: &VmId) -> Result<bool> {
        let submitted = retry(SHUTDOWN_RETRY, |attempt| async move {
            let result = self.guest.shutdown(id).await;
            if let (0, Err(e)) = (attempt, &result) {
                warn!(vm_id = %id, error = %e, "Failed to send shutdown to virtual machine");
            }
            result
        })
        .await;

        if let Err(e) = submitted {
            error!(vm_id = %id, error = %e, "Power off virtual machine error");
            return Ok(false);
        }

        let policy = PollPolicy::new(self.config.stop_timeout, POWER_INTERVAL);
        let stopped = poll_until(policy, |attempt| async move {
            if attempt > 0 && attempt % SHUTDOWN_NUDGE == 0 {
                if let Err(e) = self.guest.shutdown(id).await {
                    debug!(vm_id = %id, error = %e, "Shutdown nudge failed");
                }
            }

            match self.get_vm_info(id, false, true).await? {
                None => Ok::<_, Error>(Some(())),
                Some(vm) if vm.state.is_down() => {
                    self.commit_tolerant(&vm).await?;
                    Ok(Some(()))
                }
                Some(_) => Ok(None),
            }
        })
        .await;

        match stopped {
            Ok(()) => Ok(true),
            Err(PollError::Exhausted { .. }) => Ok(false),
            Err(PollError::Probe(e)) => Err(e),
        }
    }

    async fn commit_tolerant(&self, vm: &VirtualMachine) -> Result<()> {
        match self.records.commit_vm(vm).await {
            Err(e) if e.is_not_found() => {
                debug!(vm_id = %vm.id, "Instance record gone, state not committed");
                Ok(())
            }
            other => Ok(other?),
        }
    }

    /// Shut a VM down and tear down its network.
    pub async fn power_off(&self, vm: &VirtualMachine) -> Result<()> {
        info!(vm_id = %vm.id, "Stopping virtual machine");

        if !self.shutdown_gracefully(&vm.id).await? {
            warn!(vm_id = %vm.id, "Force power off virtual machine");
            self.supervisor.stop(&Paths::unit_name(&vm.id)).await?;
        }

        self.network.clear(vm).await?;
        tokio::time::sleep(self.config.settle).await;

        self.cache.remove_virt(&vm.id).await;
        self.cache.remove_disks(&vm.id).await;
        Ok(())
    }

    /// Remove every trace of a VM from the node. Safe to repeat.
    pub async fn destroy(&self, vm: &VirtualMachine) -> Result<()> {
        info!(vm_id = %vm.id, "Destroying virtual machine");

        let unit_path = self.paths.unit_path(&vm.id);
        if tokio::fs::try_exists(&unit_path).await? {
            let current = self.get_vm_info(&vm.id, false, true).await?;
            if let Some(current) = current.filter(|current| current.state == VmState::Running) {
                if !self.shutdown_gracefully(&current.id).await? {
                    warn!(vm_id = %vm.id, "Force power off virtual machine");
                }
            }
        }
        self.supervisor.stop(&Paths::unit_name(&vm.id)).await?;

        tokio::time::sleep(self.config.settle).await;

        match self.network.clear(vm).await {
            Err(e) if e.is_not_found() => {
                debug!(vm_id = %vm.id, "No network to clear");
            }
            other => other?,
        }

        self.release_disks(vm).await?;

        for path in [
            self.paths.vm_dir(&vm.id),
            unit_path,
            self.paths.sock_path(&vm.id),
            self.paths.guest_path(&vm.id),
            self.paths.pid_path(&vm.id),
            self.paths.init_dir(&vm.id),
            self.paths.lease_path(&vm.id),
        ] {
            remove_all(&path).await?;
        }

        self.cache.clear(&vm.id).await;
        info!(vm_id = %vm.id, "Virtual machine destroyed");
        Ok(())
    }

    /// Delete the boot disk this VM created; detach everything else.
    async fn release_disks(&self, vm: &VirtualMachine) -> Result<()> {
        for (i, disk) in vm.disks.iter().enumerate() {
            let Some(disk_id) = disk.id() else {
                debug!(vm_id = %vm.id, path = %disk.path.display(), "Disk has no record");
                continue;
            };

            let record = match self.records.get_disk(&disk_id).await {
                Ok(record) => record,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            };

            let released = if i == 0 && record.source_instance == vm.id {
                let deleted = self.records.delete_disk(&disk_id).await;
                if deleted.is_ok() {
                    remove_all(&disk.path).await?;
                }
                deleted
            } else {
                self.records.detach_disk(&disk_id).await
            };

            match released {
                Err(e) if e.is_not_found() => {}
                other => other?,
            }
        }
        Ok(())
    }

    /// Tear down what is left of a VM whose process died on its own.
    pub async fn cleanup(&self, vm: &VirtualMachine) {
        info!(vm_id = %vm.id, "Stopped virtual machine");

        if let Err(e) = self.network.clear(vm).await {
            error!(vm_id = %vm.id, error = %e, "Failed to cleanup virtual machine network");
        }

        tokio::time::sleep(self.config.settle).await;

        self.cache.remove_virt(&vm.id).await;
        self.cache.remove_disks(&vm.id).await;
    }

    /// Route table inside a VM's namespace.
    pub async fn routes(&self, id: &VmId) -> Result<Vec<Route>> {
        self.network.routes(id).await
    }
}

/// Remove a file or directory tree. Missing paths are fine.
async fn remove_all(path: &Path) -> std::io::Result<()> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    let result = if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };

    match result {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
