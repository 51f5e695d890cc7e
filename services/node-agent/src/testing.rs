//! In-memory collaborators for tests and local development.
//!
//! These stand in for `systemctl`, QMP, `qemu-img` and host commands so the
//! lifecycle controller and network engine can run without root.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use stratus_id::{DiskId, ImageId, VmId};
use tracing::debug;

use crate::cloudinit::CloudInit;
use crate::command::{CommandError, CommandOutput, CommandRunner};
use crate::error::Result;
use crate::image::ImageStore;
use crate::paths::Paths;
use crate::qemu::{GuestControl, GuestError};
use crate::systemd::{Supervisor, SupervisorError, UnitState};
use crate::vm::{Disk, Instance, VirtualMachine};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Records every command and answers from canned rules.
///
/// A rule matches when its pattern is a substring of the rendered command
/// line; the most recently added matching rule wins. Unmatched commands
/// succeed with empty output.
#[derive(Default)]
pub struct MockCommandRunner {
    calls: Mutex<Vec<String>>,
    rules: Mutex<Vec<(String, CommandOutput)>>,
    delays: Mutex<Vec<(String, Duration)>>,
    slow_in_flight: AtomicUsize,
    slow_peak: AtomicUsize,
}

impl MockCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Succeed with `stdout` for commands containing `pattern`.
    pub fn respond(&self, pattern: impl Into<String>, stdout: impl Into<String>) {
        lock(&self.rules).push((pattern.into(), CommandOutput::ok(stdout)));
    }

    /// Fail with `stderr` for commands containing `pattern`.
    pub fn fail(&self, pattern: impl Into<String>, stderr: impl Into<String>) {
        lock(&self.rules).push((pattern.into(), CommandOutput::failed(stderr)));
    }

    /// Hold commands containing `pattern` for `delay` before answering.
    pub fn delay(&self, pattern: impl Into<String>, delay: Duration) {
        lock(&self.delays).push((pattern.into(), delay));
    }

    /// Most delayed commands ever running at the same time.
    pub fn peak_delayed(&self) -> usize {
        self.slow_peak.load(Ordering::SeqCst)
    }

    /// Rendered command lines, in call order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Number of calls containing `pattern`.
    pub fn count(&self, pattern: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|call| call.contains(pattern))
            .count()
    }

    /// Index of the first call containing `pattern`.
    pub fn position(&self, pattern: &str) -> Option<usize> {
        lock(&self.calls)
            .iter()
            .position(|call| call.contains(pattern))
    }
}

#[async_trait]
impl CommandRunner for MockCommandRunner {
    async fn output(&self, program: &str, args: &[&str]) -> Result<CommandOutput, CommandError> {
        let mut line = program.to_string();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }

        let delay = lock(&self.delays)
            .iter()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, delay)| *delay);
        if let Some(delay) = delay {
            let now = self.slow_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.slow_peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            self.slow_in_flight.fetch_sub(1, Ordering::SeqCst);
        }

        let output = lock(&self.rules)
            .iter()
            .rev()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_else(|| CommandOutput::ok(""));

        debug!(command = %line, success = output.success, "Mock command");
        lock(&self.calls).push(line);
        Ok(output)
    }
}

/// Unit states kept in memory.
#[derive(Default)]
pub struct MockSupervisor {
    units: Mutex<HashMap<String, UnitState>>,
    never_starts: AtomicBool,
    starts: AtomicU32,
    stops: AtomicU32,
    reloads: AtomicU32,
}

impl MockSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Started units stay stopped.
    pub fn never_starts(&self) {
        self.never_starts.store(true, Ordering::SeqCst);
    }

    pub fn set_state(&self, unit: &str, state: UnitState) {
        lock(&self.units).insert(unit.to_string(), state);
    }

    pub fn state_of(&self, unit: &str) -> UnitState {
        lock(&self.units)
            .get(unit)
            .copied()
            .unwrap_or(UnitState::Stopped)
    }

    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn reloads(&self) -> u32 {
        self.reloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Supervisor for MockSupervisor {
    async fn start(&self, unit: &str) -> Result<(), SupervisorError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if !self.never_starts.load(Ordering::SeqCst) {
            self.set_state(unit, UnitState::Running);
        }
        Ok(())
    }

    async fn stop(&self, unit: &str) -> Result<(), SupervisorError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.set_state(unit, UnitState::Stopped);
        Ok(())
    }

    async fn reload(&self) -> Result<(), SupervisorError> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn state(&self, unit: &str) -> Result<UnitState, SupervisorError> {
        Ok(self.state_of(unit))
    }
}

/// Guest control that optionally powers units down on shutdown.
#[derive(Default)]
pub struct MockGuest {
    supervisor: Option<Arc<MockSupervisor>>,
    refuse_shutdown: AtomicBool,
    ignore_shutdown: AtomicBool,
    shutdowns: AtomicU32,
    disks: Mutex<Vec<Disk>>,
    vnc_passwords: Mutex<Vec<(VmId, String)>>,
}

impl MockGuest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepted shutdowns stop the VM's unit on `supervisor`.
    pub fn linked(supervisor: Arc<MockSupervisor>) -> Self {
        Self {
            supervisor: Some(supervisor),
            ..Self::default()
        }
    }

    /// Every shutdown request fails as if the control socket were down.
    pub fn refuse_shutdown(&self) {
        self.refuse_shutdown.store(true, Ordering::SeqCst);
    }

    /// Shutdown requests are accepted but the guest never powers off.
    pub fn ignore_shutdown(&self) {
        self.ignore_shutdown.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_attempts(&self) -> u32 {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn set_disks(&self, disks: Vec<Disk>) {
        *lock(&self.disks) = disks;
    }

    pub fn vnc_passwords(&self) -> Vec<(VmId, String)> {
        lock(&self.vnc_passwords).clone()
    }
}

#[async_trait]
impl GuestControl for MockGuest {
    async fn shutdown(&self, id: &VmId) -> Result<(), GuestError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        if self.refuse_shutdown.load(Ordering::SeqCst) {
            return Err(GuestError::Unavailable(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "control socket refused connection",
            )));
        }

        if let (false, Some(supervisor)) = (self.ignore_shutdown.load(Ordering::SeqCst), &self.supervisor) {
            supervisor.set_state(&Paths::unit_name(id), UnitState::Stopped);
        }
        Ok(())
    }

    async fn set_vnc_password(&self, id: &VmId, password: &str) -> Result<(), GuestError> {
        lock(&self.vnc_passwords).push((*id, password.to_string()));
        Ok(())
    }

    async fn list_disks(&self, _id: &VmId) -> Result<Vec<Disk>, GuestError> {
        Ok(lock(&self.disks).clone())
    }
}

/// Writes empty disk files in place of real images.
pub struct MockImageStore {
    paths: Paths,
    writes: AtomicU32,
}

impl MockImageStore {
    pub fn new(paths: Paths) -> Self {
        Self {
            paths,
            writes: AtomicU32::new(0),
        }
    }

    pub fn writes(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageStore for MockImageStore {
    async fn write_image(
        &self,
        image: &ImageId,
        disk: &DiskId,
        _size_gb: u32,
        backing: bool,
    ) -> Result<Option<PathBuf>> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        tokio::fs::create_dir_all(self.paths.disks_dir()).await?;
        tokio::fs::write(self.paths.disk_path(disk), b"").await?;

        Ok(backing.then(|| self.paths.images_dir().join(format!("{}.qcow2", image))))
    }
}

/// Records cloud-init writes.
#[derive(Default)]
pub struct MockCloudInit {
    writes: Mutex<Vec<(VmId, bool)>>,
}

impl MockCloudInit {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(vm, initial)` per write.
    pub fn writes(&self) -> Vec<(VmId, bool)> {
        lock(&self.writes).clone()
    }
}

#[async_trait]
impl CloudInit for MockCloudInit {
    async fn write(&self, _inst: &Instance, vm: &VirtualMachine, initial: bool) -> Result<()> {
        lock(&self.writes).push((vm.id, initial));
        Ok(())
    }
}

/// Make an interface appear under the sysfs root of `paths`.
pub fn fake_interface(paths: &Paths, iface: &str) -> io::Result<()> {
    std::fs::create_dir_all(paths.sysfs_iface(iface))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_latest_rule_wins() {
        let runner = MockCommandRunner::new();
        runner.fail("ip netns add", "boom");
        runner.fail("ip netns add", "RTNETLINK answers: File exists");

        let output = runner.output("ip", &["netns", "add", "n0abc"]).await.unwrap();
        assert!(!output.success);
        assert!(output.stderr.contains("File exists"));
        assert_eq!(runner.calls(), vec!["ip netns add n0abc"]);
    }

    #[tokio::test]
    async fn test_linked_guest_stops_unit() {
        let supervisor = Arc::new(MockSupervisor::new());
        let guest = MockGuest::linked(Arc::clone(&supervisor));
        let id = VmId::new();
        let unit = Paths::unit_name(&id);

        supervisor.start(&unit).await.unwrap();
        assert_eq!(supervisor.state_of(&unit), UnitState::Running);

        guest.shutdown(&id).await.unwrap();
        assert_eq!(supervisor.state_of(&unit), UnitState::Stopped);
        assert_eq!(guest.shutdown_attempts(), 1);
    }
}
