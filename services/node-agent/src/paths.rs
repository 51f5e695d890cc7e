//! Filesystem layout for VM-scoped files.
//!
//! Everything is keyed by VM id under a small set of roots, so tests can
//! point the whole layout at a temporary directory.

use std::path::{Path, PathBuf};

use stratus_id::{DiskId, VmId};

use crate::config::Config;

/// Prefix shared by every VM unit file.
pub const UNIT_PREFIX: &str = "stratus_";

const UNIT_SUFFIX: &str = ".service";

/// Path conventions for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    lib_dir: PathBuf,
    systemd_dir: PathBuf,
    run_dir: PathBuf,
    sysfs_net_dir: PathBuf,
}

impl Paths {
    pub fn new(
        lib_dir: impl Into<PathBuf>,
        systemd_dir: impl Into<PathBuf>,
        run_dir: impl Into<PathBuf>,
        sysfs_net_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            lib_dir: lib_dir.into(),
            systemd_dir: systemd_dir.into(),
            run_dir: run_dir.into(),
            sysfs_net_dir: sysfs_net_dir.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.lib_dir,
            &config.systemd_dir,
            &config.run_dir,
            &config.sysfs_net_dir,
        )
    }

    pub fn lib_dir(&self) -> &Path {
        &self.lib_dir
    }

    pub fn systemd_dir(&self) -> &Path {
        &self.systemd_dir
    }

    /// Directory holding per-VM sockets and pid files.
    pub fn runtime_dir(&self) -> PathBuf {
        self.run_dir.join("stratus")
    }

    pub fn vm_dir(&self, id: &VmId) -> PathBuf {
        self.lib_dir.join("vms").join(id.to_string())
    }

    pub fn disks_dir(&self) -> PathBuf {
        self.lib_dir.join("disks")
    }

    pub fn disk_path(&self, id: &DiskId) -> PathBuf {
        self.disks_dir().join(format!("{}.qcow2", id))
    }

    pub fn images_dir(&self) -> PathBuf {
        self.lib_dir.join("images")
    }

    pub fn init_dir(&self, id: &VmId) -> PathBuf {
        self.lib_dir.join("init").join(id.to_string())
    }

    pub fn leases_dir(&self) -> PathBuf {
        self.lib_dir.join("leases")
    }

    pub fn lease_path(&self, id: &VmId) -> PathBuf {
        self.leases_dir().join(format!("{}.leases", id))
    }

    pub fn state_db(&self) -> PathBuf {
        self.lib_dir.join("agent.db")
    }

    pub fn unit_name(id: &VmId) -> String {
        format!("{}{}{}", UNIT_PREFIX, id, UNIT_SUFFIX)
    }

    /// Recover the VM id from a unit file name.
    pub fn parse_unit_name(name: &str) -> Option<VmId> {
        let id = name.strip_prefix(UNIT_PREFIX)?.strip_suffix(UNIT_SUFFIX)?;
        id.parse().ok()
    }

    pub fn unit_path(&self, id: &VmId) -> PathBuf {
        self.systemd_dir.join(Self::unit_name(id))
    }

    /// QMP control socket.
    pub fn sock_path(&self, id: &VmId) -> PathBuf {
        self.runtime_dir().join(format!("{}.sock", id))
    }

    /// Guest agent channel.
    pub fn guest_path(&self, id: &VmId) -> PathBuf {
        self.runtime_dir().join(format!("{}.guest", id))
    }

    pub fn pid_path(&self, id: &VmId) -> PathBuf {
        self.runtime_dir().join(format!("{}.pid", id))
    }

    /// Pid file of the lease client bound to an external interface.
    pub fn dhclient_pid_path(&self, iface: &str) -> PathBuf {
        self.run_dir.join(format!("dhclient-{}.pid", iface))
    }

    /// Sysfs entry that appears once a host interface exists.
    pub fn sysfs_iface(&self, iface: &str) -> PathBuf {
        self.sysfs_net_dir.join(iface)
    }
}
