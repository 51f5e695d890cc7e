//! NoCloud seed files.

use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::paths::Paths;
use crate::vm::{Instance, VirtualMachine};

/// Writes the guest's first-boot configuration.
#[async_trait]
pub trait CloudInit: Send + Sync {
    /// Write seed data for a VM. `initial` replaces user data that already
    /// exists; otherwise only instance metadata is refreshed.
    async fn write(&self, inst: &Instance, vm: &VirtualMachine, initial: bool) -> Result<()>;
}

/// NoCloud datasource files in the VM's init dir.
pub struct NoCloudWriter {
    paths: Paths,
}

impl NoCloudWriter {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }
}

fn meta_data(inst: &Instance) -> String {
    format!(
        "instance-id: {}\nlocal-hostname: {}\n",
        inst.id, inst.name
    )
}

fn user_data(inst: &Instance) -> String {
    format!(
        "#cloud-config\nhostname: {}\npreserve_hostname: false\nmanage_etc_hosts: true\n",
        inst.name
    )
}

async fn write_file(path: &Path, contents: String) -> Result<()> {
    tokio::fs::write(path, contents).await?;
    Ok(())
}

#[async_trait]
impl CloudInit for NoCloudWriter {
    async fn write(&self, inst: &Instance, vm: &VirtualMachine, initial: bool) -> Result<()> {
        let dir = self.paths.init_dir(&vm.id);
        tokio::fs::create_dir_all(&dir).await?;

        write_file(&dir.join("meta-data"), meta_data(inst)).await?;

        let user = dir.join("user-data");
        if initial || !tokio::fs::try_exists(&user).await? {
            write_file(&user, user_data(inst)).await?;
        }

        debug!(vm_id = %vm.id, initial, "Cloud-init data written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_id::{ImageId, NetworkId, VmId};

    #[tokio::test]
    async fn test_user_data_kept_after_first_boot() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path(), dir.path(), dir.path(), dir.path());
        let writer = NoCloudWriter::new(paths.clone());

        let mut inst = Instance::new(VmId::new(), "web-1", ImageId::new());
        let vm = VirtualMachine::new(inst.id, inst.image, NetworkId::new());
        writer.write(&inst, &vm, true).await.unwrap();

        let user = paths.init_dir(&vm.id).join("user-data");
        std::fs::write(&user, "#cloud-config\ncustom: true\n").unwrap();

        inst.name = "web-2".to_string();
        writer.write(&inst, &vm, false).await.unwrap();

        let meta = std::fs::read_to_string(paths.init_dir(&vm.id).join("meta-data")).unwrap();
        assert!(meta.contains("local-hostname: web-2"));
        assert_eq!(std::fs::read_to_string(&user).unwrap(), "#cloud-config\ncustom: true\n");

        writer.write(&inst, &vm, true).await.unwrap();
        assert!(std::fs::read_to_string(&user).unwrap().contains("hostname: web-2"));
    }
}
