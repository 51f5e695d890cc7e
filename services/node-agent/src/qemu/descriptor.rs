//! systemd unit descriptors for QEMU processes.
//!
//! A descriptor embeds the serialized VM on an `X-StratusData=` line so the
//! VM can be rebuilt from disk when nothing is cached. Building one is pure:
//! nothing here touches the filesystem.

use std::path::PathBuf;

use crate::network::names::{adapter_mac, tap_name};
use crate::paths::Paths;
use crate::vm::{AdapterKind, VirtualMachine};

/// Key of the line carrying the serialized VM.
pub const DATA_KEY: &str = "X-StratusData";

pub const QEMU_BINARY: &str = "/usr/bin/qemu-system-x86_64";

// Shorter values cannot hold a VM document.
const MIN_DATA_LEN: usize = 6;

/// One `-drive` clause.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Drive {
    index: u32,
    file: PathBuf,
}

/// One NIC clause.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Nic {
    Tap { ifname: String, mac: String },
    User { mac: String },
}

/// QEMU command line for one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QemuCommand {
    name: String,
    kvm: bool,
    machine: String,
    cpu: String,
    cpus: u32,
    cores: u32,
    threads: u32,
    boot: String,
    memory_mib: u32,
    drives: Vec<Drive>,
    nics: Vec<Nic>,
    qmp_sock: PathBuf,
    pid_file: PathBuf,
    guest_sock: PathBuf,
    vnc_display: Option<u16>,
}

impl QemuCommand {
    pub fn from_vm(vm: &VirtualMachine, paths: &Paths) -> Self {
        let drives = vm
            .disks
            .iter()
            .map(|disk| Drive {
                index: disk.index,
                file: disk.path.clone(),
            })
            .collect();

        let nics = vm
            .network_adapters
            .iter()
            .enumerate()
            .map(|(i, adapter)| {
                let mac = adapter_mac(&vm.id, &adapter.network, i).to_string();
                match adapter.kind {
                    AdapterKind::Bridged => Nic::Tap {
                        ifname: tap_name(&vm.id, i),
                        mac,
                    },
                    AdapterKind::User => Nic::User { mac },
                }
            })
            .collect();

        Self {
            name: format!("stratus_{}", vm.id),
            kvm: vm.kvm,
            machine: vm.machine.clone(),
            cpu: vm.cpu.clone(),
            cpus: vm.processors,
            cores: vm.cores,
            threads: vm.threads,
            boot: vm.boot.clone(),
            memory_mib: vm.memory_mib,
            drives,
            nics,
            qmp_sock: paths.sock_path(&vm.id),
            pid_file: paths.pid_path(&vm.id),
            guest_sock: paths.guest_path(&vm.id),
            vnc_display: vm.vnc.then_some(vm.vnc_display),
        }
    }

    /// Program followed by its arguments.
    pub fn args(&self) -> Vec<String> {
        let mut cmd = vec![QEMU_BINARY.to_string(), "-nographic".to_string()];

        if self.kvm {
            cmd.push("-enable-kvm".to_string());
        }

        cmd.push("-name".to_string());
        cmd.push(self.name.clone());

        cmd.push("-machine".to_string());
        let accel = if self.kvm { ",accel=kvm" } else { "" };
        cmd.push(format!("type={}{}", self.machine, accel));

        cmd.push("-cpu".to_string());
        cmd.push(self.cpu.clone());

        cmd.push("-smp".to_string());
        cmd.push(format!(
            "cpus={},cores={},threads={}",
            self.cpus, self.cores, self.threads
        ));

        cmd.push("-boot".to_string());
        cmd.push(self.boot.clone());

        cmd.push("-m".to_string());
        cmd.push(format!("{}M", self.memory_mib));

        for drive in &self.drives {
            cmd.push("-drive".to_string());
            cmd.push(format!(
                "file={},index={},media=disk,format=qcow2,discard=on,if=virtio",
                drive.file.display(),
                drive.index
            ));
        }

        for (i, nic) in self.nics.iter().enumerate() {
            match nic {
                Nic::Tap { ifname, mac } => {
                    cmd.push("-netdev".to_string());
                    cmd.push(format!(
                        "tap,id=net{},ifname={},script=no,downscript=no",
                        i, ifname
                    ));
                    cmd.push("-device".to_string());
                    cmd.push(format!("virtio-net-pci,netdev=net{},mac={}", i, mac));
                }
                Nic::User { mac } => {
                    cmd.push("-nic".to_string());
                    cmd.push(format!("user,model=virtio-net-pci,mac={}", mac));
                }
            }
        }

        cmd.push("-qmp".to_string());
        cmd.push(format!("unix:{},server,nowait", self.qmp_sock.display()));

        cmd.push("-pidfile".to_string());
        cmd.push(self.pid_file.display().to_string());

        cmd.push("-chardev".to_string());
        cmd.push(format!(
            "socket,path={},server,nowait,id=guest",
            self.guest_sock.display()
        ));
        cmd.push("-device".to_string());
        cmd.push("virtio-serial".to_string());
        cmd.push("-device".to_string());
        cmd.push("virtserialport,chardev=guest,name=org.qemu.guest_agent.0".to_string());

        if let Some(display) = self.vnc_display {
            cmd.push("-vnc".to_string());
            cmd.push(format!(":{},password=on", display));
        }

        cmd
    }
}

/// systemd unit running one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitDescriptor {
    data: String,
    command: QemuCommand,
}

impl UnitDescriptor {
    pub fn from_vm(vm: &VirtualMachine, paths: &Paths) -> Result<Self, serde_json::Error> {
        Ok(Self {
            data: serde_json::to_string(vm)?,
            command: QemuCommand::from_vm(vm, paths),
        })
    }

    pub fn command(&self) -> &QemuCommand {
        &self.command
    }

    pub fn render(&self) -> String {
        format!(
            "[Unit]\n\
             Description=Stratus Virtual Machine\n\
             After=network.target\n\
             \n\
             [Service]\n\
             Type=simple\n\
             User=root\n\
             {}={}\n\
             ExecStart={}\n\
             PrivateTmp=true\n\
             ProtectHome=true\n\
             ProtectSystem=full\n\
             ProtectHostname=true\n\
             ProtectKernelTunables=true\n",
            DATA_KEY,
            self.data,
            self.command.args().join(" ")
        )
    }

    /// Recover the VM embedded in a rendered unit.
    ///
    /// Returns `Ok(None)` when the unit has no data line.
    pub fn parse_vm(text: &str) -> Result<Option<VirtualMachine>, serde_json::Error> {
        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            if key != DATA_KEY || value.len() < MIN_DATA_LEN {
                continue;
            }
            return serde_json::from_str(value).map(Some);
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{Disk, NetworkAdapter};
    use stratus_id::{ImageId, NetworkId, VmId};

    fn paths() -> Paths {
        Paths::new("/var/lib/stratus", "/etc/systemd/system", "/var/run", "/sys/class/net")
    }

    fn vm() -> VirtualMachine {
        let mut vm = VirtualMachine::new(VmId::new(), ImageId::new(), NetworkId::new());
        vm.disks.push(Disk {
            index: 0,
            path: PathBuf::from("/var/lib/stratus/disks/boot.qcow2"),
        });
        vm
    }

    #[test]
    fn test_command_line() {
        let vm = vm();
        let line = QemuCommand::from_vm(&vm, &paths()).args().join(" ");

        assert!(line.starts_with("/usr/bin/qemu-system-x86_64 -nographic -enable-kvm"));
        assert!(line.contains("-machine type=pc,accel=kvm"));
        assert!(line.contains("-smp cpus=1,cores=1,threads=1"));
        assert!(line.contains("-m 1024M"));
        assert!(line.contains(
            "-drive file=/var/lib/stratus/disks/boot.qcow2,index=0,media=disk,format=qcow2,discard=on,if=virtio"
        ));
        assert!(line.contains(&format!(
            "-netdev tap,id=net0,ifname={},script=no,downscript=no",
            tap_name(&vm.id, 0)
        )));
        assert!(line.contains("-device virtio-net-pci,netdev=net0,mac="));
        assert!(line.contains(&format!(
            "-qmp unix:/var/run/stratus/{}.sock,server,nowait",
            vm.id
        )));
        assert!(line.contains("virtserialport,chardev=guest,name=org.qemu.guest_agent.0"));
        assert!(!line.contains("-vnc"));
    }

    #[test]
    fn test_command_line_options() {
        let mut vm = vm();
        vm.kvm = false;
        vm.vnc = true;
        vm.vnc_display = 7;
        vm.network_adapters.push(NetworkAdapter {
            kind: AdapterKind::User,
            ..NetworkAdapter::bridged(NetworkId::new())
        });

        let line = QemuCommand::from_vm(&vm, &paths()).args().join(" ");
        assert!(!line.contains("-enable-kvm"));
        assert!(line.contains("-machine type=pc "));
        assert!(line.contains("-nic user,model=virtio-net-pci,mac="));
        assert!(line.ends_with("-vnc :7,password=on"));
    }

    #[test]
    fn test_build_is_deterministic() {
        let vm = vm();
        let a = UnitDescriptor::from_vm(&vm, &paths()).unwrap().render();
        let b = UnitDescriptor::from_vm(&vm, &paths()).unwrap().render();
        assert_eq!(a, b);
    }

    #[test]
    fn test_descriptor_roundtrip() {
        let vm = vm();
        let text = UnitDescriptor::from_vm(&vm, &paths()).unwrap().render();
        assert!(text.contains("\nX-StratusData={"));
        assert_eq!(UnitDescriptor::parse_vm(&text).unwrap(), Some(vm));
    }

    #[test]
    fn test_parse_without_data_line() {
        let text = "[Service]\nX-StratusData=\nExecStart=/bin/true\n";
        assert_eq!(UnitDescriptor::parse_vm(text).unwrap(), None);
    }

    #[test]
    fn test_parse_malformed_data() {
        let text = "[Service]\nX-StratusData={\"id\": 12345\n";
        assert!(UnitDescriptor::parse_vm(text).is_err());
    }
}
