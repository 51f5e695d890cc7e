//! QEMU integration: unit descriptors and the QMP control channel.

mod descriptor;
mod monitor;

pub use descriptor::{QemuCommand, UnitDescriptor, DATA_KEY, QEMU_BINARY};
pub use monitor::{GuestControl, GuestError, QmpMonitor};
