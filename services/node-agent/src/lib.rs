//! Stratus Node Agent Library
//!
//! The node agent runs on each hypervisor host. It provisions, boots, stops
//! and tears down QEMU virtual machines supervised by systemd, builds each
//! VM's network namespace, and keeps instance records in line with the
//! units actually present on the host.
//!
//! ## Architecture
//!
//! ```text
//! Reconciler ──► VmManager ──► Supervisor (systemctl)
//!                   │    └──► GuestControl (QMP)
//!                   ├──► NetworkEngine ──► CommandRunner (ip, brctl, iptables)
//!                   ├──► RecordStore (SQLite)
//!                   └──► StateCache
//! ```
//!
//! ## Modules
//!
//! - `lifecycle`: create / power-on / power-off / destroy / cleanup
//! - `network`: namespace, veth, bridge, NAT and addressing pipeline
//! - `reconciler`: unit discovery and state commits
//! - `state`: local SQLite record store

pub mod cache;
pub mod cloudinit;
pub mod command;
pub mod config;
pub mod error;
pub mod image;
pub mod lifecycle;
pub mod network;
pub mod paths;
pub mod qemu;
pub mod reconciler;
pub mod state;
pub mod systemd;
pub mod testing;
pub mod vm;

// Re-export commonly used types
pub use cache::StateCache;
pub use config::{Config, NetworkMode};
pub use error::{Error, Result};
pub use lifecycle::{Collaborators, VmManager};
pub use network::NetworkEngine;
pub use reconciler::{Reconciler, ReconcilerConfig};
pub use state::{RecordStore, SqliteRecordStore, StoreError};
pub use vm::{Instance, InstanceState, VirtualMachine, VmState};
