//! Per-VM network data plane.
//!
//! Each VM's primary adapter gets a network namespace holding an
//! in-namespace bridge (`br0`) that joins the instance tap to a VLAN
//! sub-interface of the internal veth. Optional external and host veths
//! carry public and host-management traffic, NATed to the private address.

mod engine;
mod firewall;
pub mod names;
mod registry;

pub use engine::{NetworkEngine, Step};
pub use firewall::FirewallLock;
pub use registry::InterfaceRegistry;
