//! # stratus-id
//!
//! Typed identifiers for the resources a hypervisor node manages.
//!
//! Every ID is a ULID wrapped in a newtype with a short prefix, rendered as
//! `{prefix}_{ulid}`:
//!
//! - `vm_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `dsk_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `vnet_01HV4Z4NYPLTRS0JTUA8XDME5F`
//!
//! The text form is what lands in unit file names, disk file names and the
//! record store, so parsing is strict: the prefix must match the type and the
//! ULID must decode.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
