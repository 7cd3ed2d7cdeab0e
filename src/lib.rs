//! Rook - memory management core of a 32-bit x86 kernel
//!
//! This crate owns the machine's paging hardware and exposes a model in
//! which every process has an address space built from named [`Region`]s,
//! each backed by a [`VmObject`] that may be anonymous (zero-filled on
//! demand), inode-backed (demand paged from disk), or a wrapper around a
//! fixed physical range. Physical frames come from two pools (supervisor
//! and user), faults are serviced with demand-zero, demand-paging and
//! copy-on-write, and address-space clones arm COW sharing.
//!
//! [`Region`]: vm::Region
//! [`VmObject`]: vm::VmObject

#![cfg_attr(not(test), no_std)]
// Kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]
// Hardware structures use explicit bit shifts for documentation
#![allow(clippy::identity_op)]

extern crate alloc;

pub mod arch;
pub mod console;
pub mod fs;
pub mod panic;
pub mod process;
pub mod vm;

/// Kernel name
pub const NAME: &str = "Rook";
/// Kernel version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the memory management core.
///
/// Must run once during early boot, before any address space or region is
/// created.
pub fn init() {
    vm::memory_manager::init();
}
