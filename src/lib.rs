//! vm-core - Demand-paged virtual memory for a small multiprocessor kernel
//!
//! This crate provides per-process address spaces, a physical frame table
//! with LRU-style eviction, a swap store on a raw block device and the TLB
//! miss handler that ties them together.
//!
//! The kernel creates one [`Vm`] at boot from the RAM the loader left over
//! and passes it to every operation:
//!
//! - address spaces: `as_create`, `as_copy`, `as_destroy`, `as_activate`,
//!   `as_define_region`, `as_define_stack`, `as_prepare_load`,
//!   `as_complete_load`
//! - faults: `vm_fault`
//! - kernel pages: `alloc_kpages`, `free_kpages`
//!
//! The TLB and the swap device are reached through the [`Mmu`] and
//! [`BlockDevice`] traits; [`SoftMmu`] and [`MemDisk`] model them in tests
//! and hosted builds.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
// Kernel-appropriate clippy configuration
// Many kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]
// Manual ceiling division is clearer in memory allocation contexts
#![allow(clippy::manual_div_ceil)]

// Standard library replacement for no_std
extern crate alloc;

// Core types
pub mod config;
pub mod error;
pub mod types;

// Swap devices
pub mod device;

// Virtual memory
pub mod vm;

pub use config::{RamRange, VmConfig};
pub use device::{BlockDevice, MemDisk};
pub use error::{DeviceError, SwapError, VmError, VmResult};
pub use types::{AsId, FrameNumber, PhysAddr, VirtAddr, PAGE_SIZE};
pub use vm::{
    AddressSpace, FaultType, FrameEntry, FrameState, Mmu, PageTableEntry, Permissions, SlotState,
    SoftMmu, Vm,
};

#[cfg(any(test, feature = "std"))]
pub use device::FileDisk;

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const NAME: &str = "vm-core";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(NAME, "vm-core");
        assert!(!VERSION.is_empty());
    }
}
