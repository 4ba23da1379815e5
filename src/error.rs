//! Unified error types for the VM core using thiserror
//!
//! Only recoverable conditions live here. Invariant violations and swap
//! device failures during paging are fatal and panic at the point of
//! detection instead of travelling up as values.

use alloc::string::String;
use thiserror::Error;

use crate::types::VirtAddr;

/// Top-level error type for VM operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    #[error("out of physical memory")]
    OutOfMemory,

    #[error("out of swap space")]
    OutOfSwapSpace,

    #[error("bad address {0:#x}")]
    BadAddress(VirtAddr),

    #[error("no address space")]
    NoAddressSpace,

    #[error("protection violation at {0:#x}")]
    ProtectionViolation(VirtAddr),

    #[error("region [{base:#x}, +{pages} pages) overlaps an existing segment")]
    RegionOverlap { base: VirtAddr, pages: usize },

    #[error("load already in progress")]
    LoadInProgress,

    #[error("complete_load without prepare_load")]
    LoadNotPrepared,

    #[error("swap store not initialized")]
    SwapNotInitialized,

    #[error("swap error: {0}")]
    Swap(#[from] SwapError),
}

/// Swap store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SwapError {
    #[error("no free swap slot")]
    NoFreeSlot,

    #[error("page {vpage:#x} already has swap slot {slot}")]
    AlreadyTagged { vpage: VirtAddr, slot: usize },

    #[error("swap device holds {available} slots, {required} configured")]
    DeviceTooSmall { available: usize, required: usize },

    #[error("device error: {0}")]
    Device(#[from] DeviceError),
}

/// Block device errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("access [{offset:#x}, +{len:#x}) beyond end of device")]
    OutOfRange { offset: u64, len: usize },

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias used throughout the crate
pub type VmResult<T> = Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_error_display() {
        assert_eq!(VmError::OutOfMemory.to_string(), "out of physical memory");
        assert_eq!(
            VmError::BadAddress(VirtAddr::new(0x1000)).to_string(),
            "bad address 0x1000"
        );
    }

    #[test]
    fn test_swap_error_conversion() {
        let err: VmError = SwapError::NoFreeSlot.into();
        assert_eq!(err, VmError::Swap(SwapError::NoFreeSlot));

        let dev = DeviceError::OutOfRange { offset: 0x2000, len: 4096 };
        let swap: SwapError = dev.clone().into();
        assert_eq!(swap, SwapError::Device(dev));
    }
}
