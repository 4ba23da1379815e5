//! Block devices backing the swap store
//!
//! The VM core only needs byte-offset read/write/stat on a raw device,
//! the same surface a vnode opened on `lhd0raw:` provides. Implementations
//! must be callable from several processors at once; each one serializes
//! its own I/O internally.
//!
//! - `MemDisk`: RAM-backed device with fault injection, used for tests and
//!   for diskless configurations
//! - `FileDisk`: file-backed device image (requires `std`)

pub mod mem_disk;

#[cfg(any(test, feature = "std"))]
pub mod file_disk;

pub use mem_disk::MemDisk;

#[cfg(any(test, feature = "std"))]
pub use file_disk::FileDisk;

use crate::error::DeviceError;

/// Byte-addressed block device
pub trait BlockDevice: Send + Sync {
    /// Read `buf.len()` bytes starting at `offset`
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError>;

    /// Write all of `buf` starting at `offset`
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<(), DeviceError>;

    /// Device size in bytes
    fn size(&self) -> u64;
}

/// Reject accesses that run past the end of a device of `size` bytes
pub(crate) fn check_range(size: u64, offset: u64, len: usize) -> Result<(), DeviceError> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= size => Ok(()),
        _ => Err(DeviceError::OutOfRange { offset, len }),
    }
}
