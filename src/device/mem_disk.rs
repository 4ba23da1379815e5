//! RAM-backed block device

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::Mutex;

use super::{check_range, BlockDevice};
use crate::error::DeviceError;

/// Block device held entirely in memory
///
/// Writes and reads can be made to fail on demand so callers can exercise
/// their device-error paths.
#[derive(Debug)]
pub struct MemDisk {
    data: Mutex<Vec<u8>>,
    size: u64,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemDisk {
    /// Create a zero-filled device of `size` bytes
    pub fn new(size: usize) -> Self {
        Self {
            data: Mutex::new(vec![0u8; size]),
            size: size as u64,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Make subsequent reads fail (or succeed again)
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent writes fail (or succeed again)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Completed reads
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Completed writes
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl BlockDevice for MemDisk {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        check_range(self.size, offset, buf.len())?;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(DeviceError::Io(String::from("injected read failure")));
        }

        let start = offset as usize;
        let data = self.data.lock();
        buf.copy_from_slice(&data[start..start + buf.len()]);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<(), DeviceError> {
        check_range(self.size, offset, buf.len())?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DeviceError::Io(String::from("injected write failure")));
        }

        let start = offset as usize;
        let mut data = self.data.lock();
        data[start..start + buf.len()].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }
}
