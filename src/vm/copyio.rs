//! Copyin/Copyout - User/Kernel Data Transfer
//!
//! Moves bytes between a kernel buffer and an address space, one page at a
//! time. Each page is brought into memory first, so a transfer may evict
//! other pages and read this one back from swap. Unlike a hardware copy,
//! nothing here can fault: bad addresses come back as errors.
//!
//! Writes honor segment permissions. A loader between `as_prepare_load`
//! and `as_complete_load` sees every segment as writable.

use super::addrspace::AddressSpace;
use super::{Vm, VmGuard};
use crate::error::{VmError, VmResult};
use crate::types::{FrameNumber, VirtAddr, PAGE_SIZE, USERSPACETOP};

/// Maximum size for a single copy operation
pub const COPYIO_MAX_SIZE: usize = 64 * 1024;

/// Reject ranges that leave user space or exceed `COPYIO_MAX_SIZE`
fn check_user_range(addr: VirtAddr, len: usize) -> VmResult<()> {
    if len > COPYIO_MAX_SIZE {
        return Err(VmError::BadAddress(addr));
    }
    match addr.as_u64().checked_add(len as u64) {
        Some(end) if end <= USERSPACETOP => Ok(()),
        _ => Err(VmError::BadAddress(addr)),
    }
}

impl Vm {
    /// Copy `buf.len()` bytes from user address `src` into `buf`
    pub fn copyin(&self, aspace: &AddressSpace, src: VirtAddr, buf: &mut [u8]) -> VmResult<usize> {
        check_user_range(src, buf.len())?;

        let mut done = 0;
        while done < buf.len() {
            let addr = src.add(done as u64);
            let chunk = (PAGE_SIZE - addr.page_offset()).min(buf.len() - done);
            let (_st, frame) = self.user_frame(aspace, addr, false)?;
            self.ram.read(frame, addr.page_offset(), &mut buf[done..done + chunk]);
            done += chunk;
        }
        Ok(done)
    }

    /// Copy `data` out to user address `dst`
    pub fn copyout(&self, aspace: &AddressSpace, dst: VirtAddr, data: &[u8]) -> VmResult<usize> {
        check_user_range(dst, data.len())?;

        let mut done = 0;
        while done < data.len() {
            let addr = dst.add(done as u64);
            let chunk = (PAGE_SIZE - addr.page_offset()).min(data.len() - done);
            let (_st, frame) = self.user_frame(aspace, addr, true)?;
            self.ram.write(frame, addr.page_offset(), &data[done..done + chunk]);
            done += chunk;
        }
        Ok(done)
    }

    /// Copy a NUL-terminated string from user space
    ///
    /// Returns the string length, not counting the terminator, which is
    /// copied too. A string that does not fit in `buf` is an error.
    pub fn copyinstr(&self, aspace: &AddressSpace, src: VirtAddr, buf: &mut [u8]) -> VmResult<usize> {
        let mut done = 0;
        while done < buf.len() {
            let addr = src.add(done as u64);
            check_user_range(addr, 1)?;
            let chunk = (PAGE_SIZE - addr.page_offset()).min(buf.len() - done);
            let (_st, frame) = self.user_frame(aspace, addr, false)?;
            let out = &mut buf[done..done + chunk];
            self.ram.read(frame, addr.page_offset(), out);
            if let Some(nul) = out.iter().position(|&b| b == 0) {
                return Ok(done + nul);
            }
            done += chunk;
        }
        Err(VmError::BadAddress(src.add(done as u64)))
    }

    /// Frame holding the page at `addr`, paged in
    ///
    /// The frame stays put only while the returned guard is held.
    fn user_frame<'a>(
        &'a self,
        aspace: &AddressSpace,
        addr: VirtAddr,
        write: bool,
    ) -> VmResult<(VmGuard<'a>, FrameNumber)> {
        let segment = aspace.segment_for(addr).ok_or(VmError::BadAddress(addr))?;
        if write && !segment.perms.can_write() {
            return Err(VmError::ProtectionViolation(addr));
        }
        let st = self.state.lock();
        self.resolve(st, aspace.id(), addr.trunc_page())
    }
}
