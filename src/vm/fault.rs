//! Fault Handler - TLB Miss Resolution
//!
//! Entered from the trap dispatcher on a TLB miss or a write to a clean
//! (read-only) TLB entry.
//!
//! ```text
//! Miss ──▶ no address space / no segment / no PTE ──▶ Err (Invalid)
//!   │
//!   ├──▶ PTE has a frame ──────────────────────────▶ Backed
//!   │
//!   └──▶ Unbacked: allocate frame (may evict)
//!            └──▶ swapped out? read it back ───────▶ Backed
//!
//! Backed ──▶ install translation in the local TLB ──▶ Ok(paddr)
//! ```
//!
//! Writes to pages of a read-only segment are protection violations; they
//! are never granted, and the dispatcher kills the faulting process. A
//! write to a clean entry of a writable segment just reloads it dirty.

use super::addrspace::AddressSpace;
use super::swap::bounce_buffer;
use super::tlb::{SplGuard, TlbEntry};
use super::{Vm, VmGuard};
use crate::error::{VmError, VmResult};
use crate::types::{AsId, FrameNumber, PhysAddr, VirtAddr};

/// Kind of access that missed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FaultType {
    /// Load from an unmapped page
    Read = 0,
    /// Store to an unmapped page
    Write = 1,
    /// Store to a page mapped without write permission
    ReadOnly = 2,
}

impl Vm {
    /// Resolve a fault at `addr` and load the translation into the TLB
    pub fn vm_fault(
        &self,
        aspace: Option<&AddressSpace>,
        kind: FaultType,
        addr: VirtAddr,
    ) -> VmResult<PhysAddr> {
        self.stats.incr_faults();
        let result = self.handle_fault(aspace, kind, addr);
        if let Err(err) = &result {
            self.stats.incr_fault_failures();
            log::debug!("vm: {:?} fault at {:#x} failed: {}", kind, addr, err);
        }
        result
    }

    fn handle_fault(
        &self,
        aspace: Option<&AddressSpace>,
        kind: FaultType,
        addr: VirtAddr,
    ) -> VmResult<PhysAddr> {
        let aspace = aspace.ok_or(VmError::NoAddressSpace)?;
        let vpage = addr.trunc_page();
        let segment = aspace.segment_for(addr).ok_or(VmError::BadAddress(addr))?;
        let writable = segment.perms.can_write();

        // A store through a clean entry is legal once the segment is
        // writable (a loader's segments, for one); the translation is
        // reloaded with the dirty bit.
        match kind {
            FaultType::Write | FaultType::ReadOnly if !writable => {
                return Err(VmError::ProtectionViolation(addr))
            }
            FaultType::Read | FaultType::Write | FaultType::ReadOnly => {}
        }

        let st = self.state.lock();
        let (st, frame) = self.resolve(st, aspace.id(), vpage)?;
        let paddr = self.ram.paddr(frame);

        // Installed before the lock drops so an eviction cannot slip in
        // between and leave a stale translation behind.
        self.install_translation(vpage, paddr, writable);
        drop(st);

        Ok(paddr.add(addr.page_offset() as u64))
    }

    /// Bring the page containing `addr` into memory without touching the TLB
    pub fn page_alloc(&self, aspace: &AddressSpace, addr: VirtAddr) -> VmResult<PhysAddr> {
        if aspace.segment_for(addr).is_none() {
            return Err(VmError::BadAddress(addr));
        }
        let st = self.state.lock();
        let (_st, frame) = self.resolve(st, aspace.id(), addr.trunc_page())?;
        Ok(self.ram.paddr(frame))
    }

    fn install_translation(&self, vpage: VirtAddr, paddr: PhysAddr, writable: bool) {
        let mmu = self.mmu();
        let entry = TlbEntry::new(vpage, paddr, writable);

        let _spl = SplGuard::raise(mmu);
        match mmu.probe(vpage) {
            Some(slot) => mmu.write(slot, entry),
            None => mmu.write_random(entry),
        }
        log::trace!("vm: tlb {:#x} -> {:#x}{}", vpage, paddr, if writable { " rw" } else { "" });
    }

    /// The frame backing `vpage` of `owner`, paging it in if needed
    ///
    /// Waits out any transfer already in flight for the page.
    pub(crate) fn resolve<'a>(
        &'a self,
        mut st: VmGuard<'a>,
        owner: AsId,
        vpage: VirtAddr,
    ) -> VmResult<(VmGuard<'a>, FrameNumber)> {
        loop {
            let pte = st.pte(owner, vpage).ok_or(VmError::BadAddress(vpage))?;
            if pte.busy {
                drop(st);
                core::hint::spin_loop();
                st = self.state.lock();
                continue;
            }

            return match pte.frame {
                Some(frame) => {
                    st.coremap.touch(frame);
                    Ok((st, frame))
                }
                None => self.page_in(st, owner, vpage, pte.resident),
            };
        }
    }

    /// Back a frameless page: zero-filled if it was never written out,
    /// otherwise read back from swap
    fn page_in<'a>(
        &'a self,
        mut st: VmGuard<'a>,
        owner: AsId,
        vpage: VirtAddr,
        resident: bool,
    ) -> VmResult<(VmGuard<'a>, FrameNumber)> {
        set_busy(&mut st, owner, vpage, true);

        let (mut st, frame) = match self.allocate_single(st, owner, vpage) {
            Ok(claimed) => claimed,
            Err(err) => {
                // The entry itself is untouched on failure; just unmark it.
                set_busy(&mut self.state.lock(), owner, vpage, false);
                return Err(err);
            }
        };

        if resident {
            self.stats.incr_zero_fills();
        } else {
            st.coremap.set_pinned(frame, true);
            drop(st);

            let mut buf = bounce_buffer();
            if let Err(err) = self.swap_in(owner, vpage, &mut buf) {
                log::error!("vm: page-in of {:?} {:#x} failed: {}", owner, vpage, err);
                panic!("swap read of {:#x} failed: {}", vpage, err);
            }
            self.ram.fill_from(frame, &buf);

            st = self.state.lock();
            st.coremap.set_pinned(frame, false);
        }

        set_busy(&mut st, owner, vpage, false);
        Ok((st, frame))
    }
}

fn set_busy(st: &mut VmGuard<'_>, owner: AsId, vpage: VirtAddr, busy: bool) {
    if let Some(pte) = st.pte_mut(owner, vpage) {
        pte.busy = busy;
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::vm_with;
    use super::*;
    use crate::types::PAGE_SIZE;
    use crate::vm::segment::Permissions;

    fn va(addr: u64) -> VirtAddr {
        VirtAddr::new(addr)
    }

    #[test]
    fn test_fault_without_address_space() {
        let (vm, _, _) = vm_with(8, 4);
        assert_eq!(
            vm.vm_fault(None, FaultType::Read, va(0x1000)),
            Err(VmError::NoAddressSpace)
        );
        assert_eq!(vm.stats().fault_failures, 1);
    }

    #[test]
    fn test_fault_outside_segments() {
        let (vm, _, _) = vm_with(8, 4);
        let mut aspace = vm.as_create();
        vm.as_define_region(&mut aspace, va(0x1000), PAGE_SIZE as u64, Permissions::READ, false)
            .unwrap();
        assert_eq!(
            vm.vm_fault(Some(&aspace), FaultType::Read, va(0x2000)),
            Err(VmError::BadAddress(va(0x2000)))
        );
        vm.as_destroy(aspace);
    }

    #[test]
    fn test_read_fault_installs_clean_entry() {
        let (vm, mmu, _) = vm_with(8, 4);
        let mut aspace = vm.as_create();
        vm.as_define_region(&mut aspace, va(0x1000), PAGE_SIZE as u64, Permissions::READ, false)
            .unwrap();

        let paddr = vm.vm_fault(Some(&aspace), FaultType::Read, va(0x1234)).unwrap();
        assert_eq!(paddr.as_u64() & 0xfff, 0x234);

        let entry = mmu.lookup(mmu.current_cpu(), va(0x1000)).unwrap();
        assert!(!entry.dirty);
        assert_eq!(entry.paddr.as_u64(), paddr.as_u64() & !0xfff);
        assert_eq!(vm.stats().zero_fills, 1);
        vm.as_destroy(aspace);
    }

    #[test]
    fn test_write_to_read_only_segment_is_refused() {
        let (vm, _, _) = vm_with(8, 4);
        let mut aspace = vm.as_create();
        vm.as_define_region(&mut aspace, va(0x1000), PAGE_SIZE as u64, Permissions::READ, false)
            .unwrap();

        assert_eq!(
            vm.vm_fault(Some(&aspace), FaultType::Write, va(0x1000)),
            Err(VmError::ProtectionViolation(va(0x1000)))
        );
        assert_eq!(
            vm.vm_fault(Some(&aspace), FaultType::ReadOnly, va(0x1000)),
            Err(VmError::ProtectionViolation(va(0x1000)))
        );
        assert!(vm.frames_owned_by(aspace.id()).is_empty());
        vm.as_destroy(aspace);
    }

    #[test]
    fn test_read_only_fault_during_load_upgrades_entry() {
        let (vm, mmu, _) = vm_with(8, 4);
        let mut aspace = vm.as_create();
        vm.as_define_region(&mut aspace, va(0x1000), PAGE_SIZE as u64, Permissions::READ, false)
            .unwrap();

        let first = vm.vm_fault(Some(&aspace), FaultType::Read, va(0x1000)).unwrap();
        assert!(!mmu.lookup(mmu.current_cpu(), va(0x1000)).unwrap().dirty);

        vm.as_prepare_load(&mut aspace).unwrap();
        assert!(mmu.lookup(mmu.current_cpu(), va(0x1000)).is_none());

        // The loader's store through the old clean entry
        let paddr = vm.vm_fault(Some(&aspace), FaultType::ReadOnly, va(0x1000)).unwrap();
        assert_eq!(paddr, first);
        assert!(mmu.lookup(mmu.current_cpu(), va(0x1000)).unwrap().dirty);

        vm.as_complete_load(&mut aspace).unwrap();
        assert_eq!(
            vm.vm_fault(Some(&aspace), FaultType::ReadOnly, va(0x1000)),
            Err(VmError::ProtectionViolation(va(0x1000)))
        );
        vm.as_destroy(aspace);
    }

    #[test]
    fn test_refault_reuses_frame_and_slot() {
        let (vm, mmu, _) = vm_with(8, 4);
        let mut aspace = vm.as_create();
        vm.as_define_region(&mut aspace, va(0x1000), PAGE_SIZE as u64, Permissions::READ_WRITE, false)
            .unwrap();

        let first = vm.vm_fault(Some(&aspace), FaultType::Write, va(0x1000)).unwrap();
        assert!(mmu.lookup(mmu.current_cpu(), va(0x1000)).unwrap().dirty);
        let tlb_before = mmu.valid_entries(mmu.current_cpu()).len();

        let second = vm.vm_fault(Some(&aspace), FaultType::Write, va(0x1000)).unwrap();
        assert_eq!(first, second);
        assert_eq!(mmu.valid_entries(mmu.current_cpu()).len(), tlb_before);
        vm.as_destroy(aspace);
    }

    #[test]
    fn test_page_alloc_leaves_tlb_alone() {
        let (vm, mmu, _) = vm_with(8, 4);
        let mut aspace = vm.as_create();
        vm.as_define_region(&mut aspace, va(0x1000), PAGE_SIZE as u64, Permissions::READ_WRITE, false)
            .unwrap();

        vm.page_alloc(&aspace, va(0x1000)).unwrap();
        assert!(mmu.valid_entries(mmu.current_cpu()).is_empty());
        assert!(vm.page_entry(&aspace, va(0x1000)).unwrap().frame.is_some());
        vm.as_destroy(aspace);
    }
}
