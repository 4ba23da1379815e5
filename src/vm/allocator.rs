//! Frame Allocator and Eviction
//!
//! Hands out physical frames to user pages and to the kernel. When no frame
//! is free, a user frame is evicted to swap to make room.
//!
//! ## Eviction protocol
//!
//! 1. Locked: pick the least recently used evictable frame, reserve a swap
//!    slot, mark the frame `Evicting`, shoot down its translation on every
//!    processor, detach it from its page table entry (which goes `busy`)
//!    and snapshot its contents.
//! 2. Unlocked: write the snapshot to the reserved slot.
//! 3. Locked: commit the slot, mark the page swapped out, zero the frame
//!    and free it.
//!
//! A failed swap write is fatal: the page's only copy is then the
//! snapshot, and there is no policy for holding on to it.

use super::coremap::FrameState;
use super::swap::reserve_error;
use super::{Vm, VmGuard};
use crate::error::{VmError, VmResult};
use crate::types::{AsId, FrameNumber, PhysAddr, VirtAddr};

impl Vm {
    // ========================================================================
    // User frames
    // ========================================================================

    /// Give `vpage` of `owner` a zeroed frame, evicting if none is free
    ///
    /// The page table entry for `vpage` must exist. The lock may be dropped
    /// and retaken while a victim is written out; the returned guard is the
    /// one the frame was claimed under.
    pub(crate) fn allocate_single<'a>(
        &'a self,
        st: VmGuard<'a>,
        owner: AsId,
        vpage: VirtAddr,
    ) -> VmResult<(VmGuard<'a>, FrameNumber)> {
        let (mut st, frame) = match st.coremap.find_free() {
            Some(frame) => (st, frame),
            None => self.evict_one(st)?,
        };

        self.ram.zero(frame);
        st.coremap.claim_user(frame, owner, vpage);

        let Some(pte) = st.pte_mut(owner, vpage) else {
            log::error!("vm: allocating for {:?} {:#x} with no page table entry", owner, vpage);
            panic!("no page table entry for {:#x} in {:?}", vpage, owner);
        };
        pte.frame = Some(frame);
        pte.resident = true;

        log::trace!("vm: frame {} -> {:?} {:#x}", frame.index(), owner, vpage);
        Ok((st, frame))
    }

    /// Free up one frame by writing the least recently used page to swap
    ///
    /// Returns the freed frame, still `Free`, under a fresh guard.
    pub(crate) fn evict_one<'a>(&'a self, mut st: VmGuard<'a>) -> VmResult<(VmGuard<'a>, FrameNumber)> {
        let swap = self.swap_store()?;

        // Phase 1: claim the victim and detach it from its page.
        let victim = st.coremap.select_victim().ok_or_else(|| {
            log::warn!("vm: no evictable frame");
            VmError::OutOfMemory
        })?;
        let entry = *st.coremap.entry(victim);
        let Some(owner) = entry.owner else {
            log::error!("vm: victim frame {} has no owner", victim.index());
            panic!("evictable frame {} has no owner", victim.index());
        };
        let vpage = entry.vpage;

        let slot = st
            .swap_slots
            .reserve(owner, vpage)
            .map_err(reserve_error)?;

        st.coremap.set_state(victim, FrameState::Evicting);
        self.shootdown(Some(owner), vpage);

        let Some(pte) = st.pte_mut(owner, vpage) else {
            log::error!("vm: victim frame {} backs {:?} {:#x} which has no page table entry", victim.index(), owner, vpage);
            panic!("frame {} owned by {:?} has no page table entry for {:#x}", victim.index(), owner, vpage);
        };
        pte.frame = None;
        pte.busy = true;

        let bytes = self.ram.snapshot(victim);
        drop(st);

        // Phase 2: write it out.
        log::debug!("vm: evicting frame {} ({:?} {:#x}) to slot {}", victim.index(), owner, vpage, slot);
        let offset = match swap.write_page(&bytes, slot) {
            Ok(offset) => offset,
            Err(err) => {
                log::error!("vm: swap write of {:?} {:#x} failed: {}", owner, vpage, err);
                panic!("pageout of {:#x} failed: {}", vpage, err);
            }
        };

        // Phase 3: publish the swap copy and recycle the frame.
        let mut st = self.state.lock();
        st.swap_slots.commit(slot, offset);
        match st.pte_mut(owner, vpage) {
            Some(pte) => {
                pte.resident = false;
                pte.busy = false;
            }
            None => st.swap_slots.release(slot),
        }

        self.ram.zero(victim);
        st.coremap.mark_free(victim);

        self.stats.incr_swap_outs();
        self.stats.incr_evictions();
        Ok((st, victim))
    }

    // ========================================================================
    // Kernel frames
    // ========================================================================

    /// `count` physically contiguous zeroed frames for the kernel
    ///
    /// Only a single frame can be produced by eviction; a larger run with
    /// no free stretch to satisfy it fails.
    pub(crate) fn allocate_contiguous<'a>(
        &'a self,
        st: VmGuard<'a>,
        count: usize,
    ) -> VmResult<(VmGuard<'a>, FrameNumber)> {
        if count == 0 {
            return Err(VmError::OutOfMemory);
        }

        let (mut st, first) = match st.coremap.find_free_run(count) {
            Some(first) => (st, first),
            None if count == 1 => self.evict_one(st)?,
            None => {
                log::error!("vm: no run of {} free frames, and multi-frame eviction is unsupported", count);
                return Err(VmError::OutOfMemory);
            }
        };

        for index in first.index()..first.index() + count {
            self.ram.zero(FrameNumber(index));
        }
        st.coremap.claim_kernel(first, count);
        Ok((st, first))
    }

    /// Allocate `npages` contiguous kernel pages, returning their kseg0 address
    pub fn alloc_kpages(&self, npages: usize) -> VmResult<VirtAddr> {
        let st = self.state.lock();
        let (_st, first) = self.allocate_contiguous(st, npages)?;
        let kvaddr = self.ram.paddr(first).to_kvaddr();
        log::trace!("vm: {} kernel pages at {:#x}", npages, kvaddr);
        Ok(kvaddr)
    }

    /// Release a run returned by `alloc_kpages`
    pub fn free_kpages(&self, kvaddr: VirtAddr) {
        let Some(first) = self.kernel_frame(kvaddr) else {
            log::warn!("vm: free_kpages({:#x}) outside managed memory", kvaddr);
            return;
        };

        let mut st = self.state.lock();
        let entry = *st.coremap.entry(first);
        if entry.npages == 0 {
            if !entry.is_free() {
                log::warn!("vm: free_kpages({:#x}) does not start a kernel run", kvaddr);
            }
            return;
        }

        for index in first.index()..first.index() + entry.npages {
            self.release_locked(&mut st, FrameNumber(index));
        }
    }

    /// Pages in the kernel run starting at `kvaddr`, 0 if none starts there
    pub fn kpage_count(&self, kvaddr: VirtAddr) -> usize {
        match self.kernel_frame(kvaddr) {
            Some(frame) => self.state.lock().coremap.entry(frame).npages,
            None => 0,
        }
    }

    fn kernel_frame(&self, kvaddr: VirtAddr) -> Option<FrameNumber> {
        if !kvaddr.is_page_aligned() {
            return None;
        }
        PhysAddr::from_kvaddr(kvaddr).and_then(|paddr| self.ram.frame_of(paddr))
    }

    // ========================================================================
    // Release
    // ========================================================================

    /// Return a frame to the free pool
    ///
    /// Freeing an already free frame does nothing. Frames holding the
    /// coremap, frames mid-eviction and frames a page is being read into
    /// or copied from are never released.
    pub fn release(&self, frame: FrameNumber) {
        if frame.index() >= self.ram.frame_count() {
            log::warn!("vm: release of frame {} beyond end of memory", frame.index());
            return;
        }
        let mut st = self.state.lock();
        self.release_locked(&mut st, frame);
    }

    pub(crate) fn release_locked(&self, st: &mut VmGuard<'_>, frame: FrameNumber) {
        if st.coremap.is_bootstrap_frame(frame) {
            log::warn!("vm: refusing to release coremap frame {}", frame.index());
            return;
        }

        let entry = *st.coremap.entry(frame);
        match entry.state {
            FrameState::Free => return,
            FrameState::Evicting => {
                log::warn!("vm: refusing to release frame {} mid-eviction", frame.index());
                return;
            }
            FrameState::Fixed | FrameState::Dirty | FrameState::Clean => {}
        }

        // A pinned frame or a busy page is mid-transfer with the lock dropped;
        // whoever started the transfer still writes into this frame.
        let busy = entry
            .owner
            .and_then(|owner| st.pte(owner, entry.vpage))
            .is_some_and(|pte| pte.busy && pte.frame == Some(frame));
        if entry.pinned || busy {
            log::warn!("vm: refusing to release frame {} mid-transfer", frame.index());
            return;
        }

        if let Some(owner) = entry.owner {
            if let Some(pte) = st.pte_mut(owner, entry.vpage) {
                if pte.frame == Some(frame) {
                    pte.frame = None;
                    pte.resident = true;
                }
            }
            self.shootdown(Some(owner), entry.vpage);
        }

        st.coremap.mark_free(frame);
    }
}
