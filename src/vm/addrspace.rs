//! Address Spaces
//!
//! An `AddressSpace` is the handle a process holds: its identity, its
//! declared segments and its heap break. The page table lives inside the
//! VM state, keyed by the address space id, because its residency bits
//! change under eviction from other processors.
//!
//! The handle is neither `Clone` nor `Copy`. `as_copy` borrows the source
//! and `as_destroy` consumes the handle, so the two can never race on the
//! same address space.

use alloc::vec::Vec;

use super::page_table::PageTable;
use super::segment::{Permissions, Segment};
use super::tlb;
use super::Vm;
use crate::error::{VmError, VmResult};
use crate::types::{round_page, AsId, VirtAddr, PAGE_SHIFT, PAGE_SIZE, USERSPACETOP};

/// Per-process virtual address space
#[derive(Debug)]
pub struct AddressSpace {
    id: AsId,
    segments: Vec<Segment>,
    heap_start: VirtAddr,
    heap_end: VirtAddr,
    /// Segment permissions saved by `as_prepare_load`
    saved_perms: Vec<Permissions>,
    loading: bool,
}

impl AddressSpace {
    fn new() -> Self {
        Self {
            id: AsId::new(),
            segments: Vec::new(),
            heap_start: VirtAddr::new(0),
            heap_end: VirtAddr::new(0),
            saved_perms: Vec::new(),
            loading: false,
        }
    }

    pub fn id(&self) -> AsId {
        self.id
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Segment containing `addr`
    pub fn segment_for(&self, addr: VirtAddr) -> Option<&Segment> {
        self.segments.iter().find(|s| s.contains(addr))
    }

    pub fn heap_start(&self) -> VirtAddr {
        self.heap_start
    }

    /// Current end of the bump heap
    pub fn heap_break(&self) -> VirtAddr {
        self.heap_end
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn has_stack(&self) -> bool {
        self.segments.iter().any(|s| s.is_stack)
    }
}

impl Vm {
    /// New empty address space
    pub fn as_create(&self) -> AddressSpace {
        let aspace = AddressSpace::new();
        self.state.lock().page_tables.insert(aspace.id, PageTable::new());
        log::trace!("vm: created {:?}", aspace.id);
        aspace
    }

    /// Declare `[base, base + len)` as a segment
    ///
    /// The range is widened to page boundaries. A range that covers no
    /// page is accepted and ignored. Non-stack regions move the heap to
    /// start at their end.
    pub fn as_define_region(
        &self,
        aspace: &mut AddressSpace,
        base: VirtAddr,
        len: u64,
        perms: Permissions,
        is_stack: bool,
    ) -> VmResult<()> {
        let start = base.trunc_page();
        let end = base
            .as_u64()
            .checked_add(len)
            .filter(|&end| end <= USERSPACETOP)
            .map(round_page)
            .ok_or(VmError::BadAddress(base))?;
        let pages = ((end - start.as_u64()) >> PAGE_SHIFT) as usize;
        if len == 0 || pages == 0 {
            return Ok(());
        }

        if aspace.segments.iter().any(|s| s.overlaps(start, pages)) {
            return Err(VmError::RegionOverlap { base: start, pages });
        }
        aspace
            .segments
            .try_reserve(1)
            .map_err(|_| VmError::OutOfMemory)?;

        // A segment declared mid-load is writable until the load completes.
        let effective = if aspace.loading { Permissions::READ_WRITE } else { perms };
        let segment = Segment::new(start, pages, effective, is_stack);
        {
            let mut st = self.state.lock();
            let table = st
                .page_tables
                .get_mut(&aspace.id)
                .ok_or(VmError::NoAddressSpace)?;
            table.try_reserve(pages).map_err(|_| VmError::OutOfMemory)?;
            for vpage in segment.pages() {
                table.insert(vpage);
            }
        }
        aspace.segments.push(segment);
        if aspace.loading {
            aspace.saved_perms.push(perms);
        }

        if !is_stack {
            aspace.heap_start = VirtAddr::new(end);
            aspace.heap_end = VirtAddr::new(end);
        }
        log::debug!(
            "vm: {:?} region [{:#x}, {:#x}) {:?}{}",
            aspace.id,
            start,
            end,
            perms,
            if is_stack { " stack" } else { "" }
        );
        Ok(())
    }

    /// Set up the user stack, returning the initial stack pointer
    ///
    /// Calling this again once the stack exists just returns the pointer.
    pub fn as_define_stack(&self, aspace: &mut AddressSpace) -> VmResult<VirtAddr> {
        let top = self.config.user_stack_top;
        if !aspace.has_stack() {
            let bytes = (self.config.stack_pages * PAGE_SIZE) as u64;
            let base = top
                .as_u64()
                .checked_sub(bytes)
                .ok_or(VmError::BadAddress(top))?;
            self.as_define_region(aspace, VirtAddr::new(base), bytes, Permissions::READ_WRITE, true)?;
        }
        Ok(top)
    }

    /// Open every segment for writing while the loader fills it in
    pub fn as_prepare_load(&self, aspace: &mut AddressSpace) -> VmResult<()> {
        if aspace.loading {
            return Err(VmError::LoadInProgress);
        }
        self.as_define_stack(aspace)?;

        aspace.saved_perms.clear();
        for segment in aspace.segments.iter_mut() {
            aspace.saved_perms.push(segment.perms);
            segment.perms = Permissions::READ_WRITE;
        }
        aspace.loading = true;

        // Clean entries loaded before now would fault the loader's stores.
        tlb::invalidate_all(self.mmu());
        Ok(())
    }

    /// Put back the permissions saved by `as_prepare_load`
    pub fn as_complete_load(&self, aspace: &mut AddressSpace) -> VmResult<()> {
        if !aspace.loading {
            return Err(VmError::LoadNotPrepared);
        }

        let saved = core::mem::take(&mut aspace.saved_perms);
        for (segment, perms) in aspace.segments.iter_mut().zip(saved) {
            segment.perms = perms;
        }
        aspace.loading = false;

        // Entries loaded while everything was writable carry the dirty bit.
        tlb::invalidate_all(self.mmu());
        Ok(())
    }

    /// Switch the current processor to `aspace`
    ///
    /// Translations are not tagged, so the whole local TLB goes.
    pub fn as_activate(&self, aspace: Option<&AddressSpace>) {
        if aspace.is_some() {
            tlb::invalidate_all(self.mmu());
        }
    }

    /// Duplicate `src` for fork
    ///
    /// Every page with data gets its own frame in the copy. Pages of `src`
    /// that are swapped out are brought back in to be read and stay
    /// resident afterwards. Pages never touched stay zero-fill in both.
    /// On failure the partial copy is destroyed here.
    pub fn as_copy(&self, src: &AddressSpace) -> VmResult<AddressSpace> {
        let mut dst = self.as_create();
        if let Err(err) = self.copy_layout(src, &mut dst) {
            self.as_destroy(dst);
            return Err(err);
        }

        let pages: Vec<VirtAddr> = src.segments.iter().flat_map(Segment::pages).collect();
        for vpage in pages {
            if let Err(err) = self.copy_page(src.id, dst.id, vpage) {
                log::debug!("vm: copy of {:?} failed at {:#x}: {}", src.id, vpage, err);
                self.as_destroy(dst);
                return Err(err);
            }
        }

        self.stats.incr_copies();
        log::debug!("vm: copied {:?} to {:?}", src.id, dst.id);
        Ok(dst)
    }

    fn copy_layout(&self, src: &AddressSpace, dst: &mut AddressSpace) -> VmResult<()> {
        dst.segments
            .try_reserve(src.segments.len())
            .map_err(|_| VmError::OutOfMemory)?;
        dst.segments.extend_from_slice(&src.segments);
        dst.heap_start = src.heap_start;
        dst.heap_end = src.heap_end;

        let mut st = self.state.lock();
        let pages = st
            .page_tables
            .get(&src.id)
            .ok_or(VmError::NoAddressSpace)?
            .len();
        let mut table = PageTable::new();
        table.try_reserve(pages).map_err(|_| VmError::OutOfMemory)?;
        for segment in &src.segments {
            for vpage in segment.pages() {
                table.insert(vpage);
            }
        }
        st.page_tables.insert(dst.id, table);
        Ok(())
    }

    fn copy_page(&self, src: AsId, dst: AsId, vpage: VirtAddr) -> VmResult<()> {
        let mut st = self.state.lock();
        loop {
            let pte = st.pte(src, vpage).ok_or(VmError::BadAddress(vpage))?;
            if pte.busy {
                drop(st);
                core::hint::spin_loop();
                st = self.state.lock();
                continue;
            }
            if pte.is_zero_fill() {
                return Ok(());
            }
            break;
        }

        let (mut st, from) = self.resolve(st, src, vpage)?;
        st.coremap.set_pinned(from, true);

        match self.allocate_single(st, dst, vpage) {
            Ok((mut st, to)) => {
                self.ram.copy(from, to);
                st.coremap.set_pinned(from, false);
                Ok(())
            }
            Err(err) => {
                self.state.lock().coremap.set_pinned(from, false);
                Err(err)
            }
        }
    }

    /// Tear down `aspace`, returning its frames and swap slots
    ///
    /// Safe on a partially built address space. Waits for any of its pages
    /// still in transit to settle first.
    pub fn as_destroy(&self, aspace: AddressSpace) {
        let id = aspace.id;
        let mut st = self.state.lock();
        while st.page_tables.get(&id).is_some_and(PageTable::any_busy) {
            drop(st);
            core::hint::spin_loop();
            st = self.state.lock();
        }

        let frames = st.coremap.frames_owned_by(id);
        for &frame in &frames {
            self.release_locked(&mut st, frame);
        }
        let slots = st.swap_slots.purge(id);
        st.page_tables.remove(&id);

        log::debug!("vm: destroyed {:?} ({} frames, {} swap slots)", id, frames.len(), slots);
    }
}
