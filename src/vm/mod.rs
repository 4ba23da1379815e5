//! Virtual Memory Core
//!
//! Demand paging over a fixed pool of physical frames, with a swap device
//! behind it. A single `Vm` is created at boot and passed by reference to
//! every operation; there is no global state.
//!
//! ## Locking
//!
//! One spin lock (`Vm::state`) guards the coremap, the swap slot table and
//! the residency bits of every page table. It is never held across swap
//! I/O. Pages in transit are marked `busy` in their page table entry and
//! their frame is `Evicting` (or pinned) so nobody else touches them while
//! the lock is down.
//!
//! Lock order: state lock, then a frame's content lock. Interrupt priority
//! is only raised around TLB edits, never across I/O.
//!
//! ## Modules
//!
//! - `coremap`: frame table and victim selection
//! - `physmem`: frame contents
//! - `page_table` / `segment`: per-address-space layout
//! - `addrspace`: create, copy, destroy, region definition, loading
//! - `allocator`: frame allocation, eviction, kernel pages
//! - `fault`: TLB miss handling
//! - `swap`: slot table and swap device I/O
//! - `tlb`: MMU capability surface and the software TLB model
//! - `copyio`: kernel/user byte transfer
//! - `stats`: counters

pub mod addrspace;
pub mod allocator;
pub mod copyio;
pub mod coremap;
pub mod fault;
pub mod page_table;
pub mod physmem;
pub mod segment;
pub mod stats;
pub mod swap;
pub mod tlb;

pub use addrspace::AddressSpace;
pub use coremap::{CoreMapStats, FrameEntry, FrameState};
pub use fault::FaultType;
pub use page_table::PageTableEntry;
pub use segment::{Permissions, Segment};
pub use stats::{VmStats, VmStatsSnapshot};
pub use swap::SlotState;
pub use tlb::{Mmu, SoftMmu, Spl, SplGuard, TlbEntry, TlbShootdown};

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::{Mutex, MutexGuard, Once};

use crate::config::{RamRange, VmConfig};
use crate::types::{AsId, FrameNumber, Page, VirtAddr};
use coremap::CoreMap;
use page_table::PageTable;
use physmem::PhysicalMemory;
use swap::{SwapStore, SwapTable};

/// Everything the state lock protects
pub(crate) struct VmState {
    pub(crate) coremap: CoreMap,
    pub(crate) swap_slots: SwapTable,
    pub(crate) page_tables: BTreeMap<AsId, PageTable>,
}

impl VmState {
    pub(crate) fn pte(&self, owner: AsId, vpage: VirtAddr) -> Option<PageTableEntry> {
        self.page_tables.get(&owner)?.get(vpage).copied()
    }

    pub(crate) fn pte_mut(&mut self, owner: AsId, vpage: VirtAddr) -> Option<&mut PageTableEntry> {
        self.page_tables.get_mut(&owner)?.get_mut(vpage)
    }
}

pub(crate) type VmGuard<'a> = MutexGuard<'a, VmState>;

/// The virtual memory system
pub struct Vm {
    config: VmConfig,
    state: Mutex<VmState>,
    ram: PhysicalMemory,
    swap: Once<SwapStore>,
    mmu: Arc<dyn Mmu>,
    stats: VmStats,
}

impl Vm {
    /// Take over the RAM left by the boot loader
    ///
    /// The coremap is carved from the start of `ram`. Swap is attached
    /// separately with `swap_bootstrap` once the device is reachable; until
    /// then nothing can be evicted.
    pub fn bootstrap(config: VmConfig, ram: RamRange, mmu: Arc<dyn Mmu>) -> Self {
        let frames = ram.frame_count();
        let coremap = CoreMap::bootstrap(frames);
        log::info!(
            "vm: {} frames at {:#x}, {} reserved for the coremap",
            frames,
            ram.first,
            coremap.reserved()
        );

        Self {
            config,
            state: Mutex::new(VmState {
                coremap,
                swap_slots: SwapTable::new(config.swap_slots),
                page_tables: BTreeMap::new(),
            }),
            ram: PhysicalMemory::new(ram.first, frames),
            swap: Once::new(),
            mmu,
            stats: VmStats::new(),
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn mmu(&self) -> &dyn Mmu {
        &*self.mmu
    }

    pub fn stats(&self) -> VmStatsSnapshot {
        self.stats.snapshot()
    }

    /// Frame counts by state
    pub fn frame_stats(&self) -> CoreMapStats {
        self.state.lock().coremap.stats()
    }

    pub fn frame_count(&self) -> usize {
        self.ram.frame_count()
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn frame_entry(&self, frame: FrameNumber) -> Option<FrameEntry> {
        let st = self.state.lock();
        (frame.index() < st.coremap.len()).then(|| *st.coremap.entry(frame))
    }

    /// Page table entry for the page containing `addr`
    pub fn page_entry(&self, aspace: &AddressSpace, addr: VirtAddr) -> Option<PageTableEntry> {
        self.state.lock().pte(aspace.id(), addr.trunc_page())
    }

    /// Swap slot holding the page containing `addr`, if it is swapped out
    pub fn swap_slot_of(&self, owner: AsId, addr: VirtAddr) -> Option<usize> {
        self.state.lock().swap_slots.find(owner, addr.trunc_page())
    }

    pub fn frames_owned_by(&self, owner: AsId) -> Vec<FrameNumber> {
        self.state.lock().coremap.frames_owned_by(owner)
    }

    pub fn swap_slots_owned_by(&self, owner: AsId) -> Vec<usize> {
        self.state.lock().swap_slots.owned_by(owner)
    }

    pub fn swap_slot_state(&self, slot: usize) -> Option<SlotState> {
        let st = self.state.lock();
        (slot < st.swap_slots.len()).then(|| st.swap_slots.slot(slot))
    }

    /// Copy of a frame's contents
    pub fn read_frame(&self, frame: FrameNumber) -> Option<Box<Page>> {
        (frame.index() < self.ram.frame_count()).then(|| self.ram.snapshot(frame))
    }

    fn shootdown(&self, owner: Option<AsId>, vpage: VirtAddr) {
        self.mmu.shootdown(&TlbShootdown { owner, vpage });
        self.stats.incr_shootdowns();
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::vm_with;
    use super::*;

    #[test]
    fn test_bootstrap_layout() {
        let (vm, _, _) = vm_with(16, 4);
        let stats = vm.frame_stats();
        assert_eq!(stats.total, 16);
        assert_eq!(stats.fixed, 1);
        assert_eq!(stats.free, 15);
        assert_eq!(vm.frame_entry(FrameNumber(0)).unwrap().state, FrameState::Fixed);
        assert!(vm.frame_entry(FrameNumber(16)).is_none());
    }

    #[test]
    fn test_swap_bootstrap_checks_device() {
        let mmu = Arc::new(SoftMmu::new(1));
        let ram = RamRange::with_frames(crate::types::PhysAddr::new(0), 8);
        let vm = Vm::bootstrap(VmConfig::new().with_swap_slots(4), ram, mmu);
        let small = Arc::new(crate::device::MemDisk::new(4096));
        assert!(vm.swap_bootstrap(small).is_err());
        assert_eq!(
            vm.swap_out(AsId::new(), VirtAddr::new(0x1000), &[0u8; 4096]),
            Err(crate::error::VmError::SwapNotInitialized)
        );
    }
}
