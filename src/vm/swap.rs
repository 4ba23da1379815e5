//! Swap - Backing Store for Evicted Pages
//!
//! Slot `i` of the swap device occupies bytes `[i * PAGE_SIZE, (i + 1) * PAGE_SIZE)`.
//! There is no header and nothing is persisted: the in-memory slot table is
//! the only record of what lives where, so swap contents do not survive a
//! reboot.
//!
//! The split mirrors the locking:
//! - `SwapTable` is the slot-tag table. It lives inside the VM state lock,
//!   in the same lock domain as the coremap.
//! - `SwapStore` does device I/O and is only ever called with the VM state
//!   lock released. Slots are reserved (`Writing`) or claimed (`Reading`)
//!   before the lock is dropped so nobody else can touch them mid-transfer.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use super::Vm;
use crate::device::BlockDevice;
use crate::error::{SwapError, VmError, VmResult};
use crate::types::{AsId, Page, VirtAddr, PAGE_SIZE};

// ============================================================================
// Slot Table
// ============================================================================

/// Occupancy of one swap slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    /// Reserved for an eviction whose write has not finished
    Writing { owner: AsId, vpage: VirtAddr },
    /// Holds the page's data
    Occupied {
        owner: AsId,
        vpage: VirtAddr,
        offset: u64,
    },
    /// Being read back; freed once the read completes
    Reading {
        owner: AsId,
        vpage: VirtAddr,
        offset: u64,
    },
}

impl SlotState {
    /// Owner and page tagged on this slot, if any
    pub fn tag(&self) -> Option<(AsId, VirtAddr)> {
        match *self {
            SlotState::Free => None,
            SlotState::Writing { owner, vpage }
            | SlotState::Occupied { owner, vpage, .. }
            | SlotState::Reading { owner, vpage, .. } => Some((owner, vpage)),
        }
    }
}

/// Byte offset of a slot on the device
pub const fn slot_offset(slot: usize) -> u64 {
    (slot * PAGE_SIZE) as u64
}

/// Fixed-size slot-tag table
#[derive(Debug)]
pub struct SwapTable {
    slots: Vec<SlotState>,
}

impl SwapTable {
    pub fn new(count: usize) -> Self {
        Self {
            slots: alloc::vec![SlotState::Free; count],
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, slot: usize) -> SlotState {
        self.slots[slot]
    }

    pub fn free_count(&self) -> usize {
        self.slots.iter().filter(|s| **s == SlotState::Free).count()
    }

    /// Reserve the first free slot for `(owner, vpage)`
    ///
    /// A page holds at most one slot; a second reservation for the same
    /// tag is refused.
    pub fn reserve(&mut self, owner: AsId, vpage: VirtAddr) -> Result<usize, SwapError> {
        if let Some(slot) = self.find(owner, vpage) {
            return Err(SwapError::AlreadyTagged { vpage, slot });
        }
        let slot = self
            .slots
            .iter()
            .position(|s| *s == SlotState::Free)
            .ok_or(SwapError::NoFreeSlot)?;
        self.slots[slot] = SlotState::Writing { owner, vpage };
        Ok(slot)
    }

    /// Record a finished write
    pub fn commit(&mut self, slot: usize, offset: u64) {
        match self.slots[slot] {
            SlotState::Writing { owner, vpage } => {
                self.slots[slot] = SlotState::Occupied {
                    owner,
                    vpage,
                    offset,
                }
            }
            other => panic!("swap slot {} committed in state {:?}", slot, other),
        }
    }

    /// Slot tagged `(owner, vpage)`, whatever its transfer state
    pub fn find(&self, owner: AsId, vpage: VirtAddr) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.tag() == Some((owner, vpage)))
    }

    /// Claim the occupied slot for `(owner, vpage)` for reading
    pub fn begin_read(&mut self, owner: AsId, vpage: VirtAddr) -> Option<(usize, u64)> {
        let slot = self.find(owner, vpage)?;
        match self.slots[slot] {
            SlotState::Occupied { offset, .. } => {
                self.slots[slot] = SlotState::Reading {
                    owner,
                    vpage,
                    offset,
                };
                Some((slot, offset))
            }
            _ => None,
        }
    }

    /// Put a slot claimed by `begin_read` back, data intact
    pub fn abort_read(&mut self, slot: usize) {
        if let SlotState::Reading {
            owner,
            vpage,
            offset,
        } = self.slots[slot]
        {
            self.slots[slot] = SlotState::Occupied {
                owner,
                vpage,
                offset,
            };
        }
    }

    pub fn release(&mut self, slot: usize) {
        self.slots[slot] = SlotState::Free;
    }

    /// Free every settled slot tagged with `owner`, returning how many were
    /// freed
    ///
    /// Slots mid-transfer belong to the eviction or page-in that claimed
    /// them and are left for it to finish.
    pub fn purge(&mut self, owner: AsId) -> usize {
        let mut freed = 0;
        for slot in self.slots.iter_mut() {
            if matches!(*slot, SlotState::Occupied { owner: o, .. } if o == owner) {
                *slot = SlotState::Free;
                freed += 1;
            }
        }
        freed
    }

    /// Slots tagged with `owner`
    pub fn owned_by(&self, owner: AsId) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s.tag(), Some((o, _)) if o == owner))
            .map(|(i, _)| i)
            .collect()
    }
}

// ============================================================================
// Swap Store
// ============================================================================

/// Device I/O half of swap
pub struct SwapStore {
    device: Arc<dyn BlockDevice>,
    /// Slots written at least once since boot
    written: Vec<AtomicBool>,
}

impl SwapStore {
    /// Attach to `device`, which must hold at least `slots` pages
    pub fn initialize(device: Arc<dyn BlockDevice>, slots: usize) -> Result<Self, SwapError> {
        let available = (device.size() / PAGE_SIZE as u64) as usize;
        if available < slots {
            return Err(SwapError::DeviceTooSmall {
                available,
                required: slots,
            });
        }

        let mut written = Vec::with_capacity(slots);
        written.resize_with(slots, || AtomicBool::new(false));
        log::debug!("swap: {} slots on a {} byte device", slots, device.size());
        Ok(Self { device, written })
    }

    pub fn slot_count(&self) -> usize {
        self.written.len()
    }

    /// Write one page into `slot`, returning its byte offset
    pub fn write_page(&self, bytes: &Page, slot: usize) -> Result<u64, SwapError> {
        let offset = slot_offset(slot);
        self.device.write_at(offset, bytes)?;
        self.written[slot].store(true, Ordering::Release);
        Ok(offset)
    }

    /// Read the page at `offset` into `buf`
    ///
    /// Reading a slot that was never written means the slot table lost
    /// track of a page, which is fatal.
    pub fn read_page(&self, buf: &mut Page, offset: u64) -> Result<(), SwapError> {
        let slot = (offset / PAGE_SIZE as u64) as usize;
        let written = offset % PAGE_SIZE as u64 == 0
            && self
                .written
                .get(slot)
                .is_some_and(|w| w.load(Ordering::Acquire));
        if !written {
            log::error!("swap: read at offset {:#x} which was never written", offset);
            panic!("swap read at offset {:#x} which was never written", offset);
        }
        self.device.read_at(offset, buf)?;
        Ok(())
    }
}

// ============================================================================
// Page-level swap operations
// ============================================================================

impl Vm {
    /// Attach the swap device. Must succeed before anything can be evicted.
    pub fn swap_bootstrap(&self, device: Arc<dyn BlockDevice>) -> Result<(), SwapError> {
        let store = SwapStore::initialize(device, self.config.swap_slots)?;
        if self.swap.is_completed() {
            log::warn!("swap: already initialized, ignoring new device");
            return Ok(());
        }
        self.swap.call_once(|| store);
        Ok(())
    }

    pub(crate) fn swap_store(&self) -> VmResult<&SwapStore> {
        self.swap.get().ok_or(VmError::SwapNotInitialized)
    }

    /// Write `bytes` to swap, tagged `(owner, vpage)`
    pub fn swap_out(&self, owner: AsId, vpage: VirtAddr, bytes: &Page) -> VmResult<()> {
        let store = self.swap_store()?;
        let slot = self
            .state
            .lock()
            .swap_slots
            .reserve(owner, vpage)
            .map_err(reserve_error)?;

        match store.write_page(bytes, slot) {
            Ok(offset) => {
                self.state.lock().swap_slots.commit(slot, offset);
                self.stats.incr_swap_outs();
                log::debug!("swap: {:?} {:#x} out to slot {}", owner, vpage, slot);
                Ok(())
            }
            Err(err) => {
                self.state.lock().swap_slots.release(slot);
                Err(err.into())
            }
        }
    }

    /// Read the page tagged `(owner, vpage)` into `buf` and free its slot
    ///
    /// The page must be in swap; a missing slot is fatal.
    pub fn swap_in(&self, owner: AsId, vpage: VirtAddr, buf: &mut Page) -> VmResult<()> {
        let store = self.swap_store()?;
        let claimed = self.state.lock().swap_slots.begin_read(owner, vpage);
        let Some((slot, offset)) = claimed else {
            log::error!("swap: no slot holds {:?} {:#x}", owner, vpage);
            panic!("page {:#x} of {:?} is swapped out but has no swap slot", vpage, owner);
        };

        match store.read_page(buf, offset) {
            Ok(()) => {
                self.state.lock().swap_slots.release(slot);
                self.stats.incr_swap_ins();
                log::debug!("swap: {:?} {:#x} in from slot {}", owner, vpage, slot);
                Ok(())
            }
            Err(err) => {
                self.state.lock().swap_slots.abort_read(slot);
                Err(err.into())
            }
        }
    }

    /// Free every swap slot tagged with `owner`
    pub fn swap_purge(&self, owner: AsId) -> usize {
        self.state.lock().swap_slots.purge(owner)
    }
}

/// Running out of slots is `OutOfSwapSpace`; anything else is passed on
pub(crate) fn reserve_error(err: SwapError) -> VmError {
    match err {
        SwapError::NoFreeSlot => VmError::OutOfSwapSpace,
        other => VmError::Swap(other),
    }
}

/// Fresh zeroed page buffer for transfers outside the frame locks
pub(crate) fn bounce_buffer() -> Box<Page> {
    Box::new([0u8; PAGE_SIZE])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDisk;
    use proptest::prelude::*;

    fn vp(addr: u64) -> VirtAddr {
        VirtAddr::new(addr)
    }

    #[test]
    fn test_reserve_first_free() {
        let mut table = SwapTable::new(3);
        let a = AsId::new();
        assert_eq!(table.reserve(a, vp(0x1000)), Ok(0));
        assert_eq!(table.reserve(a, vp(0x2000)), Ok(1));
        table.release(0);
        assert_eq!(table.reserve(a, vp(0x3000)), Ok(0));
        assert_eq!(table.reserve(a, vp(0x4000)), Ok(2));
        assert_eq!(table.reserve(a, vp(0x5000)), Err(SwapError::NoFreeSlot));
    }

    #[test]
    fn test_slot_lifecycle() {
        let mut table = SwapTable::new(2);
        let a = AsId::new();
        let slot = table.reserve(a, vp(0x1000)).unwrap();
        assert_eq!(table.begin_read(a, vp(0x1000)), None);

        table.commit(slot, slot_offset(slot));
        assert_eq!(table.find(a, vp(0x1000)), Some(slot));
        assert_eq!(table.begin_read(a, vp(0x1000)), Some((slot, 0)));

        table.abort_read(slot);
        assert!(matches!(table.slot(slot), SlotState::Occupied { .. }));
        table.release(slot);
        assert_eq!(table.free_count(), 2);
    }

    #[test]
    fn test_purge_only_touches_owner() {
        let mut table = SwapTable::new(4);
        let a = AsId::new();
        let b = AsId::new();
        table.reserve(a, vp(0x1000)).unwrap();
        table.reserve(b, vp(0x1000)).unwrap();
        table.reserve(a, vp(0x2000)).unwrap();

        table.commit(0, slot_offset(0));
        table.commit(1, slot_offset(1));
        table.commit(2, slot_offset(2));

        assert_eq!(table.purge(a), 2);
        assert!(table.owned_by(a).is_empty());
        assert_eq!(table.owned_by(b), [1]);
    }

    #[test]
    fn test_reserve_refuses_second_slot_for_page() {
        let mut table = SwapTable::new(4);
        let a = AsId::new();
        let slot = table.reserve(a, vp(0x1000)).unwrap();
        assert_eq!(
            table.reserve(a, vp(0x1000)),
            Err(SwapError::AlreadyTagged { vpage: vp(0x1000), slot })
        );
        table.commit(slot, slot_offset(slot));
        assert_eq!(
            table.reserve(a, vp(0x1000)),
            Err(SwapError::AlreadyTagged { vpage: vp(0x1000), slot })
        );
        assert_eq!(table.owned_by(a), [slot]);
    }

    #[test]
    fn test_purge_leaves_slots_in_transfer() {
        let mut table = SwapTable::new(3);
        let a = AsId::new();
        let writing = table.reserve(a, vp(0x1000)).unwrap();
        let reading = table.reserve(a, vp(0x2000)).unwrap();
        table.commit(reading, slot_offset(reading));
        table.begin_read(a, vp(0x2000)).unwrap();
        let settled = table.reserve(a, vp(0x3000)).unwrap();
        table.commit(settled, slot_offset(settled));

        assert_eq!(table.purge(a), 1);
        assert_eq!(table.slot(settled), SlotState::Free);

        // The in-flight eviction can still publish its slot.
        table.commit(writing, slot_offset(writing));
        assert!(matches!(table.slot(writing), SlotState::Occupied { .. }));
        assert!(matches!(table.slot(reading), SlotState::Reading { .. }));
    }

    #[test]
    fn test_store_rejects_small_device() {
        let disk = Arc::new(MemDisk::new(2 * PAGE_SIZE));
        let err = SwapStore::initialize(disk, 3).err();
        assert_eq!(
            err,
            Some(SwapError::DeviceTooSmall {
                available: 2,
                required: 3
            })
        );
    }

    #[test]
    fn test_store_slot_layout() {
        let disk = Arc::new(MemDisk::new(4 * PAGE_SIZE));
        let store = SwapStore::initialize(disk.clone(), 4).unwrap();
        let page = [0x3Cu8; PAGE_SIZE];
        assert_eq!(store.write_page(&page, 2), Ok(2 * PAGE_SIZE as u64));

        let mut raw = [0u8; 1];
        disk.read_at(2 * PAGE_SIZE as u64 + 17, &mut raw).unwrap();
        assert_eq!(raw[0], 0x3C);
    }

    #[test]
    #[should_panic(expected = "never written")]
    fn test_store_read_unwritten_is_fatal() {
        let disk = Arc::new(MemDisk::new(4 * PAGE_SIZE));
        let store = SwapStore::initialize(disk, 4).unwrap();
        let mut buf = [0u8; PAGE_SIZE];
        let _ = store.read_page(&mut buf, slot_offset(1));
    }

    #[test]
    fn test_store_write_failure_propagates() {
        let disk = Arc::new(MemDisk::new(PAGE_SIZE));
        let store = SwapStore::initialize(disk.clone(), 1).unwrap();
        disk.set_fail_writes(true);
        let page = [0u8; PAGE_SIZE];
        assert!(matches!(store.write_page(&page, 0), Err(SwapError::Device(_))));
    }

    #[test]
    fn test_repeated_swap_out_keeps_one_slot() {
        let (vm, _, disk) = super::super::test_support::vm_with(4, 4);
        let a = AsId::new();
        vm.swap_out(a, vp(0x1000), &[0x11; PAGE_SIZE]).unwrap();
        let writes = disk.write_count();

        assert_eq!(
            vm.swap_out(a, vp(0x1000), &[0x22; PAGE_SIZE]),
            Err(VmError::Swap(SwapError::AlreadyTagged { vpage: vp(0x1000), slot: 0 }))
        );
        assert_eq!(disk.write_count(), writes);
        assert_eq!(vm.swap_slots_owned_by(a), [0]);

        let mut back = [0u8; PAGE_SIZE];
        vm.swap_in(a, vp(0x1000), &mut back).unwrap();
        assert!(back.iter().all(|&b| b == 0x11));
        assert!(vm.swap_slots_owned_by(a).is_empty());
    }

    proptest! {
        #[test]
        fn prop_swap_round_trip(fill in any::<u8>(), stride in 1usize..64, slot in 0usize..8) {
            let disk = Arc::new(MemDisk::new(8 * PAGE_SIZE));
            let store = SwapStore::initialize(disk, 8).unwrap();

            let mut page = [fill; PAGE_SIZE];
            for i in (0..PAGE_SIZE).step_by(stride) {
                page[i] = (i % 251) as u8;
            }
            let offset = store.write_page(&page, slot).unwrap();

            let mut back = [0u8; PAGE_SIZE];
            store.read_page(&mut back, offset).unwrap();
            prop_assert_eq!(&back[..], &page[..]);
        }
    }
}
