//! Boot-time configuration for the VM core

use crate::types::{PhysAddr, VirtAddr, PAGE_SIZE, USERSPACETOP};

/// Number of entries in the MIPS R3000 TLB
pub const NUM_TLB: usize = 64;

/// Default number of swap slots
pub const DEFAULT_SWAP_SLOTS: usize = 1000;

/// Default user stack size in pages (48KB)
pub const DEFAULT_STACK_PAGES: usize = 12;

/// Tunables fixed at bootstrap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Entries per processor TLB
    pub tlb_entries: usize,
    /// Page-sized slots on the swap device
    pub swap_slots: usize,
    /// Pages in the user stack segment
    pub stack_pages: usize,
    /// Initial user stack pointer; the stack grows down from here
    pub user_stack_top: VirtAddr,
}

impl VmConfig {
    pub const fn new() -> Self {
        Self {
            tlb_entries: NUM_TLB,
            swap_slots: DEFAULT_SWAP_SLOTS,
            stack_pages: DEFAULT_STACK_PAGES,
            user_stack_top: VirtAddr::new(USERSPACETOP),
        }
    }

    pub const fn with_swap_slots(mut self, slots: usize) -> Self {
        self.swap_slots = slots;
        self
    }

    pub const fn with_stack_pages(mut self, pages: usize) -> Self {
        self.stack_pages = pages;
        self
    }

    pub const fn with_tlb_entries(mut self, entries: usize) -> Self {
        self.tlb_entries = entries;
        self
    }

    pub const fn with_user_stack_top(mut self, top: VirtAddr) -> Self {
        self.user_stack_top = top;
        self
    }

    /// Bytes of backing store the swap device must provide
    pub const fn swap_bytes(&self) -> u64 {
        (self.swap_slots * PAGE_SIZE) as u64
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Physical memory left to the VM after the kernel image, as reported by
/// the boot loader. `first` is inclusive, `last` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RamRange {
    pub first: PhysAddr,
    pub last: PhysAddr,
}

impl RamRange {
    pub const fn new(first: PhysAddr, last: PhysAddr) -> Self {
        Self { first, last }
    }

    /// Range holding `frames` whole pages starting at `first`
    pub const fn with_frames(first: PhysAddr, frames: usize) -> Self {
        Self {
            first,
            last: PhysAddr::new(first.as_u64() + (frames * PAGE_SIZE) as u64),
        }
    }

    pub const fn frame_count(&self) -> usize {
        ((self.last.as_u64() - self.first.as_u64()) / PAGE_SIZE as u64) as usize
    }
}
