//! Page Table - Per-Address-Space Page Mappings
//!
//! One entry per declared virtual page, kept sorted by page address so
//! lookups are a binary search. An entry maps its page to a frame, or to
//! nothing; `resident` says where the data is when there is no frame.
//!
//! | frame  | resident | meaning                                 |
//! |--------|----------|-----------------------------------------|
//! | Some   | true     | in memory                               |
//! | None   | true     | never touched; zero-fill on first fault |
//! | None   | false    | swapped out                             |
//!
//! `busy` marks a page in transit between memory and swap. Nobody but the
//! thread that set it may change the entry until it is cleared.

use alloc::collections::TryReserveError;
use alloc::vec::Vec;

use crate::types::{FrameNumber, VirtAddr};

/// Mapping for one virtual page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry {
    /// Page-aligned virtual address
    pub vpage: VirtAddr,
    /// Backing frame, if resident
    pub frame: Option<FrameNumber>,
    /// Data is in memory (or has never existed)
    pub resident: bool,
    /// Page is being evicted or brought in
    pub busy: bool,
}

impl PageTableEntry {
    /// Fresh entry for a page nobody has touched yet
    pub const fn zero_fill(vpage: VirtAddr) -> Self {
        Self {
            vpage,
            frame: None,
            resident: true,
            busy: false,
        }
    }

    pub const fn is_swapped(&self) -> bool {
        self.frame.is_none() && !self.resident
    }

    pub const fn is_zero_fill(&self) -> bool {
        self.frame.is_none() && self.resident
    }
}

/// Sorted page table
#[derive(Debug, Default, Clone)]
pub struct PageTable {
    entries: Vec<PageTableEntry>,
}

impl PageTable {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Make room for `additional` more entries without aborting on failure
    pub fn try_reserve(&mut self, additional: usize) -> Result<(), TryReserveError> {
        self.entries.try_reserve(additional)
    }

    /// Add a zero-fill entry for `vpage`. Existing entries are left alone.
    pub fn insert(&mut self, vpage: VirtAddr) {
        if let Err(pos) = self.search(vpage) {
            self.entries.insert(pos, PageTableEntry::zero_fill(vpage));
        }
    }

    fn search(&self, vpage: VirtAddr) -> Result<usize, usize> {
        self.entries.binary_search_by_key(&vpage, |e| e.vpage)
    }

    pub fn get(&self, vpage: VirtAddr) -> Option<&PageTableEntry> {
        self.search(vpage).ok().map(|i| &self.entries[i])
    }

    pub fn get_mut(&mut self, vpage: VirtAddr) -> Option<&mut PageTableEntry> {
        match self.search(vpage) {
            Ok(i) => Some(&mut self.entries[i]),
            Err(_) => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }

    /// Any page of this table currently in transit?
    pub fn any_busy(&self) -> bool {
        self.entries.iter().any(|e| e.busy)
    }
}
