//! Coremap - Physical Frame Table
//!
//! One entry per physical frame, sized at boot from the RAM the loader
//! hands over. The coremap is the authority on who owns a frame and in what
//! state it is; victim selection for eviction lives here too.
//!
//! Every method assumes the caller holds the VM state lock. Nothing in this
//! module sleeps or does I/O.

use alloc::vec::Vec;
use core::mem::size_of;

use crate::types::{pages_for, AsId, FrameNumber, VirtAddr};

// ============================================================================
// Frame State
// ============================================================================

/// Lifecycle state of a physical frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameState {
    /// Never reclaimable (coremap itself, kernel allocations)
    Fixed = 0,
    /// Available for allocation
    Free = 1,
    /// Allocated to a user page
    Dirty = 2,
    /// Allocated, contents unchanged since they were filled
    ///
    /// Evictable like `Dirty`. User frames are claimed `Dirty` and an
    /// evicted frame goes straight from `Evicting` to `Free`, so this
    /// frame table never produces it.
    Clean = 3,
    /// Chosen as a victim; swap-out in progress
    Evicting = 4,
}

impl FrameState {
    /// May the eviction policy pick a frame in this state?
    pub const fn is_evictable(self) -> bool {
        matches!(self, FrameState::Dirty | FrameState::Clean)
    }
}

// ============================================================================
// Frame Entry
// ============================================================================

/// Coremap entry for one physical frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameEntry {
    /// Owning address space (none for free and kernel frames)
    pub owner: Option<AsId>,
    /// User page this frame backs, meaningful only with an owner
    pub vpage: VirtAddr,
    /// Current state
    pub state: FrameState,
    /// Allocation/access stamp; lower is older
    pub recency: u64,
    /// Length of the kernel run starting here (0 unless this frame heads a run)
    pub npages: usize,
    /// Temporarily held in memory, not evictable
    pub pinned: bool,
}

impl FrameEntry {
    const fn free() -> Self {
        Self {
            owner: None,
            vpage: VirtAddr::new(0),
            state: FrameState::Free,
            recency: 0,
            npages: 0,
            pinned: false,
        }
    }

    const fn reserved() -> Self {
        Self {
            state: FrameState::Fixed,
            ..Self::free()
        }
    }

    pub fn is_free(&self) -> bool {
        self.state == FrameState::Free
    }

    /// Does this frame back `vpage` of `owner`?
    pub fn backs(&self, owner: AsId, vpage: VirtAddr) -> bool {
        self.owner == Some(owner) && self.vpage == vpage
    }
}

// ============================================================================
// Coremap
// ============================================================================

/// Per-state frame counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreMapStats {
    pub total: usize,
    pub fixed: usize,
    pub free: usize,
    pub in_use: usize,
    pub evicting: usize,
}

/// The frame table
#[derive(Debug)]
pub struct CoreMap {
    entries: Vec<FrameEntry>,
    /// Frames holding the coremap itself; never released
    reserved: usize,
    /// Last recency stamp handed out
    counter: u64,
}

impl CoreMap {
    /// Build the coremap for `frames` frames. The leading frames that the
    /// table itself occupies are marked `Fixed`.
    pub fn bootstrap(frames: usize) -> Self {
        let table_bytes = (frames * size_of::<FrameEntry>()) as u64;
        let reserved = pages_for(table_bytes).min(frames);

        let mut entries = Vec::with_capacity(frames);
        for index in 0..frames {
            if index < reserved {
                entries.push(FrameEntry::reserved());
            } else {
                entries.push(FrameEntry::free());
            }
        }

        Self {
            entries,
            reserved,
            counter: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Frames reserved for the coremap at boot
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    pub fn entry(&self, frame: FrameNumber) -> &FrameEntry {
        &self.entries[frame.index()]
    }

    pub fn is_bootstrap_frame(&self, frame: FrameNumber) -> bool {
        frame.index() < self.reserved
    }

    fn next_stamp(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    /// Lowest-numbered free frame
    pub fn find_free(&self) -> Option<FrameNumber> {
        self.entries.iter().position(FrameEntry::is_free).map(FrameNumber)
    }

    /// First run of `count` consecutive free frames
    pub fn find_free_run(&self, count: usize) -> Option<FrameNumber> {
        if count == 0 {
            return None;
        }

        let mut start = 0;
        let mut len = 0;
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.is_free() {
                if len == 0 {
                    start = index;
                }
                len += 1;
                if len == count {
                    return Some(FrameNumber(start));
                }
            } else {
                len = 0;
            }
        }
        None
    }

    /// Eviction victim: the evictable, unpinned frame with the lowest
    /// recency stamp. Ties go to the lowest frame number.
    pub fn select_victim(&self) -> Option<FrameNumber> {
        let mut victim: Option<(usize, u64)> = None;
        for (index, entry) in self.entries.iter().enumerate() {
            if !entry.state.is_evictable() || entry.pinned {
                continue;
            }
            match victim {
                Some((_, oldest)) if entry.recency >= oldest => {}
                _ => victim = Some((index, entry.recency)),
            }
        }
        victim.map(|(index, _)| FrameNumber(index))
    }

    /// Hand a free frame to `owner` for `vpage`, stamping its recency
    pub fn claim_user(&mut self, frame: FrameNumber, owner: AsId, vpage: VirtAddr) {
        let stamp = self.next_stamp();
        let entry = &mut self.entries[frame.index()];
        debug_assert!(entry.is_free(), "claiming frame {:?} in state {:?}", frame, entry.state);
        entry.owner = Some(owner);
        entry.vpage = vpage;
        entry.state = FrameState::Dirty;
        entry.recency = stamp;
        entry.npages = 0;
        entry.pinned = false;
    }

    /// Hand `count` free frames starting at `first` to the kernel
    pub fn claim_kernel(&mut self, first: FrameNumber, count: usize) {
        for index in first.index()..first.index() + count {
            let stamp = self.next_stamp();
            let entry = &mut self.entries[index];
            debug_assert!(entry.is_free(), "claiming frame {} in state {:?}", index, entry.state);
            entry.owner = None;
            entry.state = FrameState::Fixed;
            entry.recency = stamp;
            entry.npages = 0;
        }
        self.entries[first.index()].npages = count;
    }

    /// Record an access to a frame
    pub fn touch(&mut self, frame: FrameNumber) {
        let stamp = self.next_stamp();
        self.entries[frame.index()].recency = stamp;
    }

    pub fn set_state(&mut self, frame: FrameNumber, state: FrameState) {
        self.entries[frame.index()].state = state;
    }

    pub fn set_pinned(&mut self, frame: FrameNumber, pinned: bool) {
        self.entries[frame.index()].pinned = pinned;
    }

    /// Return a frame to the free pool, clearing its owner
    pub fn mark_free(&mut self, frame: FrameNumber) {
        self.entries[frame.index()] = FrameEntry::free();
    }

    /// Frames currently owned by `owner`, in frame order
    pub fn frames_owned_by(&self, owner: AsId) -> Vec<FrameNumber> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.owner == Some(owner))
            .map(|(index, _)| FrameNumber(index))
            .collect()
    }

    /// The frame backing `vpage` of `owner`, if resident
    pub fn find_backing(&self, owner: AsId, vpage: VirtAddr) -> Option<FrameNumber> {
        self.entries
            .iter()
            .position(|e| e.backs(owner, vpage))
            .map(FrameNumber)
    }

    pub fn stats(&self) -> CoreMapStats {
        let mut stats = CoreMapStats {
            total: self.entries.len(),
            ..CoreMapStats::default()
        };
        for entry in &self.entries {
            match entry.state {
                FrameState::Fixed => stats.fixed += 1,
                FrameState::Free => stats.free += 1,
                FrameState::Dirty | FrameState::Clean => stats.in_use += 1,
                FrameState::Evicting => stats.evicting += 1,
            }
        }
        stats
    }
}
