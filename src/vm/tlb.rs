//! Translation Lookaside Buffer - Hardware Translation Cache Surface
//!
//! The VM core never touches TLB hardware directly. It drives an `Mmu`,
//! which stands for the TLB of the processor the caller runs on plus the
//! inter-processor shootdown channel and the interrupt priority level.
//!
//! ## Key Operations
//!
//! - `probe`/`read`/`write`: slot-addressed access to the local TLB
//! - `write_random`: insert anywhere, replacing an entry if the TLB is full
//! - `invalidate_all`: flush the local TLB (address space switch)
//! - `shootdown`: invalidate one mapping on every processor and wait for
//!   all of them to acknowledge
//!
//! TLB edits must happen at high interrupt priority so the processor is not
//! preempted halfway through a probe/write pair. `SplGuard` raises the
//! level for a scope and restores it on drop.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;

use crate::config::NUM_TLB;
use crate::types::{AsId, PhysAddr, VirtAddr};

// ============================================================================
// TLB Entry
// ============================================================================

/// One TLB entry (EntryHi/EntryLo pair)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    /// Virtual page number (page-aligned address)
    pub vpage: VirtAddr,
    /// Physical page (page-aligned address)
    pub paddr: PhysAddr,
    /// Entry may be used for translation
    pub valid: bool,
    /// Writes allowed (MIPS "dirty" bit)
    pub dirty: bool,
}

impl TlbEntry {
    /// Invalid entry, as written by `TLBHI_INVALID`/`TLBLO_INVALID`
    pub const INVALID: Self = Self {
        vpage: VirtAddr::new(0),
        paddr: PhysAddr::new(0),
        valid: false,
        dirty: false,
    };

    pub const fn new(vpage: VirtAddr, paddr: PhysAddr, dirty: bool) -> Self {
        Self {
            vpage,
            paddr,
            valid: true,
            dirty,
        }
    }
}

/// Request to drop one translation everywhere
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbShootdown {
    /// Address space whose mapping is going away
    pub owner: Option<AsId>,
    /// Page-aligned virtual address of the mapping
    pub vpage: VirtAddr,
}

/// Saved interrupt priority level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spl(pub u32);

impl Spl {
    pub const LOW: Self = Self(0);
    pub const HIGH: Self = Self(15);
}

// ============================================================================
// MMU Capability Surface
// ============================================================================

/// Translation cache of the current processor, plus cross-processor
/// invalidation and interrupt priority control
pub trait Mmu: Send + Sync {
    /// Number of TLB slots
    fn entries(&self) -> usize;

    /// Slot caching a translation for `vpage`, if any
    fn probe(&self, vpage: VirtAddr) -> Option<usize>;

    /// Read the entry at `slot`
    fn read(&self, slot: usize) -> TlbEntry;

    /// Overwrite the entry at `slot`
    fn write(&self, slot: usize, entry: TlbEntry);

    /// Insert into a hardware-chosen slot
    fn write_random(&self, entry: TlbEntry);

    /// Invalidate every local entry
    fn invalidate_all(&self);

    /// Invalidate `req` on all processors and wait for acknowledgment
    fn shootdown(&self, req: &TlbShootdown);

    /// Raise to the highest interrupt priority, returning the old level
    fn splhigh(&self) -> Spl;

    /// Restore a level returned by `splhigh`
    fn splx(&self, level: Spl);
}

/// Interrupts held off for the guard's lifetime
pub struct SplGuard<'a> {
    mmu: &'a dyn Mmu,
    saved: Spl,
}

impl<'a> SplGuard<'a> {
    pub fn raise(mmu: &'a dyn Mmu) -> Self {
        let saved = mmu.splhigh();
        Self { mmu, saved }
    }
}

impl Drop for SplGuard<'_> {
    fn drop(&mut self) {
        self.mmu.splx(self.saved);
    }
}

/// Invalidate the local entry for `vpage` if it is present and valid
pub fn invalidate_local(mmu: &dyn Mmu, vpage: VirtAddr) {
    let _spl = SplGuard::raise(mmu);
    if let Some(slot) = mmu.probe(vpage) {
        if mmu.read(slot).valid {
            mmu.write(slot, TlbEntry::INVALID);
        }
    }
}

/// Flush the whole local TLB
pub fn invalidate_all(mmu: &dyn Mmu) {
    let _spl = SplGuard::raise(mmu);
    mmu.invalidate_all();
}

// ============================================================================
// Software MMU
// ============================================================================

type TlbTable = heapless::Vec<TlbEntry, NUM_TLB>;

/// Software model of a multiprocessor's TLBs
///
/// Each processor owns a fixed table of `NUM_TLB` (or fewer) slots. The
/// "current" processor is selected with `set_current_cpu`; all local
/// operations act on it. Shootdowns are delivered synchronously to every
/// processor, which is exactly the ack-and-wait contract of an IPI.
pub struct SoftMmu {
    cpus: Vec<Mutex<TlbTable>>,
    size: usize,
    current: AtomicUsize,
    /// Round-robin cursor for `write_random` replacement
    next_victim: AtomicUsize,
    spl: AtomicU32,
    shootdowns: AtomicU64,
    flushes: AtomicU64,
}

impl SoftMmu {
    /// Create `ncpus` processors with a full-size TLB each
    pub fn new(ncpus: usize) -> Self {
        Self::with_entries(ncpus, NUM_TLB)
    }

    /// Create `ncpus` processors with `entries` TLB slots each (at most `NUM_TLB`)
    pub fn with_entries(ncpus: usize, entries: usize) -> Self {
        let size = entries.clamp(1, NUM_TLB);
        let mut cpus = Vec::with_capacity(ncpus.max(1));
        for _ in 0..ncpus.max(1) {
            let mut table = TlbTable::new();
            for _ in 0..size {
                // Capacity is NUM_TLB and size never exceeds it
                let _ = table.push(TlbEntry::INVALID);
            }
            cpus.push(Mutex::new(table));
        }

        Self {
            cpus,
            size,
            current: AtomicUsize::new(0),
            next_victim: AtomicUsize::new(0),
            spl: AtomicU32::new(Spl::LOW.0),
            shootdowns: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    /// Number of processors
    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    /// Make `cpu` the processor local operations act on
    pub fn set_current_cpu(&self, cpu: usize) {
        assert!(cpu < self.cpus.len(), "no such cpu {}", cpu);
        self.current.store(cpu, Ordering::SeqCst);
    }

    pub fn current_cpu(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// Valid entries cached on `cpu`
    pub fn valid_entries(&self, cpu: usize) -> Vec<TlbEntry> {
        self.cpus[cpu]
            .lock()
            .iter()
            .filter(|e| e.valid)
            .copied()
            .collect()
    }

    /// Valid translation for `vpage` on `cpu`, if cached
    pub fn lookup(&self, cpu: usize, vpage: VirtAddr) -> Option<TlbEntry> {
        self.cpus[cpu]
            .lock()
            .iter()
            .find(|e| e.valid && e.vpage == vpage)
            .copied()
    }

    /// Shootdowns delivered so far
    pub fn shootdown_count(&self) -> u64 {
        self.shootdowns.load(Ordering::Relaxed)
    }

    /// Full local flushes so far
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Current interrupt priority level
    pub fn spl(&self) -> Spl {
        Spl(self.spl.load(Ordering::SeqCst))
    }

    fn local(&self) -> &Mutex<TlbTable> {
        &self.cpus[self.current_cpu()]
    }
}

impl Mmu for SoftMmu {
    fn entries(&self) -> usize {
        self.size
    }

    fn probe(&self, vpage: VirtAddr) -> Option<usize> {
        self.local()
            .lock()
            .iter()
            .position(|e| e.valid && e.vpage == vpage)
    }

    fn read(&self, slot: usize) -> TlbEntry {
        self.local().lock()[slot]
    }

    fn write(&self, slot: usize, entry: TlbEntry) {
        self.local().lock()[slot] = entry;
    }

    fn write_random(&self, entry: TlbEntry) {
        let mut table = self.local().lock();
        let slot = match table.iter().position(|e| !e.valid) {
            Some(free) => free,
            None => self.next_victim.fetch_add(1, Ordering::Relaxed) % self.size,
        };
        table[slot] = entry;
    }

    fn invalidate_all(&self) {
        self.local().lock().fill(TlbEntry::INVALID);
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn shootdown(&self, req: &TlbShootdown) {
        for cpu in &self.cpus {
            for entry in cpu.lock().iter_mut() {
                if entry.valid && entry.vpage == req.vpage {
                    *entry = TlbEntry::INVALID;
                }
            }
        }
        self.shootdowns.fetch_add(1, Ordering::Relaxed);
    }

    fn splhigh(&self) -> Spl {
        Spl(self.spl.swap(Spl::HIGH.0, Ordering::SeqCst))
    }

    fn splx(&self, level: Spl) {
        self.spl.store(level.0, Ordering::SeqCst);
    }
}
