//! VM Statistics
//!
//! Lock-free counters bumped on the paging paths. Read them through
//! `snapshot()`; individual loads are relaxed, so a snapshot taken while
//! other processors are faulting is only approximately consistent.

use core::sync::atomic::{AtomicU64, Ordering};

/// Paging counters
#[derive(Debug)]
pub struct VmStats {
    /// Faults handled (successful or not)
    pub faults: AtomicU64,
    /// Faults rejected with an error
    pub fault_failures: AtomicU64,
    /// Pages handed out zero-filled
    pub zero_fills: AtomicU64,
    /// Pages read back from swap
    pub swap_ins: AtomicU64,
    /// Pages written to swap
    pub swap_outs: AtomicU64,
    /// Frames reclaimed by eviction
    pub evictions: AtomicU64,
    /// Cross-processor invalidations issued
    pub shootdowns: AtomicU64,
    /// Address spaces duplicated
    pub copies: AtomicU64,
}

/// Point-in-time copy of `VmStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmStatsSnapshot {
    pub faults: u64,
    pub fault_failures: u64,
    pub zero_fills: u64,
    pub swap_ins: u64,
    pub swap_outs: u64,
    pub evictions: u64,
    pub shootdowns: u64,
    pub copies: u64,
}

impl VmStats {
    pub const fn new() -> Self {
        Self {
            faults: AtomicU64::new(0),
            fault_failures: AtomicU64::new(0),
            zero_fills: AtomicU64::new(0),
            swap_ins: AtomicU64::new(0),
            swap_outs: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            shootdowns: AtomicU64::new(0),
            copies: AtomicU64::new(0),
        }
    }

    pub fn incr_faults(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_fault_failures(&self) {
        self.fault_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_zero_fills(&self) {
        self.zero_fills.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_swap_ins(&self) {
        self.swap_ins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_swap_outs(&self) {
        self.swap_outs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_evictions(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_shootdowns(&self) {
        self.shootdowns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_copies(&self) {
        self.copies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> VmStatsSnapshot {
        VmStatsSnapshot {
            faults: self.faults.load(Ordering::Relaxed),
            fault_failures: self.fault_failures.load(Ordering::Relaxed),
            zero_fills: self.zero_fills.load(Ordering::Relaxed),
            swap_ins: self.swap_ins.load(Ordering::Relaxed),
            swap_outs: self.swap_outs.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            shootdowns: self.shootdowns.load(Ordering::Relaxed),
            copies: self.copies.load(Ordering::Relaxed),
        }
    }
}

impl Default for VmStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let stats = VmStats::new();
        stats.incr_faults();
        stats.incr_faults();
        stats.incr_evictions();

        let snap = stats.snapshot();
        assert_eq!(snap.faults, 2);
        assert_eq!(snap.evictions, 1);
        assert_eq!(snap.swap_ins, 0);
    }
}
