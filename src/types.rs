//! Common types used across the VM core
//!
//! Address newtypes, frame numbers and address-space identities, plus the
//! page rounding helpers every other module leans on.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Page size (4KB, matching the MIPS TLB page size)
pub const PAGE_SIZE: usize = 4096;

/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

/// Mask selecting the page-frame part of an address
pub const PAGE_FRAME: u64 = !(PAGE_SIZE as u64 - 1);

/// Base of the direct-mapped kernel segment (kseg0)
pub const KSEG0: u64 = 0x8000_0000;

/// First address above user space
pub const USERSPACETOP: u64 = KSEG0;

/// One page worth of bytes
pub type Page = [u8; PAGE_SIZE];

// ============================================================================
// Addresses
// ============================================================================

/// Virtual address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VirtAddr(pub u64);

impl VirtAddr {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Round down to the containing page
    pub const fn trunc_page(self) -> Self {
        Self(trunc_page(self.0))
    }

    /// Round up to the next page boundary
    pub const fn round_page(self) -> Self {
        Self(round_page(self.0))
    }

    /// Offset within the containing page
    pub const fn page_offset(self) -> usize {
        (self.0 & !PAGE_FRAME) as usize
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 & !PAGE_FRAME == 0
    }

    pub const fn add(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }

    pub const fn is_user(self) -> bool {
        self.0 < USERSPACETOP
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Physical address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn add(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }

    /// Kernel virtual address of this physical address in kseg0
    pub const fn to_kvaddr(self) -> VirtAddr {
        VirtAddr(self.0 + KSEG0)
    }

    /// Physical address behind a kseg0 virtual address
    pub const fn from_kvaddr(kva: VirtAddr) -> Option<Self> {
        if kva.0 >= KSEG0 {
            Some(Self(kva.0 - KSEG0))
        } else {
            None
        }
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

// ============================================================================
// Identifiers
// ============================================================================

/// Index of a physical frame in the coremap
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameNumber(pub usize);

impl FrameNumber {
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Address space identifier
///
/// Frames and swap slots refer to their owner by this id, never by
/// reference, so they cannot keep an address space alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AsId(pub u64);

impl AsId {
    /// Create a new address space ID with a unique auto-incremented value
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        AsId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

// ============================================================================
// Page helpers
// ============================================================================

/// Round address down to page boundary
pub const fn trunc_page(addr: u64) -> u64 {
    addr & PAGE_FRAME
}

/// Round address up to page boundary
pub const fn round_page(addr: u64) -> u64 {
    (addr + PAGE_SIZE as u64 - 1) & PAGE_FRAME
}

/// Number of pages needed to hold `bytes`
pub const fn pages_for(bytes: u64) -> usize {
    (round_page(bytes) >> PAGE_SHIFT) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_utils() {
        assert_eq!(trunc_page(0x5678), 0x5000);
        assert_eq!(round_page(0x5001), 0x6000);
        assert_eq!(round_page(0x5000), 0x5000);
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(0x2000), 2);
    }

    #[test]
    fn test_kseg0_translation() {
        let pa = PhysAddr::new(0x3000);
        let kva = pa.to_kvaddr();
        assert_eq!(kva, VirtAddr::new(0x8000_3000));
        assert_eq!(PhysAddr::from_kvaddr(kva), Some(pa));
        assert_eq!(PhysAddr::from_kvaddr(VirtAddr::new(0x1000)), None);
    }

    #[test]
    fn test_as_ids_are_unique() {
        let a = AsId::new();
        let b = AsId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_virt_addr_helpers() {
        let va = VirtAddr::new(0x1234);
        assert_eq!(va.trunc_page(), VirtAddr::new(0x1000));
        assert_eq!(va.page_offset(), 0x234);
        assert!(!va.is_page_aligned());
        assert!(va.trunc_page().is_page_aligned());
        assert!(va.is_user());
        assert!(!VirtAddr::new(KSEG0).is_user());
    }
}
