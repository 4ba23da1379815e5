//! Segments - Declared Regions of an Address Space
//!
//! A segment records what the executable (or the stack setup) declared:
//! a page-aligned base, a length in pages, and permissions. Segments say
//! nothing about residency; that is the page table's business.

use crate::types::{VirtAddr, PAGE_SIZE};

// ============================================================================
// Permissions
// ============================================================================

/// Segment access permissions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions(u32);

impl Permissions {
    /// No access
    pub const NONE: Self = Self(0);
    /// Read access
    pub const READ: Self = Self(1);
    /// Write access
    pub const WRITE: Self = Self(2);
    /// Execute access
    pub const EXECUTE: Self = Self(4);
    /// Read/write, used for stacks and during loading
    pub const READ_WRITE: Self = Self(3);
    /// All permissions
    pub const ALL: Self = Self(7);

    pub const fn new(bits: u32) -> Self {
        Self(bits & 0x7)
    }

    /// Build from the loader's three flags
    pub const fn from_flags(readable: bool, writable: bool, executable: bool) -> Self {
        let mut bits = 0;
        if readable {
            bits |= Self::READ.0;
        }
        if writable {
            bits |= Self::WRITE.0;
        }
        if executable {
            bits |= Self::EXECUTE.0;
        }
        Self(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn can_read(&self) -> bool {
        self.contains(Self::READ)
    }

    pub const fn can_write(&self) -> bool {
        self.contains(Self::WRITE)
    }

    pub const fn can_execute(&self) -> bool {
        self.contains(Self::EXECUTE)
    }
}

impl core::ops::BitOr for Permissions {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Self::READ_WRITE
    }
}

// ============================================================================
// Segment
// ============================================================================

/// One declared region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Page-aligned start
    pub base: VirtAddr,
    /// Length in pages
    pub page_count: usize,
    /// Current permissions (forced read/write while loading)
    pub perms: Permissions,
    /// This is the user stack
    pub is_stack: bool,
}

impl Segment {
    pub const fn new(base: VirtAddr, page_count: usize, perms: Permissions, is_stack: bool) -> Self {
        Self {
            base,
            page_count,
            perms,
            is_stack,
        }
    }

    /// First address past the segment
    pub const fn end(&self) -> VirtAddr {
        VirtAddr::new(self.base.as_u64() + (self.page_count * PAGE_SIZE) as u64)
    }

    pub const fn contains(&self, addr: VirtAddr) -> bool {
        addr.as_u64() >= self.base.as_u64() && addr.as_u64() < self.end().as_u64()
    }

    /// Does `[base, base + pages)` intersect this segment?
    pub const fn overlaps(&self, base: VirtAddr, pages: usize) -> bool {
        let end = base.as_u64() + (pages * PAGE_SIZE) as u64;
        base.as_u64() < self.end().as_u64() && self.base.as_u64() < end
    }

    /// Page-aligned addresses covered by the segment
    pub fn pages(&self) -> impl Iterator<Item = VirtAddr> {
        let base = self.base;
        (0..self.page_count).map(move |i| base.add((i * PAGE_SIZE) as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn test_permissions() {
        let rx = Permissions::from_flags(true, false, true);
        assert!(rx.can_read());
        assert!(!rx.can_write());
        assert!(rx.can_execute());
        assert_eq!(rx | Permissions::WRITE, Permissions::ALL);
        assert_eq!(Permissions::new(0xff), Permissions::ALL);
    }

    #[test]
    fn test_segment_bounds() {
        let seg = Segment::new(VirtAddr::new(0x1000), 2, Permissions::READ, false);
        assert_eq!(seg.end(), VirtAddr::new(0x3000));
        assert!(seg.contains(VirtAddr::new(0x2fff)));
        assert!(!seg.contains(VirtAddr::new(0x3000)));
        assert!(!seg.contains(VirtAddr::new(0x0fff)));
    }

    #[test]
    fn test_overlap() {
        let seg = Segment::new(VirtAddr::new(0x4000), 2, Permissions::READ, false);
        assert!(seg.overlaps(VirtAddr::new(0x5000), 1));
        assert!(seg.overlaps(VirtAddr::new(0x3000), 2));
        assert!(!seg.overlaps(VirtAddr::new(0x6000), 4));
        assert!(!seg.overlaps(VirtAddr::new(0x2000), 2));
    }

    #[test]
    fn test_pages() {
        let seg = Segment::new(VirtAddr::new(0x10000), 3, Permissions::READ_WRITE, true);
        let pages: Vec<_> = seg.pages().collect();
        assert_eq!(
            pages,
            [VirtAddr::new(0x10000), VirtAddr::new(0x11000), VirtAddr::new(0x12000)]
        );
    }
}
