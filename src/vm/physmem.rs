//! Physical Memory - Frame Contents
//!
//! The coremap says who owns a frame; this module holds what is in it.
//! Each frame sits behind its own spin lock so a frame's bytes can be
//! copied out for swap I/O without holding the coremap lock.
//!
//! Lock order: coremap lock, then frame locks. When two frames are held at
//! once the coremap lock is always held too, which serializes them.

use alloc::boxed::Box;
use alloc::vec::Vec;
use spin::Mutex;

use crate::types::{FrameNumber, Page, PhysAddr, PAGE_SIZE};

/// Contents of every managed frame, indexed by frame number
pub struct PhysicalMemory {
    base: PhysAddr,
    frames: Vec<Mutex<Box<Page>>>,
}

impl PhysicalMemory {
    /// Zero-filled memory for `count` frames starting at `base`
    pub fn new(base: PhysAddr, count: usize) -> Self {
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            frames.push(Mutex::new(Box::new([0u8; PAGE_SIZE])));
        }
        Self { base, frames }
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Physical address of a frame
    pub fn paddr(&self, frame: FrameNumber) -> PhysAddr {
        PhysAddr::new(self.base.as_u64() + (frame.index() * PAGE_SIZE) as u64)
    }

    /// Frame containing a physical address
    pub fn frame_of(&self, paddr: PhysAddr) -> Option<FrameNumber> {
        let offset = paddr.as_u64().checked_sub(self.base.as_u64())?;
        let index = (offset / PAGE_SIZE as u64) as usize;
        (index < self.frames.len()).then_some(FrameNumber(index))
    }

    pub fn zero(&self, frame: FrameNumber) {
        self.frames[frame.index()].lock().fill(0);
    }

    /// Copy of the frame's bytes
    pub fn snapshot(&self, frame: FrameNumber) -> Box<Page> {
        self.frames[frame.index()].lock().clone()
    }

    /// Overwrite the whole frame
    pub fn fill_from(&self, frame: FrameNumber, bytes: &Page) {
        self.frames[frame.index()].lock().copy_from_slice(bytes);
    }

    /// Copy `src` into `dst`
    pub fn copy(&self, src: FrameNumber, dst: FrameNumber) {
        if src == dst {
            return;
        }
        let bytes = self.snapshot(src);
        self.fill_from(dst, &bytes);
    }

    /// Read `buf.len()` bytes at `offset` within the frame
    pub fn read(&self, frame: FrameNumber, offset: usize, buf: &mut [u8]) {
        let page = self.frames[frame.index()].lock();
        buf.copy_from_slice(&page[offset..offset + buf.len()]);
    }

    /// Write `data` at `offset` within the frame
    pub fn write(&self, frame: FrameNumber, offset: usize, data: &[u8]) {
        let mut page = self.frames[frame.index()].lock();
        page[offset..offset + data.len()].copy_from_slice(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_addressing() {
        let mem = PhysicalMemory::new(PhysAddr::new(0x10_0000), 4);
        assert_eq!(mem.paddr(FrameNumber(2)), PhysAddr::new(0x10_2000));
        assert_eq!(mem.frame_of(PhysAddr::new(0x10_2abc)), Some(FrameNumber(2)));
        assert_eq!(mem.frame_of(PhysAddr::new(0x10_4000)), None);
        assert_eq!(mem.frame_of(PhysAddr::new(0x0f_f000)), None);
    }

    #[test]
    fn test_copy_and_zero() {
        let mem = PhysicalMemory::new(PhysAddr::new(0), 2);
        mem.write(FrameNumber(0), 100, &[1, 2, 3]);
        mem.copy(FrameNumber(0), FrameNumber(1));

        let mut buf = [0u8; 3];
        mem.read(FrameNumber(1), 100, &mut buf);
        assert_eq!(buf, [1, 2, 3]);

        mem.zero(FrameNumber(0));
        assert!(mem.snapshot(FrameNumber(0)).iter().all(|&b| b == 0));
    }
}
