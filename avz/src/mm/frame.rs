//! Hypervisor frame allocator.
//!
//! The hypervisor slot is handed out page by page to structures the
//! hypervisor owns itself: the agency's stage-2 tables and the control pages
//! of the agency and idle domains. Frames are tracked by a bitmap, one bit
//! per frame, and allocated first-fit.

use abyss::{
    addressing::{Pa, PAGE_SHIFT},
    ram::PhysicalMemory,
};
use alloc::sync::Arc;
use bit_vec::BitVec;

pub struct FrameAllocator {
    mem: Arc<PhysicalMemory>,
    // true: unused, false: used
    bitmap: BitVec,
    start: Pa,
}

impl FrameAllocator {
    /// Manage `pages` frames from `start`.
    pub fn new(mem: Arc<PhysicalMemory>, start: Pa, pages: usize) -> Self {
        Self {
            mem,
            bitmap: BitVec::from_elem(pages, true),
            start,
        }
    }

    fn set_used(&mut self, index: usize) {
        debug_assert!(self.bitmap[index]);
        self.bitmap.set(index, false);
    }

    fn set_unused(&mut self, index: usize) {
        debug_assert!(!self.bitmap[index]);
        self.bitmap.set(index, true);
    }

    /// Allocate `cnt` zeroed frames whose first frame number is a multiple of
    /// `align` frames.
    pub fn alloc(&mut self, cnt: usize, align: usize) -> Option<Pa> {
        let mut search = 0;
        while search + cnt <= self.bitmap.len() {
            if align > 1 && (self.start.pfn() + search) % align != 0 {
                search += 1;
                continue;
            }
            match (search..search + cnt).find(|&i| !self.bitmap[i]) {
                // Restart after the frame in use.
                Some(used) => search = used + 1,
                None => {
                    for i in search..search + cnt {
                        self.set_used(i);
                    }
                    let pa = self.start + (search << PAGE_SHIFT);
                    self.mem.zero_pages(pa, cnt);
                    return Some(pa);
                }
            }
        }
        None
    }

    /// Allocate a zeroed frame.
    #[inline]
    pub fn alloc_page(&mut self) -> Option<Pa> {
        self.alloc(1, 0)
    }

    /// Release `cnt` frames from `pa`.
    pub fn dealloc(&mut self, pa: Pa, cnt: usize) {
        let ofs = (pa - self.start) >> PAGE_SHIFT;
        for i in ofs..ofs + cnt {
            self.set_unused(i);
        }
    }

    /// Number of free frames.
    pub fn free_pages(&self) -> usize {
        self.bitmap.iter().filter(|b| *b).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abyss::addressing::PAGE_SIZE;

    fn allocator(pages: usize) -> FrameAllocator {
        let start = Pa::new(0x8000_0000).unwrap();
        FrameAllocator::new(
            Arc::new(PhysicalMemory::new(start, pages * PAGE_SIZE)),
            start,
            pages,
        )
    }

    #[test]
    fn first_fit_reuses_holes() {
        let mut a = allocator(8);
        let p0 = a.alloc_page().unwrap();
        let p1 = a.alloc(2, 0).unwrap();
        let p2 = a.alloc_page().unwrap();
        assert_eq!(p1, p0 + PAGE_SIZE);
        assert_eq!(p2, p0 + 3 * PAGE_SIZE);
        a.dealloc(p1, 2);
        assert_eq!(a.alloc_page(), Some(p1));
        assert_eq!(a.alloc(2, 0), Some(p0 + 4 * PAGE_SIZE));
        assert_eq!(a.free_pages(), 3);
        assert_eq!(a.alloc(3, 0), None);
    }

    #[test]
    fn aligned_allocation() {
        let mut a = allocator(8);
        a.alloc_page().unwrap();
        let p = a.alloc(2, 4).unwrap();
        assert_eq!(p.pfn() % 4, 0);
    }

    #[test]
    fn frames_come_back_zeroed() {
        let mut a = allocator(2);
        let p = a.alloc_page().unwrap();
        a.mem.write_u64(p, 0xdead);
        a.dealloc(p, 1);
        let q = a.alloc_page().unwrap();
        assert_eq!(q, p);
        assert_eq!(a.mem.read_u64(q), 0);
    }
}
