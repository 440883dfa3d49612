//! Physical RAM.
//!
//! RAM is a window of physical addresses backed by 4 KiB [`Frame`]s. A frame
//! is materialized on its first write; reading a frame that was never
//! written yields zeros. Every word of a frame is an [`AtomicU64`] so that
//! fields shared between CPUs (for example the control page) can be updated
//! with atomic read-modify-write operations directly in RAM.
//!
//! Accesses outside of the window are machine faults and panic.

use crate::addressing::{Pa, PAGE_SHIFT, PAGE_SIZE};
use alloc::{collections::BTreeMap, sync::Arc};
use core::sync::atomic::{AtomicU64, Ordering};
use spin_lock::SpinLock;

/// Number of 64-bit words in a frame.
pub const WORDS_PER_FRAME: usize = PAGE_SIZE / 8;

/// A 4 KiB physical frame.
#[repr(align(4096))]
pub struct Frame {
    words: [AtomicU64; WORDS_PER_FRAME],
}

impl Frame {
    fn zeroed() -> Self {
        Self {
            words: core::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Get a word of this frame.
    #[inline]
    pub fn word(&self, index: usize) -> &AtomicU64 {
        &self.words[index]
    }
}

/// Physical memory of the machine.
pub struct PhysicalMemory {
    base: Pa,
    size: usize,
    frames: SpinLock<BTreeMap<usize, Arc<Frame>>>,
}

impl PhysicalMemory {
    /// Create the RAM window `base..base + size`.
    pub fn new(base: Pa, size: usize) -> Self {
        assert!(base.is_page_aligned() && size % PAGE_SIZE == 0);
        Self {
            base,
            size,
            frames: SpinLock::new(BTreeMap::new()),
        }
    }

    /// First byte of RAM.
    #[inline]
    pub fn base(&self) -> Pa {
        self.base
    }

    /// Size of RAM in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns true if `pa..pa + len` lies inside RAM.
    #[inline]
    pub fn contains(&self, pa: Pa, len: usize) -> bool {
        pa >= self.base && (pa - self.base) + len <= self.size
    }

    fn check(&self, pa: Pa, len: usize) {
        if !self.contains(pa, len) {
            panic!("bus error: {:?}+0x{:x} is outside of RAM", pa, len);
        }
    }

    /// Get the frame of `pa` if it was ever written.
    fn frame(&self, pa: Pa) -> Option<Arc<Frame>> {
        self.check(pa, 1);
        self.frames.lock().get(&pa.pfn()).cloned()
    }

    /// Get the frame of `pa`, materializing it on demand.
    fn frame_or_insert(&self, pa: Pa) -> Arc<Frame> {
        self.check(pa, 1);
        self.frames
            .lock()
            .entry(pa.pfn())
            .or_insert_with(|| Arc::new(Frame::zeroed()))
            .clone()
    }

    /// Run `f` with the 64-bit word at `pa`.
    ///
    /// `pa` must be 8-byte aligned.
    pub fn with_word<R>(&self, pa: Pa, f: impl FnOnce(&AtomicU64) -> R) -> R {
        debug_assert_eq!(pa.into_usize() % 8, 0);
        let frame = self.frame_or_insert(pa);
        f(frame.word(pa.page_offset() / 8))
    }

    /// Read the 64-bit word at `pa`.
    pub fn read_u64(&self, pa: Pa) -> u64 {
        debug_assert_eq!(pa.into_usize() % 8, 0);
        self.frame(pa)
            .map(|frame| frame.word(pa.page_offset() / 8).load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Write the 64-bit word at `pa`.
    pub fn write_u64(&self, pa: Pa, value: u64) {
        self.with_word(pa, |w| w.store(value, Ordering::Release))
    }

    /// Copy `buf.len()` bytes starting from `pa` into `buf`.
    pub fn read_bytes(&self, pa: Pa, buf: &mut [u8]) {
        self.check(pa, buf.len());
        let mut done = 0;
        while done < buf.len() {
            let at = pa + done;
            let in_page = (PAGE_SIZE - at.page_offset()).min(buf.len() - done);
            match self.frame(at) {
                Some(frame) => {
                    for i in 0..in_page {
                        let off = at.page_offset() + i;
                        let word = frame.word(off / 8).load(Ordering::Acquire);
                        buf[done + i] = word.to_le_bytes()[off % 8];
                    }
                }
                None => buf[done..done + in_page].fill(0),
            }
            done += in_page;
        }
    }

    /// Copy `buf` into RAM starting from `pa`.
    pub fn write_bytes(&self, pa: Pa, buf: &[u8]) {
        self.check(pa, buf.len());
        let mut done = 0;
        while done < buf.len() {
            let at = pa + done;
            let in_page = (PAGE_SIZE - at.page_offset()).min(buf.len() - done);
            let chunk = &buf[done..done + in_page];
            if at.page_offset() == 0 && in_page == PAGE_SIZE && chunk.iter().all(|b| *b == 0) {
                self.frames.lock().remove(&at.pfn());
            } else {
                let frame = self.frame_or_insert(at);
                for (i, b) in chunk.iter().enumerate() {
                    let off = at.page_offset() + i;
                    let word = frame.word(off / 8);
                    let mut bytes = word.load(Ordering::Acquire).to_le_bytes();
                    bytes[off % 8] = *b;
                    word.store(u64::from_le_bytes(bytes), Ordering::Release);
                }
            }
            done += in_page;
        }
    }

    /// Fill `cnt` frames starting from the frame of `pa` with zeros.
    pub fn zero_pages(&self, pa: Pa, cnt: usize) {
        self.check(pa, cnt << PAGE_SHIFT);
        let mut frames = self.frames.lock();
        for pfn in pa.pfn()..pa.pfn() + cnt {
            frames.remove(&pfn);
        }
    }

    /// Copy `cnt` frames from `src` to `dst`. The ranges may overlap.
    pub fn copy_pages(&self, src: Pa, dst: Pa, cnt: usize) {
        self.check(src, cnt << PAGE_SHIFT);
        self.check(dst, cnt << PAGE_SHIFT);
        let copy_one = |i: usize| {
            let (from, to) = (src.pfn() + i, dst.pfn() + i);
            let mut frames = self.frames.lock();
            match frames.get(&from) {
                Some(frame) => {
                    let copy = Frame::zeroed();
                    for (w, src) in copy.words.iter().zip(frame.words.iter()) {
                        w.store(src.load(Ordering::Acquire), Ordering::Relaxed);
                    }
                    frames.insert(to, Arc::new(copy));
                }
                None => {
                    frames.remove(&to);
                }
            }
        };
        if dst > src {
            (0..cnt).rev().for_each(copy_one);
        } else {
            (0..cnt).for_each(copy_one);
        }
    }

    /// Number of frames that hold non-zero data.
    pub fn resident_frames(&self) -> usize {
        self.frames.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ram() -> PhysicalMemory {
        PhysicalMemory::new(Pa::new(0x8000_0000).unwrap(), 0x10_0000)
    }

    #[test]
    fn unwritten_frames_read_as_zero() {
        let ram = ram();
        assert_eq!(ram.read_u64(Pa::new(0x8000_1000).unwrap()), 0);
        assert_eq!(ram.resident_frames(), 0);
    }

    #[test]
    fn bytes_cross_frames() {
        let ram = ram();
        let pa = Pa::new(0x8000_0ffc).unwrap();
        ram.write_bytes(pa, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut buf = [0; 8];
        ram.read_bytes(pa, &mut buf);
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(ram.resident_frames(), 2);
        assert_eq!(
            ram.read_u64(Pa::new(0x8000_1000).unwrap()),
            u64::from_le_bytes([5, 6, 7, 8, 0, 0, 0, 0])
        );
    }

    #[test]
    fn overlapping_copy_forward() {
        let ram = ram();
        let base = Pa::new(0x8000_0000).unwrap();
        for i in 0..4 {
            ram.write_u64(base + i * PAGE_SIZE, i as u64 + 1);
        }
        ram.copy_pages(base, base + PAGE_SIZE, 4);
        for i in 0..4 {
            assert_eq!(ram.read_u64(base + (i + 1) * PAGE_SIZE), i as u64 + 1);
        }
    }

    #[test]
    #[should_panic]
    fn out_of_window() {
        ram().write_u64(Pa::new(0x9000_0000).unwrap(), 1);
    }
}
