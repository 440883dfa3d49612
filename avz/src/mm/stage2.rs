//! Stage-2 page table.
//!
//! A domain sees its memory through an Intermediate Physical Address (IPA)
//! space. The stage-2 table translates an IPA into a machine physical
//! address. The table uses the ARMv8 long-descriptor format with a 4 KiB
//! granule: four levels of 512 entries each, every level indexed by 9 bits
//! of the IPA, and 4 KiB pages at the last level.
//!
//! Table frames are taken from a [`TablePool`]. An ME's tables live inside
//! its own memory slot so that they travel with the ME's memory image; after
//! the image is copied to a different physical base, [`Stage2PageTable::fixup`]
//! moves every physical address the tables hold by the same number of frames.
use super::frame::FrameAllocator;
use abyss::{
    addressing::{Ipa, Pa, PAGE_SHIFT, PAGE_SIZE},
    ram::PhysicalMemory,
};
use alloc::{collections::BTreeSet, sync::Arc, vec::Vec};
use spin_lock::SpinLock;

const ENTRIES: usize = 512;
const LEVELS: usize = 4;
const ADDR_MASK: u64 = 0x0000_ffff_ffff_f000;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MappingError {
    /// Unaligned address.
    Unaligned,
    /// Not exist.
    NotExist,
    /// Has a duplicated mapping.
    Duplicated,
    /// No frame left for a new table.
    PoolExhausted,
    /// Address left the physical address space.
    OutOfRange,
    /// A table descriptor points outside the table pool.
    OutsidePool,
    /// A table is reachable through more than one descriptor.
    Aliased,
}

bitflags::bitflags! {
    /// Stage-2 descriptor bits (ARMv8-A, VMSAv8-64 stage 2 translation).
    pub struct S2PteFlags: u64 {
        /// The descriptor is valid.
        const VALID = 1 << 0;
        /// Next-level table at levels 0 to 2, page at level 3.
        const TABLE = 1 << 1;
        /// MemAttr: normal memory, outer and inner write-back cacheable.
        const NORMAL = 0xf << 2;
        /// S2AP: the domain may read.
        const READ = 1 << 6;
        /// S2AP: the domain may write.
        const WRITE = 1 << 7;
        /// Inner shareable.
        const INNER_SHAREABLE = 3 << 8;
        /// Access flag.
        const ACCESSED = 1 << 10;
        /// Execute never.
        const XN = 1 << 54;

        const RW = Self::READ.bits | Self::WRITE.bits;
        const PAGE = Self::VALID.bits
            | Self::TABLE.bits
            | Self::NORMAL.bits
            | Self::INNER_SHAREABLE.bits
            | Self::ACCESSED.bits;
    }
}

/// A stage-2 descriptor.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct S2Pte(u64);

impl S2Pte {
    /// Get a physical address pointed by this entry.
    #[inline]
    pub fn pa(&self) -> Option<Pa> {
        if self.flags().contains(S2PteFlags::VALID) {
            Pa::new((self.0 & ADDR_MASK) as usize)
        } else {
            None
        }
    }

    /// Get a flags this entry.
    #[inline]
    pub const fn flags(&self) -> S2PteFlags {
        S2PteFlags::from_bits_truncate(self.0)
    }

    /// Set physical address of this entry.
    ///
    /// # WARNING
    /// Permission of this entry is not changed.
    #[inline]
    pub fn set_pa(&mut self, pa: Pa) -> Result<&mut Self, MappingError> {
        if !pa.is_page_aligned() {
            Err(MappingError::Unaligned)
        } else {
            self.0 = pa.into_usize() as u64 | (self.0 & !ADDR_MASK);
            Ok(self)
        }
    }

    /// Set a permission of this entry.
    #[inline]
    pub fn set_perm(&mut self, perm: S2PteFlags) -> &mut Self {
        self.0 = perm.bits() | (self.0 & ADDR_MASK);
        self
    }
}

impl core::fmt::Debug for S2Pte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "S2Pte({:?}, {:?})", self.pa(), self.flags())
    }
}

/// Where table frames come from.
pub enum TablePool {
    /// Frames reserved inside an ME's memory slot, handed out in order.
    Slot { base: Pa, pages: usize, next: usize },
    /// Frames from the hypervisor slot.
    Heap(Arc<SpinLock<FrameAllocator>>),
}

impl TablePool {
    fn alloc(&mut self, mem: &PhysicalMemory) -> Result<Pa, MappingError> {
        match self {
            TablePool::Slot { base, pages, next } => {
                if *next == *pages {
                    return Err(MappingError::PoolExhausted);
                }
                let pa = *base + (*next << PAGE_SHIFT);
                *next += 1;
                mem.zero_pages(pa, 1);
                Ok(pa)
            }
            TablePool::Heap(heap) => heap.lock().alloc_page().ok_or(MappingError::PoolExhausted),
        }
    }
}

#[inline]
fn index(ipa: Ipa, level: usize) -> usize {
    (ipa.into_usize() >> (PAGE_SHIFT + 9 * (LEVELS - 1 - level))) & (ENTRIES - 1)
}

/// Page table that translates IPA to PA.
pub struct Stage2PageTable {
    root: Pa,
    pool: TablePool,
    mem: Arc<PhysicalMemory>,
}

impl Stage2PageTable {
    /// Create an empty table.
    pub fn new(mem: Arc<PhysicalMemory>, mut pool: TablePool) -> Result<Self, MappingError> {
        let root = pool.alloc(&mem)?;
        Ok(Self { root, pool, mem })
    }

    /// Adopt a table that already lives in memory at `root`.
    pub fn from_raw(mem: Arc<PhysicalMemory>, root: Pa, pool: TablePool) -> Self {
        Self { root, pool, mem }
    }

    /// Physical address of the level-0 table.
    #[inline]
    pub fn root(&self) -> Pa {
        self.root
    }

    #[inline]
    pub fn pool(&self) -> &TablePool {
        &self.pool
    }

    /// Value of the translation base register for this table.
    #[inline]
    pub fn vttbr(&self, vmid: u64) -> u64 {
        self.root.into_usize() as u64 | (vmid << 48)
    }

    #[inline]
    fn entry(&self, at: Pa) -> S2Pte {
        S2Pte(self.mem.read_u64(at))
    }

    #[inline]
    fn set_entry(&self, at: Pa, pte: S2Pte) {
        self.mem.write_u64(at, pte.0)
    }

    /// Find the last-level entry of `ipa`, creating missing tables.
    fn walk_or_create(&mut self, ipa: Ipa) -> Result<Pa, MappingError> {
        let mut table = self.root;
        for level in 0..LEVELS - 1 {
            let at = table + index(ipa, level) * 8;
            let mut pte = self.entry(at);
            table = match pte.pa() {
                Some(next) => next,
                None => {
                    let next = self.pool.alloc(&self.mem)?;
                    pte.set_pa(next)?
                        .set_perm(S2PteFlags::VALID | S2PteFlags::TABLE);
                    self.set_entry(at, pte);
                    next
                }
            };
        }
        Ok(table + index(ipa, LEVELS - 1) * 8)
    }

    /// Find the last-level entry of `ipa`.
    fn walk(&self, ipa: Ipa) -> Result<Pa, MappingError> {
        let mut table = self.root;
        for level in 0..LEVELS - 1 {
            table = self
                .entry(table + index(ipa, level) * 8)
                .pa()
                .ok_or(MappingError::NotExist)?;
        }
        Ok(table + index(ipa, LEVELS - 1) * 8)
    }

    /// Map the page `ipa` onto the frame `pa` with permission `perm`.
    pub fn map(&mut self, ipa: Ipa, pa: Pa, perm: S2PteFlags) -> Result<(), MappingError> {
        if !ipa.is_page_aligned() || !pa.is_page_aligned() {
            return Err(MappingError::Unaligned);
        }
        let at = self.walk_or_create(ipa)?;
        let mut pte = self.entry(at);
        if pte.pa().is_some() {
            return Err(MappingError::Duplicated);
        }
        pte.set_pa(pa)?.set_perm(S2PteFlags::PAGE | perm);
        self.set_entry(at, pte);
        Ok(())
    }

    /// Map `size` bytes from `ipa` onto the frames from `pa`.
    pub fn map_range(
        &mut self,
        ipa: Ipa,
        pa: Pa,
        size: usize,
        perm: S2PteFlags,
    ) -> Result<(), MappingError> {
        if size % PAGE_SIZE != 0 {
            return Err(MappingError::Unaligned);
        }
        (0..size)
            .step_by(PAGE_SIZE)
            .try_for_each(|off| self.map(ipa + off, pa + off, perm))
    }

    /// Remove the mapping of the page `ipa`, returning the frame it mapped.
    pub fn unmap(&mut self, ipa: Ipa) -> Result<Pa, MappingError> {
        if !ipa.is_page_aligned() {
            return Err(MappingError::Unaligned);
        }
        let at = self.walk(ipa)?;
        let pa = self.entry(at).pa().ok_or(MappingError::NotExist)?;
        self.set_entry(at, S2Pte(0));
        Ok(pa)
    }

    /// Like [`unmap`](Self::unmap), but a page with no mapping is not an
    /// error.
    pub fn unmap_if_mapped(&mut self, ipa: Ipa) -> Result<Option<Pa>, MappingError> {
        match self.unmap(ipa) {
            Ok(pa) => Ok(Some(pa)),
            Err(MappingError::NotExist) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Translate `ipa`.
    pub fn translate(&self, ipa: Ipa) -> Result<Pa, MappingError> {
        let at = self.walk(ipa & !(PAGE_SIZE - 1))?;
        self.entry(at)
            .pa()
            .map(|pa| pa + ipa.page_offset())
            .ok_or(MappingError::NotExist)
    }

    fn visit(&self, table: Pa, level: usize, ipa: usize, f: &mut impl FnMut(usize, Ipa, Pa)) {
        for idx in 0..ENTRIES {
            if let Some(pa) = self.entry(table + idx * 8).pa() {
                let ipa = ipa | (idx << (PAGE_SHIFT + 9 * (LEVELS - 1 - level)));
                f(level, Ipa::new(ipa).unwrap_or(Ipa::ZERO), pa);
                if level < LEVELS - 1 {
                    self.visit(pa, level + 1, ipa, f);
                }
            }
        }
    }

    /// Every page mapping, in IPA order.
    pub fn leaves(&self) -> Vec<(Ipa, Pa)> {
        let mut v = Vec::new();
        self.visit(self.root, 0, 0, &mut |level, ipa, pa| {
            if level == LEVELS - 1 {
                v.push((ipa, pa));
            }
        });
        v
    }

    /// Every frame holding a table of this page table, root first.
    pub fn table_frames(&self) -> Vec<Pa> {
        let mut v = alloc::vec![self.root];
        self.visit(self.root, 0, 0, &mut |level, _, pa| {
            if level < LEVELS - 1 {
                v.push(pa);
            }
        });
        v
    }

    /// Move every physical address held by this table by `pfn_offset` frames.
    ///
    /// The table frames themselves must already sit `pfn_offset` frames away
    /// from where the entries say they are: the root, every table descriptor
    /// and every page descriptor are shifted, and the walk follows the
    /// shifted table descriptors.
    ///
    /// With a slot pool, every table reached must be one of the pool frames
    /// handed out so far. Every table must be reached exactly once. The whole
    /// table is checked before the first write, so on error it is left
    /// untouched.
    pub fn fixup(&mut self, pfn_offset: isize) -> Result<(), MappingError> {
        let shift = |pa: Pa| pa.shift_pfn(pfn_offset).ok_or(MappingError::OutOfRange);
        let root = shift(self.root)?;
        let pool = match &self.pool {
            TablePool::Slot { base, next, .. } => Some((shift(*base)?, *next)),
            TablePool::Heap(_) => None,
        };
        let in_pool = |pa: Pa| match pool {
            Some((base, next)) => pa >= base && (pa - base) >> PAGE_SHIFT < next,
            None => true,
        };
        if !in_pool(root) {
            return Err(MappingError::OutsidePool);
        }
        let mut seen = BTreeSet::from([root]);
        self.check_moved(root, 0, pfn_offset, &in_pool, &mut seen)?;

        self.root = root;
        if let (TablePool::Slot { base, .. }, Some((moved, _))) = (&mut self.pool, pool) {
            *base = moved;
        }
        self.fixup_table(root, 0, pfn_offset);
        Ok(())
    }

    fn check_moved(
        &self,
        table: Pa,
        level: usize,
        pfn_offset: isize,
        in_pool: &impl Fn(Pa) -> bool,
        seen: &mut BTreeSet<Pa>,
    ) -> Result<(), MappingError> {
        for idx in 0..ENTRIES {
            if let Some(pa) = self.entry(table + idx * 8).pa() {
                let moved = pa.shift_pfn(pfn_offset).ok_or(MappingError::OutOfRange)?;
                if level < LEVELS - 1 {
                    if !in_pool(moved) {
                        return Err(MappingError::OutsidePool);
                    }
                    if !seen.insert(moved) {
                        return Err(MappingError::Aliased);
                    }
                    self.check_moved(moved, level + 1, pfn_offset, in_pool, seen)?;
                }
            }
        }
        Ok(())
    }

    fn fixup_table(&self, table: Pa, level: usize, pfn_offset: isize) {
        for idx in 0..ENTRIES {
            let at = table + idx * 8;
            let mut pte = self.entry(at);
            let moved = pte.pa().and_then(|pa| pa.shift_pfn(pfn_offset));
            if let Some(moved) = moved {
                pte.0 = moved.into_usize() as u64 | (pte.0 & !ADDR_MASK);
                self.set_entry(at, pte);
                if level < LEVELS - 1 {
                    self.fixup_table(moved, level + 1, pfn_offset);
                }
            }
        }
    }

    /// Tear the table down, giving heap frames back.
    pub fn release(self) {
        if let TablePool::Heap(heap) = &self.pool {
            let frames = self.table_frames();
            let mut heap = heap.lock();
            for pa in frames {
                heap.dealloc(pa, 1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAM: usize = 0x8000_0000;

    fn mem() -> Arc<PhysicalMemory> {
        Arc::new(PhysicalMemory::new(Pa::new(RAM).unwrap(), 0x100_0000))
    }

    fn pool(base: usize, pages: usize) -> TablePool {
        TablePool::Slot {
            base: Pa::new(base).unwrap(),
            pages,
            next: 0,
        }
    }

    fn ipa(v: usize) -> Ipa {
        Ipa::new(v).unwrap()
    }

    fn pa(v: usize) -> Pa {
        Pa::new(v).unwrap()
    }

    #[test]
    fn map_and_translate() {
        let mut pt = Stage2PageTable::new(mem(), pool(RAM + 0x10_0000, 8)).unwrap();
        pt.map(ipa(0x4000_0000), pa(RAM + 0x20_0000), S2PteFlags::RW)
            .unwrap();
        assert_eq!(
            pt.translate(ipa(0x4000_0123)),
            Ok(pa(RAM + 0x20_0123))
        );
        assert_eq!(
            pt.map(ipa(0x4000_0000), pa(RAM), S2PteFlags::RW),
            Err(MappingError::Duplicated)
        );
        assert_eq!(
            pt.map(ipa(0x4000_0010), pa(RAM), S2PteFlags::RW),
            Err(MappingError::Unaligned)
        );
        assert_eq!(pt.translate(ipa(0x4000_1000)), Err(MappingError::NotExist));
        // root + 3 intermediate levels.
        assert_eq!(pt.table_frames().len(), 4);
    }

    #[test]
    fn unmap() {
        let mut pt = Stage2PageTable::new(mem(), pool(RAM + 0x10_0000, 8)).unwrap();
        pt.map_range(ipa(0x4000_0000), pa(RAM), 4 * PAGE_SIZE, S2PteFlags::RW)
            .unwrap();
        assert_eq!(pt.unmap(ipa(0x4000_1000)), Ok(pa(RAM + 0x1000)));
        assert_eq!(pt.unmap(ipa(0x4000_1000)), Err(MappingError::NotExist));
        assert_eq!(pt.unmap_if_mapped(ipa(0x4000_1000)), Ok(None));
        assert_eq!(pt.unmap_if_mapped(ipa(0x4000_1800)), Err(MappingError::Unaligned));
        assert_eq!(pt.unmap(ipa(0x8000_0000)), Err(MappingError::NotExist));
        assert_eq!(
            pt.leaves(),
            alloc::vec![
                (ipa(0x4000_0000), pa(RAM)),
                (ipa(0x4000_2000), pa(RAM + 0x2000)),
                (ipa(0x4000_3000), pa(RAM + 0x3000)),
            ]
        );
    }

    #[test]
    fn pool_exhaustion() {
        let mut pt = Stage2PageTable::new(mem(), pool(RAM, 4)).unwrap();
        pt.map(ipa(0), pa(RAM + 0x10_0000), S2PteFlags::RW).unwrap();
        // A second last-level table does not fit.
        assert_eq!(
            pt.map(ipa(0x20_0000), pa(RAM + 0x10_0000), S2PteFlags::RW),
            Err(MappingError::PoolExhausted)
        );
    }

    #[test]
    fn fixup_matches_a_table_built_at_the_new_base() {
        const K: isize = 7;
        let build = |mem: Arc<PhysicalMemory>, shift: usize| {
            let mut pt =
                Stage2PageTable::new(mem, pool(RAM + 0x40_0000 + shift, 16)).unwrap();
            pt.map_range(
                ipa(0x4000_0000),
                pa(RAM + 0x20_0000 + shift),
                600 * PAGE_SIZE,
                S2PteFlags::RW,
            )
            .unwrap();
            pt
        };

        let moved_mem = mem();
        let mut moved = build(moved_mem.clone(), 0);
        let before = moved.leaves();
        // The whole image lands K frames higher.
        moved_mem.copy_pages(pa(RAM + 0x20_0000), pa(RAM + 0x20_0000 + 7 * PAGE_SIZE), 0x220);
        moved.fixup(K).unwrap();

        let direct_mem = mem();
        let direct = build(direct_mem.clone(), 7 * PAGE_SIZE);

        assert_eq!(moved.root(), direct.root());
        let after = moved.leaves();
        assert_eq!(after.len(), before.len());
        for ((i0, p0), (i1, p1)) in before.iter().zip(after.iter()) {
            assert_eq!(i0, i1);
            assert_eq!(p0.shift_pfn(K), Some(*p1));
        }
        assert_eq!(after, direct.leaves());
        for frame in direct.table_frames() {
            for w in 0..512 {
                assert_eq!(
                    moved_mem.read_u64(frame + w * 8),
                    direct_mem.read_u64(frame + w * 8)
                );
            }
        }
    }

    #[test]
    fn fixup_refuses_tables_outside_the_pool() {
        let mem = mem();
        let mut pt = Stage2PageTable::new(mem.clone(), pool(RAM + 0x10_0000, 8)).unwrap();
        pt.map(ipa(0x4000_0000), pa(RAM), S2PteFlags::RW).unwrap();
        let root = pt.root();
        let stray = pa(RAM + 0x30_0000);
        mem.write_u64(stray, 0xdead_0003);
        // A level-0 entry naming a frame that was never a table of this pool.
        mem.write_u64(
            root + 8,
            stray.into_usize() as u64 | (S2PteFlags::VALID | S2PteFlags::TABLE).bits(),
        );
        assert_eq!(pt.fixup(0), Err(MappingError::OutsidePool));
        assert_eq!(pt.root(), root);
        assert_eq!(mem.read_u64(stray), 0xdead_0003);
        assert_eq!(pt.translate(ipa(0x4000_0000)), Ok(pa(RAM)));

        let mut adopted = Stage2PageTable::from_raw(mem.clone(), stray, pool(RAM + 0x10_0000, 8));
        assert_eq!(adopted.fixup(0), Err(MappingError::OutsidePool));
        assert_eq!(mem.read_u64(stray), 0xdead_0003);
    }

    #[test]
    fn fixup_refuses_a_table_reached_twice() {
        let mem = mem();
        let mut pt = Stage2PageTable::new(mem.clone(), pool(RAM + 0x10_0000, 8)).unwrap();
        pt.map(ipa(0x4000_0000), pa(RAM), S2PteFlags::RW).unwrap();
        let root = pt.root();
        let level1 = mem.read_u64(root);
        mem.write_u64(root + 8, level1);
        assert_eq!(pt.fixup(0), Err(MappingError::Aliased));
        assert_eq!(pt.root(), root);
        assert_eq!(mem.read_u64(root + 8), level1);
    }
}
