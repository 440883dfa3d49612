//! Memory slots.
//!
//! RAM is split into slots: slot [`HYPERVISOR_SLOT`] for the hypervisor,
//! slot [`AGENCY_SLOT`] for the agency, and one slot per ME carved out of
//! the chunk pool that follows the agency slot. ME slots are whole runs of
//! [`ME_CHUNK_SIZE`] chunks handed out first-fit, so releasing a slot and
//! allocating the same size again yields the same base.
use crate::{
    config::AvzConfig, Avz, DomId, AGENCY_SLOT, HYPERVISOR_SLOT, MAX_DOMAINS, ME_CHUNK_SIZE,
    ME_IPA_BASE, MEMSLOT_BASE,
};
use abyss::addressing::{Ipa, Pa};
use alloc::vec::Vec;
use bit_vec::BitVec;

/// A region of RAM reserved for the hypervisor, the agency or one ME.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemSlot {
    pub base: Pa,
    /// Where the owner sees `base`.
    pub ipa_base: Ipa,
    pub size: usize,
    pub busy: bool,
    /// Entry point of the owner.
    pub entry: Ipa,
    /// Device tree of the owner.
    pub dtb: Ipa,
}

impl MemSlot {
    const FREE: MemSlot = MemSlot {
        base: Pa::ZERO,
        ipa_base: Ipa::ZERO,
        size: 0,
        busy: false,
        entry: Ipa::ZERO,
        dtb: Ipa::ZERO,
    };

    /// Returns true if the two slots share a byte.
    pub fn overlaps(&self, other: &MemSlot) -> bool {
        self.base < other.base + other.size && other.base < self.base + self.size
    }
}

pub struct MemSlotTable {
    slots: Vec<MemSlot>,
    /// One bit per chunk of the ME pool; set if in use.
    chunks: BitVec,
    pool_base: Pa,
}

impl MemSlotTable {
    pub fn new(config: &AvzConfig) -> Self {
        let mut slots = alloc::vec![MemSlot::FREE; MAX_DOMAINS];
        let identity = |pa: Pa| Ipa::new(pa.into_usize()).unwrap_or(Ipa::ZERO);
        slots[HYPERVISOR_SLOT] = MemSlot {
            base: config.ram_base,
            ipa_base: identity(config.ram_base),
            size: config.hypervisor_size,
            busy: true,
            entry: identity(config.ram_base),
            dtb: Ipa::ZERO,
        };
        slots[AGENCY_SLOT] = MemSlot {
            base: config.agency_base(),
            ipa_base: identity(config.agency_base()),
            size: config.agency_size,
            busy: true,
            entry: identity(config.agency_base()),
            dtb: identity(config.agency_dtb),
        };
        Self {
            slots,
            chunks: BitVec::from_elem(config.me_chunks(), false),
            pool_base: config.me_pool_base(),
        }
    }

    pub fn get(&self, slot: usize) -> Option<&MemSlot> {
        self.slots.get(slot)
    }

    pub(crate) fn get_mut(&mut self, slot: usize) -> Option<&mut MemSlot> {
        self.slots.get_mut(slot)
    }

    /// Busy slots with their ids.
    pub fn busy(&self) -> impl Iterator<Item = (usize, &MemSlot)> + '_ {
        self.slots.iter().enumerate().filter(|(_, s)| s.busy)
    }

    /// Number of chunks not in use.
    pub fn free_chunks(&self) -> usize {
        self.chunks.iter().filter(|used| !used).count()
    }

    fn first_fit(&self, n: usize) -> Option<usize> {
        let mut run = 0;
        for (i, used) in self.chunks.iter().enumerate() {
            if used {
                run = 0;
            } else {
                run += 1;
                if run == n {
                    return Some(i + 1 - n);
                }
            }
        }
        None
    }

    /// Reserve an ME slot of at least `size` bytes.
    pub fn alloc(&mut self, size: usize) -> Option<usize> {
        let n = size.div_ceil(ME_CHUNK_SIZE).max(1);
        if n > self.chunks.len() {
            return None;
        }
        let id = (MEMSLOT_BASE..MAX_DOMAINS).find(|&i| !self.slots[i].busy)?;
        let start = self.first_fit(n)?;
        for chunk in start..start + n {
            self.chunks.set(chunk, true);
        }
        self.slots[id] = MemSlot {
            base: self.pool_base + start * ME_CHUNK_SIZE,
            ipa_base: ME_IPA_BASE,
            size: n * ME_CHUNK_SIZE,
            busy: true,
            entry: ME_IPA_BASE,
            dtb: Ipa::ZERO,
        };
        Some(id)
    }

    /// Give ME slot `id` back to the pool.
    pub fn release(&mut self, id: usize) {
        let slot = match self.slots.get(id) {
            Some(s) if s.busy && id >= MEMSLOT_BASE => *s,
            _ => bug!("memory slot {} is not an allocated ME slot", id),
        };
        let start = (slot.base - self.pool_base) / ME_CHUNK_SIZE;
        for chunk in start..start + slot.size / ME_CHUNK_SIZE {
            self.chunks.set(chunk, false);
        }
        self.slots[id] = MemSlot::FREE;
    }
}

impl Avz {
    /// Reserve a memory slot of at least `size` bytes and create the ME
    /// domain that owns it.
    ///
    /// The domain id is the slot id. The domain starts paused. Returns None
    /// when no run of chunks is large enough.
    pub fn allocate_me_slot(&self, size: usize) -> Option<DomId> {
        let slot = self.memslots.lock().alloc(size);
        let id = match slot {
            Some(slot) => DomId(slot),
            None => {
                log::warn!("memslot: no room for 0x{:x} bytes", size);
                return None;
            }
        };
        self.domain_create(id, self.config.me_cpu);
        if let Some(s) = self.memslots.lock().get(id.0) {
            log::info!("memslot: {} at {:?}+0x{:x}", id, s.base, s.size);
        }
        Some(id)
    }

    /// Release the memory slot of `id`, which must be destroyed already.
    pub fn release_me_slot(&self, id: DomId) {
        if self.domain(id).is_some() {
            bug!("{}: releasing the memory slot of a live domain", id);
        }
        self.memslots.lock().release(id.0);
        log::info!("memslot: {} released", id);
    }

    /// Memory slot `id`.
    pub fn memslot(&self, id: usize) -> Option<MemSlot> {
        self.memslots.lock().get(id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    fn table() -> MemSlotTable {
        MemSlotTable::new(&AvzConfig::builder().build().unwrap())
    }

    #[test]
    fn rounds_up_to_chunks() {
        let mut t = table();
        let a = t.alloc(1).unwrap();
        let b = t.alloc(ME_CHUNK_SIZE + 1).unwrap();
        assert_eq!(a, MEMSLOT_BASE);
        assert_eq!(t.get(a).unwrap().size, ME_CHUNK_SIZE);
        assert_eq!(t.get(b).unwrap().size, 2 * ME_CHUNK_SIZE);
        assert_eq!(t.get(b).unwrap().base, t.get(a).unwrap().base + ME_CHUNK_SIZE);
        assert_eq!(t.free_chunks(), 22 - 3);
    }

    #[test]
    fn first_fit_is_deterministic() {
        let mut t = table();
        let _a = t.alloc(ME_CHUNK_SIZE).unwrap();
        let b = t.alloc(2 * ME_CHUNK_SIZE).unwrap();
        let _c = t.alloc(ME_CHUNK_SIZE).unwrap();
        let base = t.get(b).unwrap().base;
        t.release(b);
        let b2 = t.alloc(2 * ME_CHUNK_SIZE).unwrap();
        assert_eq!(t.get(b2).unwrap().base, base);
    }

    #[test]
    fn pool_runs_out() {
        let mut t = table();
        assert!(t.alloc(22 * ME_CHUNK_SIZE).is_some());
        assert_eq!(t.alloc(ME_CHUNK_SIZE), None);
    }

    #[test]
    fn oversized_request_is_refused() {
        let mut t = table();
        assert_eq!(t.alloc(usize::MAX), None);
        assert_eq!(t.alloc(usize::MAX - ME_CHUNK_SIZE + 2), None);
        assert_eq!(t.alloc(23 * ME_CHUNK_SIZE), None);
        assert_eq!(t.free_chunks(), 22);
        assert!(t.busy().next().is_none());
    }

    #[test]
    #[should_panic]
    fn releasing_a_free_slot_halts() {
        table().release(MEMSLOT_BASE);
    }

    #[test]
    fn busy_slots_never_overlap() {
        let mut rng = SmallRng::seed_from_u64(0x5eed);
        let mut t = table();
        let mut live = Vec::new();
        for _ in 0..500 {
            if !live.is_empty() && rng.gen_bool(0.4) {
                let id = live.swap_remove(rng.gen_range(0..live.len()));
                t.release(id);
            } else if let Some(id) = t.alloc(rng.gen_range(1..=4) * ME_CHUNK_SIZE) {
                live.push(id);
            }
            let busy: Vec<_> = t.busy().map(|(_, s)| *s).collect();
            for (i, a) in busy.iter().enumerate() {
                assert_eq!(a.size % ME_CHUNK_SIZE, 0);
                for b in &busy[i + 1..] {
                    assert!(!a.overlaps(b), "{:?} overlaps {:?}", a, b);
                }
            }
        }
    }
}
