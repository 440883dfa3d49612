//! Memory isolation.
//!
//! Every domain owns a [`Stage2PageTable`]. The agency's RAM is mapped at
//! the same IPA as its physical address and its tables come from the
//! hypervisor slot. An ME's slot is laid out as
//!
//! ```text
//! base                          base + ram_size                 base + size
//! | RAM                         | control page | stage-2 tables |
//! ```
//!
//! and its RAM is mapped at [`ME_IPA_BASE`]. In both cases the IPA space
//! continues right after RAM with the control page, the control page of a
//! bound sub-domain, and [`NR_GRANT_IPA_SLOTS`] pages kept free for grant
//! imports.
//!
//! [`ME_IPA_BASE`]: crate::ME_IPA_BASE
pub mod arch;
pub mod frame;
pub mod stage2;

use crate::{domain::Domain, error::Result, AvzError, DomId, ME_CHUNK_SIZE, ME_IPA_BASE};
use abyss::addressing::{Ipa, Pa, PAGE_SHIFT, PAGE_SIZE};
use core::sync::atomic::Ordering;
use stage2::{MappingError, S2PteFlags, Stage2PageTable, TablePool};

/// Number of IPA pages per domain reserved for grant imports.
pub const NR_GRANT_IPA_SLOTS: usize = 8;

/// Pages at the end of an ME slot that are not RAM.
///
/// One control page, then enough table frames to map the slot at a
/// 1 GiB-aligned IPA: the upper three levels, one last-level table per
/// 2 MiB of slot, and two more for the pages that follow RAM.
pub const fn me_reserved_pages(size: usize) -> usize {
    1 + 3 + size / ME_CHUNK_SIZE + 2
}

/// Where a domain's memory sits in both address spaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotLayout {
    /// First byte of the slot.
    pub base: Pa,
    /// Size of the slot.
    pub size: usize,
    /// Bytes of the slot mapped as RAM.
    pub ram_size: usize,
    /// Where RAM starts in the IPA space.
    pub ipa_base: Ipa,
    me: bool,
}

impl SlotLayout {
    /// Layout of the slot `base..base + size` of domain `id`.
    pub fn of(id: DomId, base: Pa, size: usize) -> Self {
        if id.is_me() {
            Self {
                base,
                size,
                ram_size: size - (me_reserved_pages(size) << PAGE_SHIFT),
                ipa_base: ME_IPA_BASE,
                me: true,
            }
        } else {
            Self {
                base,
                size,
                ram_size: size,
                ipa_base: Ipa::new(base.into_usize()).unwrap_or(Ipa::ZERO),
                me: false,
            }
        }
    }

    /// Frame holding the control page, when it is part of the slot.
    pub fn control_pa(&self) -> Option<Pa> {
        self.me.then(|| self.base + self.ram_size)
    }

    /// Frames reserved for stage-2 tables, when they are part of the slot.
    pub fn table_pool(&self) -> Option<(Pa, usize)> {
        self.me.then(|| {
            (
                self.base + self.ram_size + PAGE_SIZE,
                me_reserved_pages(self.size) - 1,
            )
        })
    }

    pub fn control_ipa(&self) -> Ipa {
        self.ipa_base + self.ram_size
    }

    pub fn subdomain_ipa(&self) -> Ipa {
        self.control_ipa() + PAGE_SIZE
    }

    pub fn grant_ipa_base(&self) -> Ipa {
        self.control_ipa() + 2 * PAGE_SIZE
    }

    /// Returns true if `ipa` lies in this domain's RAM.
    pub fn contains_ram(&self, ipa: Ipa) -> bool {
        ipa >= self.ipa_base && ipa - self.ipa_base < self.ram_size
    }
}

impl crate::Avz {
    /// Build a fresh stage-2 table for `d` over the slot `base..base + size`.
    ///
    /// RAM is mapped at the slot's IPA base, the control page right after it
    /// and, if `d` has a bound sub-domain, that domain's control page after
    /// that. The grant window is reserved but left unmapped.
    pub fn setup_domain_page_table(&self, d: &Domain, base: Pa, size: usize) {
        let layout = SlotLayout::of(d.domain_id, base, size);
        let pool = match layout.table_pool() {
            Some((base, pages)) => TablePool::Slot {
                base,
                pages,
                next: 0,
            },
            None => TablePool::Heap(self.heap.clone()),
        };
        let subdomain = (*d.subdomain.lock()).and_then(|id| self.domain(id));
        let build = || -> core::result::Result<Stage2PageTable, MappingError> {
            let mut pt = Stage2PageTable::new(self.mem.clone(), pool)?;
            pt.map_range(layout.ipa_base, base, layout.ram_size, S2PteFlags::RW)?;
            pt.map(layout.control_ipa(), d.control.pa(), S2PteFlags::RW)?;
            if let Some(sub) = subdomain {
                pt.map(layout.subdomain_ipa(), sub.control.pa(), S2PteFlags::RW)?;
            }
            Ok(pt)
        };
        let pt = build()
            .unwrap_or_else(|e| bug!("{}: cannot build stage-2 table: {:?}", d.domain_id, e));
        log::debug!(
            "{}: stage-2 root {:?}, RAM {:?} at {:?}+0x{:x}",
            d.domain_id,
            pt.root(),
            base,
            layout.ipa_base,
            layout.ram_size
        );

        d.grant_ipa.lock().reset(layout.grant_ipa_base());
        d.vcpu.lock().regs.vttbr = pt.vttbr(d.domain_id.vmid());
        if let Some(old) = d.mm.lock().replace(pt) {
            old.release();
        }
        *d.layout.lock() = Some(layout);
        d.control.set_nr_pages(layout.ram_size >> PAGE_SHIFT);
        d.control.set_self_pa(d.control.pa());
    }

    /// Make `d`'s address space the active one on `cpu`.
    ///
    /// Called once per domain switch, after the outgoing domain's registers
    /// are saved.
    pub(crate) fn switch_mm(&self, cpu: usize, d: &Domain) {
        let vttbr = d.vttbr();
        if self.mmu.read_vttbr(cpu) == vttbr {
            return;
        }
        self.pcpu(cpu)
            .mm_owner
            .store(d.domain_id.0, Ordering::Release);
        self.mmu.write_vttbr(cpu, vttbr);
    }

    /// Translate an IPA of `d`.
    pub fn translate(&self, d: &Domain, ipa: Ipa) -> Result<Pa> {
        d.mm.lock()
            .as_ref()
            .ok_or(AvzError::Invalid)?
            .translate(ipa)
            .map_err(|_| AvzError::Invalid)
    }
}
