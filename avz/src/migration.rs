//! ME migration.
//!
//! An ME moves to another host as a copy of its memory slot. Its stage-2
//! tables and its control page live inside the slot, so the copy carries
//! them along; only the physical addresses they hold are wrong on the new
//! host. Those addresses are all off by the same number of frames, the pfn
//! offset between the two slots, and [`Avz::fixup`] adds it back in one pass.
//!
//! On the source host the agency drives the ME through
//!
//! ```text
//! Living -> Suspended -> migration_init -> Migrating -> snapshot_read
//!        -> Dormant -> Terminated -> kill_me
//! ```
//!
//! and on the destination host through
//!
//! ```text
//! snapshot_write -> migration_final (fixup) -> Living -> unpause
//! ```
//!
//! The ME life cycle is a strict state machine; a transition it does not
//! allow halts the hypervisor.
use crate::{
    domain::Domain,
    error::Result,
    evtchn::{ChannelState, EvtchnTable, Port},
    mm::{
        stage2::{Stage2PageTable, TablePool},
        SlotLayout,
    },
    shared::MeState,
    vcpu::CpuRegs,
    Avz, AvzError, DomId, ME_CHUNK_SIZE, MEMSLOT_BASE,
};
use abyss::addressing::{Pa, PAGE_SHIFT, PAGE_SIZE};
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

/// Returns true if an ME may go from `from` to `to`.
pub fn may_move(from: MeState, to: MeState) -> bool {
    use MeState::*;
    from == to
        || matches!(
            (from, to),
            (Booting, Preparing)
                | (Preparing, Living)
                | (Living, Suspended)
                | (Suspended, Living)
                | (Suspended, Migrating)
                | (Migrating, Living)
                | (Migrating, Dormant)
                | (Dormant, Terminated)
                | (Booting | Preparing | Living | Suspended | Dormant, Killed)
                | (Killed | Terminated, Dead)
        )
}

/// Bookkeeping of an ME that travels in front of its memory image.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotHeader {
    domid: DomId,
    slot_size: usize,
    /// First frame of the slot on the source host.
    base_pfn: usize,
    root: usize,
    pool_base: usize,
    pool_pages: usize,
    pool_next: usize,
    regs: CpuRegs,
    channels: Vec<(Port, ChannelState)>,
}

impl SnapshotHeader {
    /// Stage-2 root and table pool of the image, if they sit where an ME
    /// slot of this size keeps them on the host the image was taken on.
    fn tables(&self) -> Option<(Pa, TablePool)> {
        if self.slot_size == 0 || self.slot_size % ME_CHUNK_SIZE != 0 {
            return None;
        }
        let base = self.base_pfn.checked_mul(PAGE_SIZE).and_then(Pa::new)?;
        base.into_usize()
            .checked_add(self.slot_size)
            .and_then(Pa::new)?;
        let (pool_base, pool_pages) =
            SlotLayout::of(DomId(MEMSLOT_BASE), base, self.slot_size).table_pool()?;
        if Pa::new(self.pool_base)? != pool_base
            || self.pool_pages != pool_pages
            || self.pool_next > pool_pages
        {
            return None;
        }
        let root = Pa::new(self.root).filter(|r| r.is_page_aligned() && *r >= pool_base)?;
        if (root - pool_base) >> PAGE_SHIFT >= self.pool_next {
            return None;
        }
        Some((
            root,
            TablePool::Slot {
                base: pool_base,
                pages: pool_pages,
                next: self.pool_next,
            },
        ))
    }
}

impl Avz {
    /// Move `d` to ME state `to`.
    pub fn set_me_state(&self, d: &Domain, to: MeState) {
        let from = d.control.me_state();
        if !may_move(from, to) {
            bug!("{}: illegal ME transition {:?} -> {:?}", d.domain_id, from, to);
        }
        d.control.set_me_state(to);
        log::info!("{}: {:?} -> {:?}", d.domain_id, from, to);
    }

    pub fn get_me_state(&self, d: &Domain) -> MeState {
        d.control.me_state()
    }

    /// First half of a migration step on ME slot `slot`.
    ///
    /// A suspended ME is taken off its CPU by the controller latch before it
    /// is copied. A booting or migrating ME gets its slot's size and base
    /// frame recorded in its descriptor.
    pub fn migration_init(&self, slot: usize) -> Result<()> {
        let d = self.me(slot)?;
        match d.control.me_state() {
            MeState::Suspended => self.pause_by_controller(&d),
            MeState::Booting | MeState::Migrating => {
                let layout = d.layout().ok_or(AvzError::Invalid)?;
                d.control.set_image(layout.size, layout.base.pfn());
            }
            state => bug!("{}: migration_init in state {:?}", d.domain_id, state),
        }
        Ok(())
    }

    /// Second half of a migration step on ME slot `slot`.
    ///
    /// - Suspended: the migration is over for this host; lift the latch.
    /// - Migrating: the ME just arrived; move its physical addresses by
    ///   `pfn_offset`, or by [`pfn_offset_of`](Self::pfn_offset_of) when
    ///   None, and drop the grants it had on the old host.
    /// - Preparing: only make the guest's writes visible.
    pub fn migration_final(&self, slot: usize, pfn_offset: Option<isize>) -> Result<()> {
        let d = self.me(slot)?;
        match d.control.me_state() {
            MeState::Suspended => self.unpause_by_controller(&d),
            MeState::Migrating => {
                self.mmu.flush_dcache_all();
                self.mmu.flush_tlb_all();
                let pfn_offset = match pfn_offset {
                    Some(k) => k,
                    None => self.pfn_offset_of(&d)?,
                };
                self.fixup(&d, pfn_offset)?;
                self.gnttab_reset(&d);
            }
            MeState::Preparing => {
                self.mmu.flush_dcache_all();
                self.mmu.flush_tlb_all();
            }
            state => bug!("{}: migration_final in state {:?}", d.domain_id, state),
        }
        Ok(())
    }

    /// Frames between the host an image of `d` was taken on and where it
    /// was restored.
    pub fn pfn_offset_of(&self, d: &Domain) -> Result<isize> {
        let src = (*d.image_pfn.lock()).ok_or(AvzError::Invalid)?;
        let layout = d.layout().ok_or(AvzError::Invalid)?;
        Ok(layout.base.pfn() as isize - src as isize)
    }

    /// Move every physical address `d`'s image holds by `pfn_offset` frames.
    ///
    /// Covers every valid table and page descriptor of the stage-2 table,
    /// its root, the control page and the address it records of itself, and
    /// the saved translation base. The descriptor then records where RAM
    /// starts after the move. `d` must be off the CPU.
    ///
    /// Fails with nothing changed if the moved image would leave RAM or a
    /// table of `d` lies outside its table pool.
    pub fn fixup(&self, d: &Domain, pfn_offset: isize) -> Result<()> {
        let _lock = d.domain_lock.lock();
        if d.is_running() {
            bug!("{}: fixup of a running domain", d.domain_id);
        }
        let control = d
            .control
            .self_pa()
            .shift_pfn(pfn_offset)
            .filter(|pa| self.mem.contains(*pa, PAGE_SIZE))
            .ok_or(AvzError::Invalid)?;

        let layout = d.layout().ok_or(AvzError::Invalid)?;

        let (vttbr, ram) = {
            let mut mm = d.mm.lock();
            let pt = mm.as_mut().ok_or(AvzError::Invalid)?;
            let root = pt.root().shift_pfn(pfn_offset);
            if !root.map_or(false, |r| self.mem.contains(r, PAGE_SIZE)) {
                return Err(AvzError::Invalid);
            }
            pt.fixup(pfn_offset).map_err(|e| {
                log::warn!("{}: fixup by {} refused: {:?}", d.domain_id, pfn_offset, e);
                AvzError::Invalid
            })?;
            let ram = pt.translate(layout.ipa_base).unwrap_or_else(|e| {
                bug!("{}: RAM unmapped after fixup: {:?}", d.domain_id, e)
            });
            (pt.vttbr(d.domain_id.vmid()), ram)
        };
        d.control.set_pa(control);
        d.control.set_self_pa(control);
        d.control.set_domid(d.domain_id);
        d.vcpu.lock().regs.vttbr = vttbr;
        *d.image_pfn.lock() = None;
        d.control.set_image(layout.size, ram.pfn());
        log::info!(
            "{}: fixup by {} frames, control page at {:?}",
            d.domain_id,
            pfn_offset,
            control
        );
        Ok(())
    }

    /// Serialize the ME in slot `slot`: a header with its bookkeeping,
    /// then the bytes of its memory slot.
    ///
    /// The ME must be suspended or migrating, and off its CPU.
    pub fn snapshot_read(&self, slot: usize) -> Result<Vec<u8>> {
        let d = self.me(slot)?;
        if !matches!(
            d.control.me_state(),
            MeState::Suspended | MeState::Migrating
        ) || d.is_runnable()
        {
            return Err(AvzError::Busy);
        }
        let layout = d.layout().ok_or(AvzError::Invalid)?;
        let header = {
            let mm = d.mm.lock();
            let pt = mm.as_ref().ok_or(AvzError::Invalid)?;
            let (pool_base, pool_pages, pool_next) = match pt.pool() {
                TablePool::Slot { base, pages, next } => (*base, *pages, *next),
                TablePool::Heap(_) => bug!("{}: ME tables outside its slot", d.domain_id),
            };
            SnapshotHeader {
                domid: d.domain_id,
                slot_size: layout.size,
                base_pfn: layout.base.pfn(),
                root: pt.root().into_usize(),
                pool_base: pool_base.into_usize(),
                pool_pages,
                pool_next,
                regs: d.vcpu.lock().regs,
                channels: d.evtchn.lock().bindings(),
            }
        };
        let encoded = postcard::to_allocvec(&header).map_err(|_| AvzError::Snapshot)?;
        let mut out = Vec::with_capacity(4 + encoded.len() + layout.size);
        out.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        out.extend_from_slice(&encoded);
        let start = out.len();
        out.resize(start + layout.size, 0);
        self.mem.read_bytes(layout.base, &mut out[start..]);
        log::info!(
            "{}: snapshot of 0x{:x} bytes",
            d.domain_id,
            out.len()
        );
        Ok(out)
    }

    /// Restore a snapshot into a new ME slot. Returns the new ME's id.
    ///
    /// The restored ME is paused and keeps the physical addresses of the
    /// host the snapshot was taken on until
    /// [`migration_final`](Self::migration_final) fixes them up.
    pub fn snapshot_write(&self, snapshot: &[u8]) -> Result<DomId> {
        if snapshot.len() < 4 {
            return Err(AvzError::Snapshot);
        }
        let (len, rest) = snapshot.split_at(4);
        let len = u32::from_le_bytes([len[0], len[1], len[2], len[3]]) as usize;
        if rest.len() < len {
            return Err(AvzError::Snapshot);
        }
        let (header, image) = rest.split_at(len);
        let header: SnapshotHeader =
            postcard::from_bytes(header).map_err(|_| AvzError::Snapshot)?;
        if image.len() != header.slot_size {
            return Err(AvzError::Snapshot);
        }
        let (root, pool) = header.tables().ok_or_else(|| {
            log::warn!("{}: snapshot tables lie outside its slot", header.domid);
            AvzError::Snapshot
        })?;
        let channels = EvtchnTable::restore(&header.channels)?;

        let id = self
            .allocate_me_slot(header.slot_size)
            .ok_or(AvzError::NoSlot)?;
        let d = self.domain(id).ok_or(AvzError::InvalidDomain(id))?;
        let layout = match d.layout() {
            Some(l) if l.size == header.slot_size => l,
            _ => {
                self.discard_me(&d);
                return Err(AvzError::Snapshot);
            }
        };

        let _lock = d.domain_lock.lock();
        self.mem.write_bytes(layout.base, image);
        d.control.set_domid(id);
        d.control.set_subdomain_pa(None);
        *d.mm.lock() = Some(Stage2PageTable::from_raw(self.mem.clone(), root, pool));
        d.grant_ipa.lock().reset(layout.grant_ipa_base());
        d.vcpu.lock().regs = header.regs;
        *d.evtchn.lock() = channels;
        *d.image_pfn.lock() = Some(header.base_pfn);
        log::info!(
            "{}: restored {} from pfn 0x{:x}",
            id,
            header.domid,
            header.base_pfn
        );
        Ok(id)
    }
}
