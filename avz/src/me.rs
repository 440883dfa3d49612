//! Mobile Entities.
//!
//! The agency brings an ME to life by injecting a loaded image into a fresh
//! memory slot, talks to it through the domain-call event slot of its
//! control page, and finally kills it.
use crate::{
    domain::Domain,
    error::Result,
    evtchn::VIRQ_DC_EVENT,
    shared::{MeDescriptor, MeState},
    Avz, AvzError, DomId, ME_IPA_BASE,
};
use abyss::addressing::PAGE_SHIFT;
use alloc::sync::Arc;

impl Avz {
    /// Load `image` into a new ME slot of at least `size` bytes. The ME
    /// starts at `entry` bytes into its RAM.
    ///
    /// The ME is left paused in state [`MeState::Booting`].
    pub fn inject_me(&self, image: &[u8], entry: usize, size: usize) -> Result<DomId> {
        let id = self.allocate_me_slot(size).ok_or(AvzError::NoSlot)?;
        let d = self.domain(id).ok_or(AvzError::InvalidDomain(id))?;
        let layout = d
            .layout()
            .unwrap_or_else(|| bug!("{}: ME without memory layout", id));
        if image.len() > layout.ram_size || entry >= layout.ram_size {
            log::warn!(
                "{}: image of 0x{:x} bytes does not fit 0x{:x}",
                id,
                image.len(),
                layout.ram_size
            );
            self.discard_me(&d);
            return Err(AvzError::ImageTooLarge);
        }

        self.mem.zero_pages(layout.base, layout.ram_size >> PAGE_SHIFT);
        self.mem.write_bytes(layout.base, image);
        self.setup_domain_page_table(&d, layout.base, layout.size);
        let pc = ME_IPA_BASE + entry;
        if let Some(slot) = self.memslots.lock().get_mut(id.0) {
            slot.entry = pc;
        }
        d.vcpu.lock().regs.pc = pc.into_usize() as u64;
        d.control.set_descriptor(&MeDescriptor {
            state: MeState::Booting,
            size: layout.size,
            pfn: layout.base.pfn(),
            spid: 0,
            caps: 0,
        });
        log::info!(
            "{}: injected 0x{:x} bytes, entry {:?}",
            id,
            image.len(),
            pc
        );
        Ok(id)
    }

    /// Kill the ME in slot `slot` and free its slot.
    ///
    /// The ME goes through [`MeState::Killed`] unless it already terminated.
    pub fn kill_me(&self, slot: usize) -> Result<()> {
        let d = self.me(slot)?;
        if d.control.me_state() != MeState::Terminated {
            self.set_me_state(&d, MeState::Killed);
        }
        self.set_me_state(&d, MeState::Dead);
        self.discard_me(&d);
        Ok(())
    }

    /// Tear `d` down and give its slot back.
    pub(crate) fn discard_me(&self, d: &Arc<Domain>) {
        self.domain_kill(d);
        self.release_me_slot(d.domain_id);
    }

    /// Post the domain-call event `event` to `target` and raise its
    /// [`VIRQ_DC_EVENT`].
    ///
    /// Fails with [`AvzError::Busy`] while the previous event is pending;
    /// the sender retries after yielding.
    pub fn set_dc_event(&self, target: DomId, event: u64) -> Result<()> {
        let d = self
            .domain(target)
            .ok_or(AvzError::InvalidDomain(target))?;
        d.control.set_dc_event(event).map_err(|e| {
            log::warn!("{}: dc event {} refused: {}", target, event, e);
            e
        })?;
        self.notify_via_virq(&d, VIRQ_DC_EVENT);
        Ok(())
    }

    /// Take the domain-call event pending for `d`.
    pub fn get_dc_event(&self, d: &Domain) -> Option<u64> {
        d.control.take_dc_event()
    }

    /// Descriptor of the ME in slot `slot`.
    pub fn me_descriptor(&self, slot: usize) -> Result<MeDescriptor> {
        Ok(self.me(slot)?.control.descriptor())
    }
}
