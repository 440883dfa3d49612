//! Domain control page.
//!
//! The control page is one frame shared by the hypervisor and a domain. The
//! domain sees it right after its RAM; the hypervisor reaches it by physical
//! address. For an ME the frame is part of the ME's memory slot, so its
//! content moves together with the ME's memory image.
//!
//! Layout, in 64-bit words:
//!
//! | word   | field                                   |
//! |--------|-----------------------------------------|
//! | 0      | domain id                               |
//! | 1      | number of RAM pages                     |
//! | 2      | device tree physical address            |
//! | 3      | physical address of this page           |
//! | 4      | physical address of the sub-domain page |
//! | 5      | upcall pending                          |
//! | 6      | domain-call event                       |
//! | 8..13  | ME descriptor                           |
//! | 16..   | pending event bitmap                    |
use crate::{error::Result, evtchn::NR_EVTCHN, AvzError, DomId};
use abyss::{addressing::Pa, ram::PhysicalMemory};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

const DOMID: usize = 0;
const NR_PAGES: usize = 1;
const DTB: usize = 2;
const SELF_PA: usize = 3;
const SUBDOMAIN_PA: usize = 4;
const UPCALL_PENDING: usize = 5;
const DC_EVENT: usize = 6;
const ME_STATE: usize = 8;
const ME_SIZE: usize = 9;
const ME_PFN: usize = 10;
const ME_SPID: usize = 11;
const ME_CAPS: usize = 12;
const EVTCHN_PENDING: usize = 16;

/// No domain-call event is pending.
pub const DC_NO_EVENT: u64 = 0;

/// Life cycle of a Mobile Entity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive, Serialize, Deserialize,
)]
#[repr(u64)]
pub enum MeState {
    Booting = 0,
    Preparing = 1,
    Living = 2,
    Suspended = 3,
    Migrating = 4,
    Dormant = 5,
    Killed = 6,
    Terminated = 7,
    Dead = 8,
}

/// Descriptor of a Mobile Entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeDescriptor {
    pub state: MeState,
    /// Size of the ME's memory slot.
    pub size: usize,
    /// First frame of the ME's memory slot.
    pub pfn: usize,
    /// Species id.
    pub spid: u64,
    /// Capability bitmap.
    pub caps: u64,
}

/// Handle to a domain's control page.
pub struct ControlPage {
    pa: AtomicUsize,
    mem: Arc<PhysicalMemory>,
}

impl ControlPage {
    /// Take the frame at `pa` as a control page. The frame is not cleared.
    pub fn new(mem: Arc<PhysicalMemory>, pa: Pa) -> Self {
        Self {
            pa: AtomicUsize::new(pa.into_usize()),
            mem,
        }
    }

    /// Frame holding this page.
    #[inline]
    pub fn pa(&self) -> Pa {
        Pa::new(self.pa.load(Ordering::Acquire)).unwrap_or(Pa::ZERO)
    }

    pub(crate) fn set_pa(&self, pa: Pa) {
        self.pa.store(pa.into_usize(), Ordering::Release);
    }

    /// Clear the whole page.
    pub fn clear(&self) {
        self.mem.zero_pages(self.pa(), 1);
    }

    #[inline]
    fn read(&self, word: usize) -> u64 {
        self.mem.read_u64(self.pa() + word * 8)
    }

    #[inline]
    fn write(&self, word: usize, v: u64) {
        self.mem.write_u64(self.pa() + word * 8, v)
    }

    pub fn domid(&self) -> DomId {
        DomId(self.read(DOMID) as usize)
    }

    pub fn set_domid(&self, id: DomId) {
        self.write(DOMID, id.0 as u64)
    }

    pub fn nr_pages(&self) -> usize {
        self.read(NR_PAGES) as usize
    }

    pub fn set_nr_pages(&self, n: usize) {
        self.write(NR_PAGES, n as u64)
    }

    pub fn dtb(&self) -> Pa {
        Pa::new(self.read(DTB) as usize).unwrap_or(Pa::ZERO)
    }

    pub fn set_dtb(&self, pa: Pa) {
        self.write(DTB, pa.into_usize() as u64)
    }

    /// Physical address of this page as recorded in the page itself.
    pub fn self_pa(&self) -> Pa {
        Pa::new(self.read(SELF_PA) as usize).unwrap_or(Pa::ZERO)
    }

    pub fn set_self_pa(&self, pa: Pa) {
        self.write(SELF_PA, pa.into_usize() as u64)
    }

    pub fn subdomain_pa(&self) -> Option<Pa> {
        match self.read(SUBDOMAIN_PA) {
            0 => None,
            v => Pa::new(v as usize),
        }
    }

    pub fn set_subdomain_pa(&self, pa: Option<Pa>) {
        self.write(SUBDOMAIN_PA, pa.map_or(0, |pa| pa.into_usize() as u64))
    }

    pub fn upcall_pending(&self) -> bool {
        self.read(UPCALL_PENDING) != 0
    }

    pub fn set_upcall_pending(&self, pending: bool) {
        self.write(UPCALL_PENDING, pending as u64)
    }

    /// Post a domain-call event.
    ///
    /// Succeeds only if no event is pending. The slot is claimed with one
    /// compare-and-swap: release on success so the receiver sees everything
    /// written before, acquire on failure.
    pub fn set_dc_event(&self, event: u64) -> Result<()> {
        if event == DC_NO_EVENT {
            return Err(AvzError::Invalid);
        }
        self.mem.with_word(self.pa() + DC_EVENT * 8, |w| {
            w.compare_exchange(DC_NO_EVENT, event, Ordering::AcqRel, Ordering::Acquire)
                .map(|_| ())
                .map_err(|_| AvzError::Busy)
        })
    }

    /// Take the pending domain-call event, if any.
    pub fn take_dc_event(&self) -> Option<u64> {
        match self
            .mem
            .with_word(self.pa() + DC_EVENT * 8, |w| w.swap(DC_NO_EVENT, Ordering::AcqRel))
        {
            DC_NO_EVENT => None,
            event => Some(event),
        }
    }

    pub fn me_state(&self) -> MeState {
        let raw = self.read(ME_STATE);
        MeState::try_from(raw)
            .unwrap_or_else(|_| bug!("control page {:?}: unknown ME state {}", self.pa(), raw))
    }

    pub(crate) fn set_me_state(&self, state: MeState) {
        self.write(ME_STATE, state.into())
    }

    pub fn descriptor(&self) -> MeDescriptor {
        MeDescriptor {
            state: self.me_state(),
            size: self.read(ME_SIZE) as usize,
            pfn: self.read(ME_PFN) as usize,
            spid: self.read(ME_SPID),
            caps: self.read(ME_CAPS),
        }
    }

    pub(crate) fn set_descriptor(&self, desc: &MeDescriptor) {
        self.set_me_state(desc.state);
        self.write(ME_SIZE, desc.size as u64);
        self.write(ME_PFN, desc.pfn as u64);
        self.write(ME_SPID, desc.spid);
        self.write(ME_CAPS, desc.caps);
    }

    /// Record where the ME's memory image is.
    pub(crate) fn set_image(&self, size: usize, pfn: usize) {
        self.write(ME_SIZE, size as u64);
        self.write(ME_PFN, pfn as u64);
    }

    fn pending_word(&self, port: u32) -> (Pa, u64) {
        let port = port as usize;
        debug_assert!(port < NR_EVTCHN);
        (
            self.pa() + (EVTCHN_PENDING + port / 64) * 8,
            1 << (port % 64),
        )
    }

    /// Mark `port` pending. Returns true if it was already pending.
    pub fn set_pending(&self, port: u32) -> bool {
        let (at, bit) = self.pending_word(port);
        self.mem
            .with_word(at, |w| w.fetch_or(bit, Ordering::AcqRel) & bit != 0)
    }

    pub fn clear_pending(&self, port: u32) {
        let (at, bit) = self.pending_word(port);
        self.mem.with_word(at, |w| w.fetch_and(!bit, Ordering::AcqRel));
    }

    pub fn is_pending(&self, port: u32) -> bool {
        let (at, bit) = self.pending_word(port);
        self.mem.read_u64(at) & bit != 0
    }

    /// Returns true if any event channel is pending.
    pub fn any_pending(&self) -> bool {
        (0..NR_EVTCHN / 64).any(|i| self.read(EVTCHN_PENDING + i) != 0)
    }
}
