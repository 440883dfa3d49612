//! Domain management.
//!
//! A [`Domain`] is created by [`Avz::domain_create`], lives in the domain
//! arena until [`Avz::domain_destroy`], and is referred to everywhere else by
//! its [`DomId`].
//!
//! A domain can run only if all of the following hold:
//! - its pause count is zero,
//! - the controller has not paused it,
//! - it is not blocked waiting for an event,
//! - it is alive.
//!
//! The pause count nests: the domain is put to sleep when the count goes
//! from zero to one and woken when it drops back to zero. The controller
//! pause is a separate latch used by the migration control plane, so that
//! suspending an ME for migration never interferes with ordinary pausing.
use crate::{
    error::Result,
    evtchn::EvtchnTable,
    gnttab::{GrantIpaPool, GrantTable},
    mm::{stage2::S2PteFlags, stage2::Stage2PageTable, SlotLayout},
    sched::SchedPolicy,
    shared::ControlPage,
    vcpu::VCpu,
    Avz, AvzError, DomId,
};
use alloc::sync::Arc;
use core::sync::atomic::{fence, AtomicBool, AtomicI32, AtomicU32, AtomicU8, Ordering};
use crossbeam_utils::Backoff;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use spin_lock::SpinLock;

bitflags::bitflags! {
    /// Reasons a domain is kept off the CPU besides its pause count.
    pub struct PauseFlags: u32 {
        /// Waiting for an event.
        const BLOCKED = 1 << 0;
    }
}

/// Scheduling state of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum RunState {
    Offline = 0,
    Runnable = 1,
    Running = 2,
    Blocked = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DyingState {
    Alive = 0,
    Dying = 1,
    Dead = 2,
}

/// Domain control block.
pub struct Domain {
    pub domain_id: DomId,
    /// CPU the domain runs on.
    pub processor: usize,
    pub(crate) sched: Arc<dyn SchedPolicy>,
    runstate: AtomicU8,
    pause_flags: AtomicU32,
    pause_count: AtomicI32,
    controller_paused: AtomicBool,
    is_dying: AtomicU8,
    pub(crate) is_running: AtomicBool,
    pub vcpu: SpinLock<VCpu>,
    pub(crate) mm: SpinLock<Option<Stage2PageTable>>,
    pub(crate) layout: SpinLock<Option<SlotLayout>>,
    pub control: ControlPage,
    control_on_heap: bool,
    pub(crate) evtchn: SpinLock<EvtchnTable>,
    pub(crate) gnttab: SpinLock<GrantTable>,
    pub(crate) grant_ipa: SpinLock<GrantIpaPool>,
    pub(crate) subdomain: SpinLock<Option<DomId>>,
    /// Held while the domain's memory image is created, relocated or torn down.
    pub(crate) domain_lock: SpinLock<()>,
    /// First frame of the host a restored image was taken on.
    pub(crate) image_pfn: SpinLock<Option<usize>>,
}

impl Domain {
    pub fn runstate(&self) -> RunState {
        let raw = self.runstate.load(Ordering::Acquire);
        RunState::try_from(raw)
            .unwrap_or_else(|_| bug!("{}: unknown run state {}", self.domain_id, raw))
    }

    pub(crate) fn set_runstate(&self, state: RunState) {
        self.runstate.store(state.into(), Ordering::Release);
    }

    pub fn pause_count(&self) -> i32 {
        self.pause_count.load(Ordering::Acquire)
    }

    pub fn is_controller_paused(&self) -> bool {
        self.controller_paused.load(Ordering::Acquire)
    }

    pub fn pause_flags(&self) -> PauseFlags {
        PauseFlags::from_bits_truncate(self.pause_flags.load(Ordering::Acquire))
    }

    /// Set `flags`, returning the previous flags.
    pub(crate) fn raise_flags(&self, flags: PauseFlags) -> PauseFlags {
        PauseFlags::from_bits_truncate(self.pause_flags.fetch_or(flags.bits(), Ordering::AcqRel))
    }

    /// Clear `flags`, returning the previous flags.
    pub(crate) fn clear_flags(&self, flags: PauseFlags) -> PauseFlags {
        PauseFlags::from_bits_truncate(self.pause_flags.fetch_and(!flags.bits(), Ordering::AcqRel))
    }

    pub fn is_blocked(&self) -> bool {
        self.pause_flags().contains(PauseFlags::BLOCKED)
    }

    pub fn dying_state(&self) -> DyingState {
        let raw = self.is_dying.load(Ordering::Acquire);
        DyingState::try_from(raw)
            .unwrap_or_else(|_| bug!("{}: unknown dying state {}", self.domain_id, raw))
    }

    /// Returns true if the domain is loaded on its CPU.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// Returns true if nothing keeps the domain off the CPU.
    pub fn is_runnable(&self) -> bool {
        self.pause_count() == 0
            && !self.is_controller_paused()
            && !self.is_blocked()
            && self.dying_state() == DyingState::Alive
    }

    /// Translation base the domain runs with, or 0 for a domain without
    /// address space.
    pub fn vttbr(&self) -> u64 {
        self.mm
            .lock()
            .as_ref()
            .map_or(0, |pt| pt.vttbr(self.domain_id.vmid()))
    }

    /// Memory layout of the domain, once it has one.
    pub fn layout(&self) -> Option<SlotLayout> {
        *self.layout.lock()
    }

    /// Root of the stage-2 table.
    pub fn stage2_root(&self) -> Option<abyss::addressing::Pa> {
        self.mm.lock().as_ref().map(|pt| pt.root())
    }
}

impl core::fmt::Debug for Domain {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Domain")
            .field("domain_id", &self.domain_id)
            .field("processor", &self.processor)
            .field("runstate", &self.runstate())
            .field("pause_count", &self.pause_count())
            .field("controller_paused", &self.is_controller_paused())
            .field("pause_flags", &self.pause_flags())
            .field("dying", &self.dying_state())
            .finish()
    }
}

impl Avz {
    /// Create domain `id` bound to `cpu`.
    ///
    /// Every domain but an idle domain starts offline with a pause count of
    /// one. The control page of an ME is taken from its memory slot, which
    /// must already be allocated; other domains take it from the hypervisor
    /// slot.
    pub fn domain_create(&self, id: DomId, cpu: usize) -> Arc<Domain> {
        if cpu >= self.config.nr_cpus {
            bug!("{}: cpu{} does not exist", id, cpu);
        }
        let layout = id.is_me().then(|| {
            let slot = self
                .memslots
                .lock()
                .get(id.0)
                .filter(|s| s.busy)
                .copied()
                .unwrap_or_else(|| bug!("{}: memory slot is not allocated", id));
            SlotLayout::of(id, slot.base, slot.size)
        });
        let (control_pa, control_on_heap) = match layout.and_then(|l| l.control_pa()) {
            Some(pa) => (pa, false),
            None => (
                self.heap
                    .lock()
                    .alloc_page()
                    .unwrap_or_else(|| bug!("{}: out of memory for the control page", id)),
                true,
            ),
        };
        let control = ControlPage::new(self.mem.clone(), control_pa);
        control.clear();
        control.set_domid(id);

        let idle = id.is_idle();
        let d = Arc::new(Domain {
            domain_id: id,
            processor: cpu,
            sched: self.policy_for(id, cpu),
            runstate: AtomicU8::new(u8::from(if idle {
                RunState::Running
            } else {
                RunState::Offline
            })),
            pause_flags: AtomicU32::new(0),
            pause_count: AtomicI32::new(if idle { 0 } else { 1 }),
            controller_paused: AtomicBool::new(false),
            is_dying: AtomicU8::new(DyingState::Alive.into()),
            is_running: AtomicBool::new(idle),
            vcpu: SpinLock::new(VCpu::default()),
            mm: SpinLock::new(None),
            layout: SpinLock::new(layout),
            control,
            control_on_heap,
            evtchn: SpinLock::new(EvtchnTable::new()),
            gnttab: SpinLock::new(GrantTable::new()),
            grant_ipa: SpinLock::new(GrantIpaPool::new()),
            subdomain: SpinLock::new(None),
            domain_lock: SpinLock::new(()),
            image_pfn: SpinLock::new(None),
        });
        d.sched.insert(&d);
        self.install(d.clone());
        log::info!("{}: created on cpu{} ({})", id, cpu, d.sched.name());
        d
    }

    /// Pause `d`. Returns once `d` is off its CPU.
    pub fn pause(&self, d: &Domain) {
        if d.pause_count.fetch_add(1, Ordering::AcqRel) == 0 {
            self.vcpu_sleep_sync(d);
        }
    }

    /// Undo one [`pause`](Self::pause).
    pub fn unpause(&self, d: &Domain) {
        let prev = d
            .pause_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                (c > 0).then(|| c - 1)
            })
            .unwrap_or_else(|_| bug!("{}: unpaused more than paused", d.domain_id));
        if prev == 1 {
            self.vcpu_wake(d);
        }
    }

    /// Set the controller pause latch of `d`. Returns once `d` is off its CPU.
    pub fn pause_by_controller(&self, d: &Domain) {
        if !d.controller_paused.swap(true, Ordering::AcqRel) {
            self.vcpu_sleep_sync(d);
        }
    }

    /// Clear the controller pause latch of `d`.
    pub fn unpause_by_controller(&self, d: &Domain) {
        if d.controller_paused.swap(false, Ordering::AcqRel) {
            self.vcpu_wake(d);
        }
    }

    /// Bind `child` as sub-domain of `parent`.
    ///
    /// The parent sees the child's control page right after its own.
    pub fn bind_subdomain(&self, parent: &Domain, child: &Domain) -> Result<()> {
        let layout = parent.layout().ok_or(AvzError::Invalid)?;
        *parent.subdomain.lock() = Some(child.domain_id);
        parent.control.set_subdomain_pa(Some(child.control.pa()));
        if let Some(pt) = parent.mm.lock().as_mut() {
            let ipa = layout.subdomain_ipa();
            pt.unmap_if_mapped(ipa)
                .unwrap_or_else(|e| bug!("{}: cannot unmap {:?}: {:?}", parent.domain_id, ipa, e));
            pt.map(ipa, child.control.pa(), S2PteFlags::RW)
                .unwrap_or_else(|e| bug!("{}: cannot map sub-domain page: {:?}", parent.domain_id, e));
            self.mmu.flush_tlb_all();
        }
        Ok(())
    }

    /// Kill `d`: take it off its CPU, close its channels, drop its grants and
    /// destroy it.
    pub fn domain_kill(&self, d: &Arc<Domain>) {
        if d
            .is_dying
            .compare_exchange(
                DyingState::Alive as u8,
                DyingState::Dying as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        log::info!("{}: killed", d.domain_id);
        self.pause(d);
        self.evtchn_close_all(d);
        self.gnttab_reset(d);
        d.is_dying
            .store(DyingState::Dead as u8, Ordering::Release);
        self.domain_destroy(d);
    }

    /// Release everything `d` holds and drop it from the arena.
    ///
    /// `d` must be dead. Waits until `d` is off its CPU.
    pub fn domain_destroy(&self, d: &Arc<Domain>) {
        if d.dying_state() != DyingState::Dead {
            bug!("{}: destroying a domain that is not dead", d.domain_id);
        }
        let _lock = d.domain_lock.lock();
        let backoff = Backoff::new();
        while d.is_running.load(Ordering::Relaxed) {
            backoff.snooze();
        }
        fence(Ordering::Acquire);

        d.sched.remove(d);
        if let Some(pt) = d.mm.lock().take() {
            pt.release();
        }
        if d.control_on_heap {
            self.heap.lock().dealloc(d.control.pa(), 1);
        }
        self.uninstall(d.domain_id);
        log::info!("{}: destroyed", d.domain_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::AvzConfig, AvzBuilder};

    fn avz() -> Avz {
        AvzBuilder::new(AvzConfig::builder().build().unwrap()).finalize()
    }

    #[test]
    fn agency_boots_runnable() {
        let avz = avz();
        let agency = avz.agency();
        assert_eq!(agency.pause_count(), 0);
        assert!(agency.is_runnable());
        assert_eq!(agency.runstate(), RunState::Runnable);
        assert_eq!(agency.control.domid(), DomId::AGENCY);
        assert_eq!(avz.current(0).domain_id, DomId::idle(0));
    }

    #[test]
    fn pause_nests() {
        let avz = avz();
        let d = avz.agency();
        avz.pause(&d);
        avz.pause(&d);
        assert_eq!(d.pause_count(), 2);
        assert!(!d.is_runnable());
        avz.unpause(&d);
        assert!(!d.is_runnable());
        avz.unpause(&d);
        assert_eq!(d.pause_count(), 0);
        assert!(d.is_runnable());
    }

    #[test]
    fn controller_latch_is_independent() {
        let avz = avz();
        let d = avz.agency();
        avz.pause_by_controller(&d);
        avz.pause_by_controller(&d);
        avz.pause(&d);
        avz.unpause_by_controller(&d);
        assert!(!d.is_runnable());
        avz.unpause(&d);
        assert!(d.is_runnable());
        assert_eq!(d.pause_count(), 0);
    }

    #[test]
    #[should_panic]
    fn unbalanced_unpause_halts() {
        let avz = avz();
        avz.unpause(&avz.agency());
    }

    #[test]
    #[should_panic]
    fn destroy_needs_a_dead_domain() {
        let avz = avz();
        avz.domain_destroy(&avz.agency());
    }

    #[test]
    fn kill_returns_memory() {
        let avz = avz();
        let free = avz.heap.lock().free_pages();
        let id = avz.allocate_me_slot(crate::ME_CHUNK_SIZE).unwrap();
        let d = avz.domain(id).unwrap();
        assert_eq!(d.pause_count(), 1);
        assert_eq!(d.runstate(), RunState::Offline);
        avz.domain_kill(&d);
        assert_eq!(d.dying_state(), DyingState::Dead);
        assert!(avz.domain(id).is_none());
        assert_eq!(avz.heap.lock().free_pages(), free);
    }

    fn two_mes(avz: &Avz) -> (Arc<Domain>, Arc<Domain>) {
        let me = |image: &[u8]| {
            let id = avz.inject_me(image, 0, crate::ME_CHUNK_SIZE).unwrap();
            avz.domain(id).unwrap()
        };
        (me(b"parent"), me(b"child"))
    }

    #[test]
    fn subdomain_page_follows_the_control_page() {
        let avz = avz();
        let (parent, child) = two_mes(&avz);
        let ipa = parent.layout().unwrap().subdomain_ipa();
        assert_eq!(avz.translate(&parent, ipa), Err(AvzError::Invalid));
        assert_eq!(parent.control.subdomain_pa(), None);

        avz.bind_subdomain(&parent, &child).unwrap();
        assert_eq!(avz.translate(&parent, ipa), Ok(child.control.pa()));
        assert_eq!(parent.control.subdomain_pa(), Some(child.control.pa()));

        avz.bind_subdomain(&parent, &child).unwrap();
        assert_eq!(avz.translate(&parent, ipa), Ok(child.control.pa()));
    }

    #[test]
    fn rebuilt_table_keeps_the_subdomain_page() {
        let avz = avz();
        let (parent, child) = two_mes(&avz);
        avz.bind_subdomain(&parent, &child).unwrap();

        let layout = parent.layout().unwrap();
        avz.setup_domain_page_table(&parent, layout.base, layout.size);
        assert_eq!(
            avz.translate(&parent, layout.subdomain_ipa()),
            Ok(child.control.pa())
        );
        assert_eq!(
            avz.translate(&parent, layout.control_ipa()),
            Ok(parent.control.pa())
        );
        assert_eq!(avz.translate(&parent, layout.ipa_base), Ok(layout.base));
        assert_eq!(parent.vcpu.lock().regs.vttbr, parent.vttbr());
    }
}
