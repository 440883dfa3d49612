//! Domain scheduler.
//!
//! Every CPU runs a dispatcher that asks a [`SchedPolicy`] which domain runs
//! next. Two policies exist:
//!
//! - [`FlipPolicy`]: round-robin over the runnable domains of a CPU, with a
//!   fixed time slice. Used on the ME CPU and on the agency CPU when MEs
//!   share it.
//! - [`AgencyPolicy`]: always the agency. Used on a CPU dedicated to the
//!   agency.
//!
//! Dispatch never happens in the middle of a hypercall or an interrupt: the
//! handler raises [`Softirq::SCHEDULE`] and [`Avz::do_softirq`] calls
//! [`Avz::schedule`] on the way out.
pub mod agency;
pub mod flip;

pub use agency::AgencyPolicy;
pub use flip::FlipPolicy;

use crate::{
    config::AvzConfig,
    domain::{Domain, PauseFlags, RunState},
    evtchn::VIRQ_TIMER,
    vcpu::CpuRegs,
    Avz, DomId,
};
use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{fence, AtomicU32, AtomicUsize, Ordering};
use crossbeam_utils::Backoff;
use spin_lock::SpinLock;

bitflags::bitflags! {
    /// Deferred work of a CPU.
    pub struct Softirq: u32 {
        /// Pick a new domain.
        const SCHEDULE = 1 << 0;
        /// Run expired timers.
        const TIMER = 1 << 1;
    }
}

/// Decision of a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    /// Domain to run.
    pub next: DomId,
    /// Deadline of the slice, or None to run until the next event.
    pub time: Option<u64>,
}

/// A scheduling policy of one CPU.
///
/// Hooks are called with the CPU's scheduler lock held.
pub trait SchedPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// `d` is created on this CPU.
    fn insert(&self, _d: &Domain) {}

    /// `d` is destroyed.
    fn remove(&self, d: &Domain);

    /// `d` stopped being runnable.
    fn sleep(&self, d: &Domain);

    /// `d` became runnable. Returns true if the CPU should dispatch.
    fn wake(&self, d: &Domain) -> bool;

    /// `d` is about to give the CPU up.
    fn deschedule(&self, d: &Domain);

    /// Pick the next domain to run at time `now`.
    fn do_schedule(&self, now: u64) -> Slice;
}

pub(crate) struct SchedCpu {
    pub curr: DomId,
    /// End of the current slice.
    pub deadline: Option<u64>,
}

/// Scheduler state of one CPU.
pub(crate) struct PerCpu {
    pub id: usize,
    pub sched: SpinLock<SchedCpu>,
    current: AtomicUsize,
    pub policy: Arc<dyn SchedPolicy>,
    /// Policy of a CPU the agency lives on.
    pub passthrough: Option<Arc<AgencyPolicy>>,
    pub softirq: AtomicU32,
    /// Registers live on the CPU.
    pub regs: SpinLock<CpuRegs>,
    /// Domain whose address space is loaded.
    pub mm_owner: AtomicUsize,
}

impl PerCpu {
    pub fn new(cpu: usize, config: &AvzConfig) -> Self {
        let passthrough = (cpu == config.agency_cpu).then(|| Arc::new(AgencyPolicy::new(cpu)));
        let policy: Arc<dyn SchedPolicy> = match &passthrough {
            Some(p) if !config.agency_cpu_shared() => p.clone(),
            _ => Arc::new(FlipPolicy::new(cpu, config.time_slice)),
        };
        let idle = DomId::idle(cpu);
        Self {
            id: cpu,
            sched: SpinLock::new(SchedCpu {
                curr: idle,
                deadline: None,
            }),
            current: AtomicUsize::new(idle.0),
            policy,
            passthrough,
            softirq: AtomicU32::new(0),
            regs: SpinLock::new(CpuRegs::default()),
            mm_owner: AtomicUsize::new(idle.0),
        }
    }

    /// Domain on this CPU.
    #[inline]
    pub fn current(&self) -> DomId {
        DomId(self.current.load(Ordering::Acquire))
    }
}

impl Avz {
    /// Policy that schedules domain `id` on `cpu`.
    pub(crate) fn policy_for(&self, id: DomId, cpu: usize) -> Arc<dyn SchedPolicy> {
        let pcpu = self.pcpu(cpu);
        match &pcpu.passthrough {
            Some(p) if id.is_idle() => p.clone(),
            _ => pcpu.policy.clone(),
        }
    }

    /// Name of the policy dispatching on `cpu`.
    pub fn policy_name(&self, cpu: usize) -> &'static str {
        self.pcpu(cpu).policy.name()
    }

    /// End of the running slice on `cpu`.
    pub fn deadline(&self, cpu: usize) -> Option<u64> {
        self.pcpu(cpu).sched.lock().deadline
    }

    /// Registers live on `cpu`.
    pub fn live_regs(&self, cpu: usize) -> CpuRegs {
        *self.pcpu(cpu).regs.lock()
    }

    /// Dispatch on `cpu`.
    ///
    /// Asks the CPU's policy for the next domain and, if it differs from the
    /// current one, saves the current domain's registers, switches the
    /// address space and loads the next domain's registers.
    pub fn schedule(&self, cpu: usize) {
        let pcpu = self.pcpu(cpu);
        let _irq = self.irq.guard(cpu);
        let mut s = pcpu.sched.lock();

        let prev = self
            .domain(s.curr)
            .unwrap_or_else(|| bug!("cpu{}: current domain {} is gone", cpu, s.curr));
        prev.sched.deschedule(&prev);

        let slice = pcpu.policy.do_schedule(self.clock.now());
        s.deadline = slice.time;
        if slice.next == prev.domain_id {
            return;
        }
        let next = self
            .domain(slice.next)
            .unwrap_or_else(|| bug!("cpu{}: {} picked a missing domain {}", cpu, pcpu.policy.name(), slice.next));

        prev.set_runstate(if prev.is_runnable() {
            RunState::Runnable
        } else if prev.is_blocked() {
            RunState::Blocked
        } else {
            RunState::Offline
        });
        next.set_runstate(RunState::Running);
        next.is_running.store(true, Ordering::Release);
        s.curr = next.domain_id;
        pcpu.current.store(next.domain_id.0, Ordering::Release);

        self.context_switch(cpu, &prev, &next);
        log::trace!("cpu{}: {} -> {}", cpu, prev.domain_id, next.domain_id);

        // Everything of prev is saved.
        prev.is_running.store(false, Ordering::Release);
    }

    fn context_switch(&self, cpu: usize, prev: &Domain, next: &Domain) {
        let mut live = self.pcpu(cpu).regs.lock();
        prev.vcpu.lock().regs = *live;
        self.switch_mm(cpu, next);
        *live = next.vcpu.lock().regs;
    }

    /// Take `d` off the CPU's run queue if it cannot run, without waiting
    /// for it to leave the CPU.
    pub(crate) fn vcpu_sleep_nosync(&self, d: &Domain) {
        let pcpu = self.pcpu(d.processor);
        let _lock = pcpu.sched.lock();
        if d.is_runnable() {
            return;
        }
        match d.runstate() {
            RunState::Runnable => d.set_runstate(if d.is_blocked() {
                RunState::Blocked
            } else {
                RunState::Offline
            }),
            RunState::Running => self.raise_softirq(d.processor, Softirq::SCHEDULE),
            _ => (),
        }
        d.sched.sleep(d);
    }

    /// Like [`vcpu_sleep_nosync`](Self::vcpu_sleep_nosync), then wait until
    /// `d` is off its CPU.
    ///
    /// The wait lasts at most until the next dispatch on `d`'s CPU.
    pub(crate) fn vcpu_sleep_sync(&self, d: &Domain) {
        self.vcpu_sleep_nosync(d);
        let backoff = Backoff::new();
        while !d.is_runnable() && d.is_running.load(Ordering::Relaxed) {
            backoff.snooze();
        }
        // Pairs with the release store in `schedule`.
        fence(Ordering::Acquire);
    }

    /// Put `d` back on its CPU's run queue if nothing keeps it off.
    pub(crate) fn vcpu_wake(&self, d: &Domain) {
        let pcpu = self.pcpu(d.processor);
        let _lock = pcpu.sched.lock();
        if !d.is_runnable() {
            return;
        }
        if d.runstate() != RunState::Running {
            d.set_runstate(RunState::Runnable);
        }
        if d.sched.wake(d) {
            self.raise_softirq(d.processor, Softirq::SCHEDULE);
        }
    }

    /// Block `d` until it is woken, cancelling its timer.
    pub fn sleep(&self, d: &Domain) {
        d.raise_flags(PauseFlags::BLOCKED);
        d.vcpu.lock().timer = None;
        self.vcpu_sleep_nosync(d);
    }

    /// Block `d` until an event arrives or its timer fires.
    ///
    /// Returns immediately if an event is already pending.
    pub fn block(&self, d: &Domain) {
        d.raise_flags(PauseFlags::BLOCKED);
        if d.control.upcall_pending() {
            d.clear_flags(PauseFlags::BLOCKED);
            return;
        }
        self.vcpu_sleep_nosync(d);
    }

    /// Wake `d` if it is blocked.
    pub fn wake(&self, d: &Domain) {
        if d.clear_flags(PauseFlags::BLOCKED).contains(PauseFlags::BLOCKED) {
            self.vcpu_wake(d);
        }
    }

    /// Give the rest of the slice away.
    pub fn yield_cpu(&self, d: &Domain) {
        self.raise_softirq(d.processor, Softirq::SCHEDULE);
    }

    /// Arm the one-shot timer of `d`, or cancel it with None.
    pub fn set_timer(&self, d: &Domain, deadline: Option<u64>) {
        d.vcpu.lock().timer = deadline;
    }

    pub fn raise_softirq(&self, cpu: usize, softirq: Softirq) {
        self.pcpu(cpu)
            .softirq
            .fetch_or(softirq.bits(), Ordering::AcqRel);
    }

    /// Returns true if `softirq` is pending on `cpu`.
    pub fn softirq_pending(&self, cpu: usize, softirq: Softirq) -> bool {
        Softirq::from_bits_truncate(self.pcpu(cpu).softirq.load(Ordering::Acquire))
            .intersects(softirq)
    }

    /// Run the deferred work of `cpu` until none is left.
    pub fn do_softirq(&self, cpu: usize) {
        loop {
            let pending =
                Softirq::from_bits_truncate(self.pcpu(cpu).softirq.swap(0, Ordering::AcqRel));
            if pending.is_empty() {
                break;
            }
            if pending.contains(Softirq::TIMER) {
                self.run_timers(cpu);
            }
            if pending.contains(Softirq::SCHEDULE) {
                self.schedule(cpu);
            }
        }
    }

    /// Timer interrupt of `cpu`.
    pub fn timer_tick(&self, cpu: usize) {
        {
            let _irq = self.irq.guard(cpu);
            self.raise_softirq(cpu, Softirq::TIMER);
        }
        self.do_softirq(cpu);
    }

    fn run_timers(&self, cpu: usize) {
        let now = self.clock.now();
        {
            let mut s = self.pcpu(cpu).sched.lock();
            if matches!(s.deadline, Some(t) if t <= now) {
                s.deadline = None;
                self.raise_softirq(cpu, Softirq::SCHEDULE);
            }
        }
        for d in self.domains_on(cpu) {
            let fired = {
                let mut vcpu = d.vcpu.lock();
                match vcpu.timer {
                    Some(t) if t <= now => {
                        vcpu.timer = None;
                        true
                    }
                    _ => false,
                }
            };
            if fired {
                log::trace!("{}: timer fired", d.domain_id);
                self.notify_via_virq(&d, VIRQ_TIMER);
                self.wake(&d);
            }
        }
    }

    fn domains_on(&self, cpu: usize) -> Vec<Arc<Domain>> {
        self.domains
            .iter()
            .filter_map(|slot| slot.lock().clone())
            .filter(|d| d.processor == cpu && !d.domain_id.is_idle())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::AvzConfig, AvzBuilder, ME_CHUNK_SIZE};
    use abyss::timer::ManualClock;

    fn avz(cpus: usize) -> (Avz, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let avz = AvzBuilder::new(AvzConfig::builder().cpus(cpus).build().unwrap())
            .clock(clock.clone())
            .finalize();
        (avz, clock)
    }

    #[test]
    fn dedicated_agency_cpu_runs_the_agency() {
        let (avz, _) = avz(2);
        assert_eq!(avz.policy_name(0), "agency");
        assert_eq!(avz.policy_name(1), "flip");
        avz.do_softirq(0);
        assert_eq!(avz.current(0).domain_id, DomId::AGENCY);
        assert_eq!(avz.agency().runstate(), RunState::Running);
        assert_eq!(avz.deadline(0), None);

        avz.sleep(&avz.agency());
        avz.do_softirq(0);
        assert_eq!(avz.current(0).domain_id, DomId::idle(0));
        assert!(!avz.agency().is_running());
        assert_eq!(avz.agency().runstate(), RunState::Blocked);
    }

    #[test]
    fn registers_follow_the_domain() {
        let (avz, _) = avz(2);
        avz.do_softirq(0);
        let agency = avz.agency();
        assert_eq!(avz.live_regs(0).pc, avz.config().agency_base().into_usize() as u64);
        assert_eq!(avz.translation().read_vttbr(0), agency.vttbr());

        avz.pcpu(0).regs.lock().x[0] = 0x1234;
        avz.sleep(&agency);
        avz.do_softirq(0);
        assert_eq!(agency.vcpu.lock().regs.x[0], 0x1234);
        assert_eq!(avz.live_regs(0).x[0], 0);
        avz.wake(&agency);
        avz.do_softirq(0);
        assert_eq!(avz.live_regs(0).x[0], 0x1234);
    }

    #[test]
    fn timer_wakes_a_sleeping_domain() {
        let (avz, clock) = avz(2);
        let me = avz.allocate_me_slot(ME_CHUNK_SIZE).unwrap();
        let me = avz.domain(me).unwrap();
        avz.unpause(&me);
        avz.do_softirq(1);
        assert_eq!(avz.current(1).domain_id, me.domain_id);

        avz.set_timer(&me, Some(100));
        avz.block(&me);
        avz.do_softirq(1);
        assert_eq!(avz.current(1).domain_id, DomId::idle(1));
        assert_eq!(me.runstate(), RunState::Blocked);

        clock.advance(99);
        avz.timer_tick(1);
        assert!(me.is_blocked());
        clock.advance(1);
        avz.timer_tick(1);
        assert!(!me.is_blocked());
        assert_eq!(avz.current(1).domain_id, me.domain_id);
    }

    #[test]
    fn sleep_cancels_the_timer() {
        let (avz, _) = avz(2);
        let me = avz.domain(avz.allocate_me_slot(ME_CHUNK_SIZE).unwrap()).unwrap();
        avz.set_timer(&me, Some(10));
        avz.sleep(&me);
        assert!(me.is_blocked());
        assert_eq!(me.vcpu.lock().timer, None);
    }

    #[test]
    fn block_with_pending_event_returns() {
        let (avz, _) = avz(2);
        let me = avz.domain(avz.allocate_me_slot(ME_CHUNK_SIZE).unwrap()).unwrap();
        me.control.set_upcall_pending(true);
        avz.block(&me);
        assert!(!me.is_blocked());
    }
}
