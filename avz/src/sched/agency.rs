//! Policy of a CPU dedicated to the agency.
use super::{SchedPolicy, Slice};
use crate::{domain::Domain, DomId};
use core::sync::atomic::{AtomicBool, Ordering};
use spin_lock::SpinLock;

/// Runs the agency whenever it can run, and the idle domain otherwise.
///
/// The agency is never preempted by a slice deadline.
pub struct AgencyPolicy {
    cpu: usize,
    agency: SpinLock<Option<DomId>>,
    runnable: AtomicBool,
}

impl AgencyPolicy {
    pub fn new(cpu: usize) -> Self {
        Self {
            cpu,
            agency: SpinLock::new(None),
            runnable: AtomicBool::new(false),
        }
    }

    fn is_agency(&self, d: &Domain) -> bool {
        *self.agency.lock() == Some(d.domain_id)
    }
}

impl SchedPolicy for AgencyPolicy {
    fn name(&self) -> &'static str {
        "agency"
    }

    fn insert(&self, d: &Domain) {
        if d.domain_id.is_agency() {
            *self.agency.lock() = Some(d.domain_id);
        }
    }

    fn remove(&self, d: &Domain) {
        let mut agency = self.agency.lock();
        if *agency == Some(d.domain_id) {
            *agency = None;
            self.runnable.store(false, Ordering::Release);
        }
    }

    fn sleep(&self, d: &Domain) {
        if self.is_agency(d) {
            self.runnable.store(false, Ordering::Release);
        }
    }

    fn wake(&self, d: &Domain) -> bool {
        if self.is_agency(d) {
            self.runnable.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    fn deschedule(&self, _d: &Domain) {}

    fn do_schedule(&self, _now: u64) -> Slice {
        let next = match *self.agency.lock() {
            Some(id) if self.runnable.load(Ordering::Acquire) => id,
            _ => DomId::idle(self.cpu),
        };
        Slice { next, time: None }
    }
}
