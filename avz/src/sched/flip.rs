//! Round-robin policy.
use super::{SchedPolicy, Slice};
use crate::{domain::Domain, DomId, MAX_DOMAINS};
use bit_vec::BitVec;
use spin_lock::SpinLock;

struct RunQueue {
    /// Domains that may run, by id.
    runnable: BitVec,
    /// Domain picked last.
    cursor: usize,
}

/// Runs the runnable domains of a CPU in turn, one time slice each.
///
/// The CPU falls back to its idle domain when nothing is runnable. A slice
/// deadline is set only when another domain is waiting for the CPU.
pub struct FlipPolicy {
    cpu: usize,
    slice: u64,
    rq: SpinLock<RunQueue>,
}

impl FlipPolicy {
    pub fn new(cpu: usize, slice: u64) -> Self {
        Self {
            cpu,
            slice,
            rq: SpinLock::new(RunQueue {
                runnable: BitVec::from_elem(MAX_DOMAINS, false),
                cursor: MAX_DOMAINS - 1,
            }),
        }
    }

    /// Number of runnable domains.
    pub fn nr_runnable(&self) -> usize {
        self.rq.lock().runnable.iter().filter(|r| *r).count()
    }

    fn dequeue(&self, id: DomId) {
        if !id.is_idle() {
            self.rq.lock().runnable.set(id.0, false);
        }
    }
}

impl SchedPolicy for FlipPolicy {
    fn name(&self) -> &'static str {
        "flip"
    }

    fn remove(&self, d: &Domain) {
        self.dequeue(d.domain_id);
    }

    fn sleep(&self, d: &Domain) {
        self.dequeue(d.domain_id);
    }

    fn wake(&self, d: &Domain) -> bool {
        if d.domain_id.is_idle() {
            return false;
        }
        self.rq.lock().runnable.set(d.domain_id.0, true);
        true
    }

    fn deschedule(&self, d: &Domain) {
        if !d.is_runnable() {
            self.dequeue(d.domain_id);
        }
    }

    fn do_schedule(&self, now: u64) -> Slice {
        let mut rq = self.rq.lock();
        let waiting = rq.runnable.iter().filter(|r| *r).count();
        let cursor = rq.cursor;
        let next = (1..=MAX_DOMAINS)
            .map(|i| (cursor + i) % MAX_DOMAINS)
            .find(|&id| rq.runnable.get(id).unwrap_or(false));
        match next {
            Some(id) => {
                rq.cursor = id;
                Slice {
                    next: DomId(id),
                    time: (waiting > 1).then(|| now + self.slice),
                }
            }
            None => Slice {
                next: DomId::idle(self.cpu),
                time: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::AvzConfig, AvzBuilder, ME_CHUNK_SIZE};

    #[test]
    fn empty_queue_picks_idle() {
        let flip = FlipPolicy::new(3, 100);
        assert_eq!(
            flip.do_schedule(0),
            Slice {
                next: DomId::idle(3),
                time: None
            }
        );
    }

    #[test]
    fn takes_turns() {
        let avz = AvzBuilder::new(AvzConfig::builder().build().unwrap()).finalize();
        let a = avz.domain(avz.allocate_me_slot(ME_CHUNK_SIZE).unwrap()).unwrap();
        let b = avz.domain(avz.allocate_me_slot(ME_CHUNK_SIZE).unwrap()).unwrap();
        avz.unpause(&a);
        let flip = FlipPolicy::new(1, 100);
        flip.wake(&a);
        assert_eq!(flip.do_schedule(0).time, None);

        avz.unpause(&b);
        flip.wake(&b);
        assert_eq!(flip.nr_runnable(), 2);
        let picks: alloc::vec::Vec<_> = (0..4).map(|t| flip.do_schedule(t)).collect();
        assert_eq!(picks[0].next, b.domain_id);
        assert_eq!(picks[1].next, a.domain_id);
        assert_eq!(picks[2].next, b.domain_id);
        assert_eq!(picks[3], Slice { next: a.domain_id, time: Some(103) });

        avz.pause(&b);
        flip.deschedule(&b);
        assert_eq!(flip.do_schedule(10).next, a.domain_id);
        assert_eq!(flip.do_schedule(10).time, None);
    }
}
