//! AVZ, the agency virtualizer.
//!
//! A small type-1 hypervisor that partitions one machine into isolated
//! domains: the privileged agency, which hosts device drivers and
//! administers the machine, and Mobile Entities (MEs), guest domains whose
//! running state can be moved to another host.
//!
//! [`Avz`] is the hypervisor instance. It owns the arena of domains, the
//! memory slots and the per-CPU scheduler state, and every operation of the
//! core is a method on it, grouped by the module that implements it:
//!
//! - [`domain`]: create, pause, kill and destroy domains.
//! - [`sched`]: the dispatch point, the flip and agency policies, timers.
//! - [`memslot`] and [`mm`]: memory slots and stage-2 translation.
//! - [`gnttab`] and [`evtchn`]: grants and event channels between domains.
//! - [`me`] and [`migration`]: the ME life cycle, snapshots and fixup.
//! - [`hypercall`]: the single entry point for domains.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

/// Halt the hypervisor on a broken invariant.
macro_rules! bug {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        panic!($($arg)*)
    }};
}

pub mod config;
pub mod domain;
pub mod error;
pub mod evtchn;
pub mod gnttab;
pub mod hypercall;
pub mod me;
pub mod memslot;
pub mod migration;
pub mod mm;
pub mod sched;
pub mod shared;
pub mod vcpu;

use crate::{
    config::AvzConfig,
    domain::Domain,
    memslot::MemSlotTable,
    mm::{arch::EmulatedTranslation, arch::TranslationTable, frame::FrameAllocator},
    sched::PerCpu,
};
use abyss::{
    addressing::{Ipa, PAGE_SHIFT},
    interrupt::LocalIrq,
    ram::PhysicalMemory,
    timer::{Clock, ManualClock},
};
use alloc::{sync::Arc, vec::Vec};
use crossbeam_utils::CachePadded;
use serde::{Deserialize, Serialize};
use spin_lock::SpinLock;

pub use abyss::addressing::PAGE_SIZE;
pub use error::{AvzError, Result};

/// Granule of the ME memory slot allocator.
pub const ME_CHUNK_SIZE: usize = 2 << 20;
/// Number of memory slots, and of non-idle domain ids.
pub const MAX_DOMAINS: usize = 64;
/// Slot of the hypervisor itself.
pub const HYPERVISOR_SLOT: usize = 0;
/// Slot of the agency.
pub const AGENCY_SLOT: usize = 1;
/// First ME slot.
pub const MEMSLOT_BASE: usize = 2;
/// Where an ME sees its RAM.
pub const ME_IPA_BASE: Ipa = Ipa::from_pfn(0x40000);

/// Identifier of a domain.
///
/// The agency is domain 0. An ME has the id of its memory slot. Every CPU
/// owns an idle domain numbered past [`MAX_DOMAINS`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct DomId(pub usize);

impl DomId {
    pub const AGENCY: DomId = DomId(0);

    /// Idle domain of `cpu`.
    #[inline]
    pub const fn idle(cpu: usize) -> Self {
        DomId(MAX_DOMAINS + cpu)
    }

    #[inline]
    pub fn is_idle(self) -> bool {
        self.0 >= MAX_DOMAINS
    }

    #[inline]
    pub fn is_agency(self) -> bool {
        self == Self::AGENCY
    }

    #[inline]
    pub fn is_me(self) -> bool {
        (MEMSLOT_BASE..MAX_DOMAINS).contains(&self.0)
    }

    /// Memory slot backing this domain.
    pub fn slot(self) -> Option<usize> {
        if self.is_agency() {
            Some(AGENCY_SLOT)
        } else if self.is_me() {
            Some(self.0)
        } else {
            None
        }
    }

    /// VMID tagging the domain's stage-2 translations.
    #[inline]
    pub fn vmid(self) -> u64 {
        (self.0 & 0xff) as u64
    }
}

impl core::fmt::Display for DomId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_idle() {
            write!(f, "idle{}", self.0 - MAX_DOMAINS)
        } else {
            write!(f, "d{}", self.0)
        }
    }
}

/// The hypervisor.
pub struct Avz {
    config: AvzConfig,
    mem: Arc<PhysicalMemory>,
    mmu: Arc<dyn TranslationTable>,
    clock: Arc<dyn Clock>,
    irq: LocalIrq,
    heap: Arc<SpinLock<FrameAllocator>>,
    memslots: SpinLock<MemSlotTable>,
    domains: Vec<SpinLock<Option<Arc<Domain>>>>,
    cpus: Vec<CachePadded<PerCpu>>,
    domctl_lock: SpinLock<()>,
}

impl Avz {
    /// Machine configuration.
    #[inline]
    pub fn config(&self) -> &AvzConfig {
        &self.config
    }

    /// Physical RAM.
    #[inline]
    pub fn memory(&self) -> &Arc<PhysicalMemory> {
        &self.mem
    }

    /// Translation hardware.
    #[inline]
    pub fn translation(&self) -> &dyn TranslationTable {
        self.mmu.as_ref()
    }

    /// Interrupt mask of every CPU.
    #[inline]
    pub fn irq(&self) -> &LocalIrq {
        &self.irq
    }

    /// Current time.
    #[inline]
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Look up a domain.
    pub fn domain(&self, id: DomId) -> Option<Arc<Domain>> {
        self.domains.get(id.0).and_then(|d| d.lock().clone())
    }

    /// Look up the domain of ME slot `slot`.
    pub fn me(&self, slot: usize) -> Result<Arc<Domain>> {
        let id = DomId(slot);
        if !id.is_me() {
            return Err(AvzError::InvalidDomain(id));
        }
        self.domain(id).ok_or(AvzError::InvalidDomain(id))
    }

    /// The agency.
    pub fn agency(&self) -> Arc<Domain> {
        self.domain(DomId::AGENCY)
            .unwrap_or_else(|| bug!("the agency is gone"))
    }

    /// Domain currently on `cpu`.
    pub fn current(&self, cpu: usize) -> Arc<Domain> {
        let id = self.cpus[cpu].current();
        self.domain(id)
            .unwrap_or_else(|| bug!("cpu{} runs a destroyed domain {}", cpu, id))
    }

    pub(crate) fn pcpu(&self, cpu: usize) -> &PerCpu {
        &self.cpus[cpu]
    }

    fn install(&self, d: Arc<Domain>) {
        let mut slot = self.domains[d.domain_id.0].lock();
        if slot.is_some() {
            bug!("domain {} already exists", d.domain_id);
        }
        *slot = Some(d);
    }

    fn uninstall(&self, id: DomId) -> Option<Arc<Domain>> {
        self.domains[id.0].lock().take()
    }
}

/// Brings the hypervisor up.
///
/// ```ignore
/// let avz = AvzBuilder::new(config)
///     .clock(clock.clone())
///     .finalize();
/// ```
pub struct AvzBuilder {
    config: AvzConfig,
    mmu: Option<Arc<dyn TranslationTable>>,
    clock: Option<Arc<dyn Clock>>,
}

impl AvzBuilder {
    pub fn new(config: AvzConfig) -> Self {
        Self {
            config,
            mmu: None,
            clock: None,
        }
    }

    /// Use `mmu` to program stage-2 translation.
    pub fn translation(mut self, mmu: Arc<dyn TranslationTable>) -> Self {
        self.mmu = Some(mmu);
        self
    }

    /// Use `clock` as time source.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the memory layout, the idle domains and the agency.
    ///
    /// The agency comes up unpaused; the first dispatch on its CPU runs it.
    pub fn finalize(self) -> Avz {
        let config = self.config;
        let mem = Arc::new(PhysicalMemory::new(config.ram_base, config.ram_size));
        let heap = FrameAllocator::new(
            mem.clone(),
            config.ram_base,
            config.hypervisor_size >> PAGE_SHIFT,
        );
        let cpus = (0..config.nr_cpus)
            .map(|cpu| CachePadded::new(PerCpu::new(cpu, &config)))
            .collect();
        let avz = Avz {
            mmu: self
                .mmu
                .unwrap_or_else(|| Arc::new(EmulatedTranslation::new())),
            clock: self.clock.unwrap_or_else(|| Arc::new(ManualClock::new(0))),
            irq: LocalIrq::new(),
            heap: Arc::new(SpinLock::new(heap)),
            memslots: SpinLock::new(MemSlotTable::new(&config)),
            domains: (0..MAX_DOMAINS + abyss::MAX_CPU)
                .map(|_| SpinLock::new(None))
                .collect(),
            cpus,
            domctl_lock: SpinLock::new(()),
            mem,
            config,
        };
        log::info!(
            "avz: RAM {:?}+0x{:x}, {} cpus, {} ME chunks",
            config.ram_base,
            config.ram_size,
            config.nr_cpus,
            config.me_chunks()
        );

        for cpu in 0..config.nr_cpus {
            avz.domain_create(DomId::idle(cpu), cpu);
        }

        let agency = avz.domain_create(DomId::AGENCY, config.agency_cpu);
        avz.setup_domain_page_table(&agency, config.agency_base(), config.agency_size);
        agency.control.set_dtb(config.agency_dtb);
        agency.vcpu.lock().regs.pc = config.agency_base().into_usize() as u64;
        avz.unpause(&agency);
        avz
    }
}
