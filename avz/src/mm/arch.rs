//! Translation hardware.
//!
//! The core never touches translation registers or cache maintenance
//! instructions directly; it goes through [`TranslationTable`].
//! [`EmulatedTranslation`] keeps the per-CPU registers in memory and counts
//! maintenance operations. On an ARMv8 machine, [`Armv8Translation`]
//! programs VTTBR_EL2 of the executing CPU.
use abyss::MAX_CPU;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Stage-2 translation control of the machine.
pub trait TranslationTable: Send + Sync {
    /// Program the stage-2 translation base of `cpu`.
    fn write_vttbr(&self, cpu: usize, vttbr: u64);
    /// Read the stage-2 translation base of `cpu`.
    fn read_vttbr(&self, cpu: usize) -> u64;
    /// Invalidate every stage-2 TLB entry, of every VMID.
    fn flush_tlb_all(&self);
    /// Clean and invalidate data caches to the point of coherency.
    fn flush_dcache_all(&self);
}

/// Translation registers kept in memory.
pub struct EmulatedTranslation {
    vttbr: [AtomicU64; MAX_CPU],
    tlb_flushes: AtomicUsize,
    dcache_flushes: AtomicUsize,
}

impl EmulatedTranslation {
    pub fn new() -> Self {
        Self {
            vttbr: core::array::from_fn(|_| AtomicU64::new(0)),
            tlb_flushes: AtomicUsize::new(0),
            dcache_flushes: AtomicUsize::new(0),
        }
    }

    /// Number of TLB flushes so far.
    pub fn tlb_flushes(&self) -> usize {
        self.tlb_flushes.load(Ordering::Relaxed)
    }

    /// Number of data cache flushes so far.
    pub fn dcache_flushes(&self) -> usize {
        self.dcache_flushes.load(Ordering::Relaxed)
    }
}

impl Default for EmulatedTranslation {
    fn default() -> Self {
        Self::new()
    }
}

impl TranslationTable for EmulatedTranslation {
    fn write_vttbr(&self, cpu: usize, vttbr: u64) {
        self.vttbr[cpu].store(vttbr, Ordering::Release);
    }

    fn read_vttbr(&self, cpu: usize) -> u64 {
        self.vttbr[cpu].load(Ordering::Acquire)
    }

    fn flush_tlb_all(&self) {
        self.tlb_flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn flush_dcache_all(&self) {
        self.dcache_flushes.fetch_add(1, Ordering::Relaxed);
    }
}

/// VTTBR_EL2 of the executing CPU.
///
/// `cpu` must be the executing CPU; a CPU cannot program another CPU's
/// translation registers.
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub struct Armv8Translation;

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
impl TranslationTable for Armv8Translation {
    fn write_vttbr(&self, _cpu: usize, vttbr: u64) {
        unsafe {
            core::arch::asm!("msr vttbr_el2, {}", "isb", in(reg) vttbr);
        }
    }

    fn read_vttbr(&self, _cpu: usize) -> u64 {
        let v: u64;
        unsafe {
            core::arch::asm!("mrs {}, vttbr_el2", out(reg) v);
        }
        v
    }

    fn flush_tlb_all(&self) {
        unsafe {
            core::arch::asm!("dsb ishst", "tlbi alle1is", "dsb ish", "isb");
        }
    }

    /// Clean and invalidate by set/way every data or unified cache level up
    /// to the level of coherency.
    fn flush_dcache_all(&self) {
        let clidr: u64;
        unsafe {
            core::arch::asm!("dsb sy", "mrs {}, clidr_el1", out(reg) clidr);
        }
        let loc = (clidr >> 24) & 0x7;
        for level in 0..loc {
            // 2: data only, 3: split, 4: unified.
            if (clidr >> (level * 3)) & 0x7 < 2 {
                continue;
            }
            let ccsidr: u64;
            unsafe {
                core::arch::asm!(
                    "msr csselr_el1, {}",
                    "isb",
                    "mrs {}, ccsidr_el1",
                    in(reg) level << 1,
                    out(reg) ccsidr,
                );
            }
            let line_shift = (ccsidr & 0x7) + 4;
            let ways = ((ccsidr >> 3) & 0x3ff) + 1;
            let sets = ((ccsidr >> 13) & 0x7fff) + 1;
            let way_shift = (ways as u32 - 1).leading_zeros();
            for way in 0..ways {
                for set in 0..sets {
                    let sw = (way << way_shift) | (set << line_shift) | (level << 1);
                    unsafe {
                        core::arch::asm!("dc cisw, {}", in(reg) sw);
                    }
                }
            }
        }
        unsafe {
            core::arch::asm!("msr csselr_el1, xzr", "dsb sy", "isb");
        }
    }
}
