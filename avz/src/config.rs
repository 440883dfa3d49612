//! Machine configuration.
//!
//! [`AvzConfig`] describes the machine the hypervisor partitions: where RAM
//! is, how it is split between the hypervisor, the agency and the ME chunk
//! pool, and how CPUs are shared. It is created with [`ConfigBuilder`]:
//!
//! ```ignore
//! let config = AvzConfig::builder()
//!     .ram(Pa::new(0x8000_0000).unwrap(), 64 << 20)
//!     .agency_size(16 << 20)
//!     .cpus(2)
//!     .build()?;
//! ```
use crate::ME_CHUNK_SIZE;
use abyss::{addressing::Pa, MAX_CPU};
use thiserror_no_std::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not aligned to the memory slot chunk size")]
    Unaligned(&'static str),
    #[error("memory slots do not fit in RAM")]
    RamTooSmall,
    #[error("cpu {0} does not exist")]
    NoSuchCpu(usize),
    #[error("time slice must not be zero")]
    ZeroTimeSlice,
}

/// Validated machine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvzConfig {
    /// First byte of RAM.
    pub ram_base: Pa,
    /// Size of RAM in bytes.
    pub ram_size: usize,
    /// Size of the hypervisor slot at the start of RAM.
    pub hypervisor_size: usize,
    /// Size of the agency slot right after the hypervisor slot.
    pub agency_size: usize,
    /// Number of CPUs brought up.
    pub nr_cpus: usize,
    /// CPU the agency runs on.
    pub agency_cpu: usize,
    /// CPU MEs run on.
    pub me_cpu: usize,
    /// Flip policy time slice in nanoseconds.
    pub time_slice: u64,
    /// Device tree handed to the agency.
    pub agency_dtb: Pa,
}

impl AvzConfig {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Returns true if MEs share the agency CPU.
    #[inline]
    pub fn agency_cpu_shared(&self) -> bool {
        self.agency_cpu == self.me_cpu
    }

    /// First byte of the agency slot.
    #[inline]
    pub fn agency_base(&self) -> Pa {
        self.ram_base + self.hypervisor_size
    }

    /// First byte of the ME chunk pool.
    #[inline]
    pub fn me_pool_base(&self) -> Pa {
        self.agency_base() + self.agency_size
    }

    /// Number of chunks in the ME pool.
    #[inline]
    pub fn me_chunks(&self) -> usize {
        (self.ram_size - self.hypervisor_size - self.agency_size) / ME_CHUNK_SIZE
    }
}

/// Builder of [`AvzConfig`].
pub struct ConfigBuilder {
    config: AvzConfig,
}

impl ConfigBuilder {
    fn new() -> Self {
        Self {
            config: AvzConfig {
                ram_base: Pa::from_pfn(0x80000),
                ram_size: 64 << 20,
                hypervisor_size: 4 << 20,
                agency_size: 16 << 20,
                nr_cpus: 2,
                agency_cpu: 0,
                me_cpu: 1,
                time_slice: 10_000_000,
                agency_dtb: Pa::ZERO,
            },
        }
    }

    pub fn ram(mut self, base: Pa, size: usize) -> Self {
        self.config.ram_base = base;
        self.config.ram_size = size;
        self
    }

    pub fn hypervisor_size(mut self, size: usize) -> Self {
        self.config.hypervisor_size = size;
        self
    }

    pub fn agency_size(mut self, size: usize) -> Self {
        self.config.agency_size = size;
        self
    }

    /// Bring up `n` CPUs. MEs go to the last one.
    pub fn cpus(mut self, n: usize) -> Self {
        self.config.nr_cpus = n;
        self.config.me_cpu = n.saturating_sub(1);
        self
    }

    pub fn agency_cpu(mut self, cpu: usize) -> Self {
        self.config.agency_cpu = cpu;
        self
    }

    pub fn me_cpu(mut self, cpu: usize) -> Self {
        self.config.me_cpu = cpu;
        self
    }

    pub fn time_slice(mut self, ns: u64) -> Self {
        self.config.time_slice = ns;
        self
    }

    pub fn agency_dtb(mut self, dtb: Pa) -> Self {
        self.config.agency_dtb = dtb;
        self
    }

    /// Check the configuration.
    pub fn build(self) -> Result<AvzConfig, ConfigError> {
        let c = self.config;
        let aligned = |v: usize| v % ME_CHUNK_SIZE == 0;
        if !aligned(c.ram_base.into_usize()) {
            return Err(ConfigError::Unaligned("ram base"));
        }
        if !aligned(c.ram_size) {
            return Err(ConfigError::Unaligned("ram size"));
        }
        if c.hypervisor_size == 0 || !aligned(c.hypervisor_size) {
            return Err(ConfigError::Unaligned("hypervisor slot"));
        }
        if c.agency_size == 0 || !aligned(c.agency_size) {
            return Err(ConfigError::Unaligned("agency slot"));
        }
        if c.hypervisor_size + c.agency_size >= c.ram_size {
            return Err(ConfigError::RamTooSmall);
        }
        if c.nr_cpus == 0 || c.nr_cpus > MAX_CPU {
            return Err(ConfigError::NoSuchCpu(c.nr_cpus));
        }
        for cpu in [c.agency_cpu, c.me_cpu] {
            if cpu >= c.nr_cpus {
                return Err(ConfigError::NoSuchCpu(cpu));
            }
        }
        if c.time_slice == 0 {
            return Err(ConfigError::ZeroTimeSlice);
        }
        Ok(c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_split_ram() {
        let c = AvzConfig::builder().build().unwrap();
        assert_eq!(c.agency_base(), Pa::new(0x8040_0000).unwrap());
        assert_eq!(c.me_pool_base(), Pa::new(0x8140_0000).unwrap());
        assert_eq!(c.me_chunks(), 22);
        assert!(!c.agency_cpu_shared());
    }

    #[test]
    fn rejects_bad_layouts() {
        assert_eq!(
            AvzConfig::builder().agency_size(3 << 20).build(),
            Err(ConfigError::Unaligned("agency slot"))
        );
        assert_eq!(
            AvzConfig::builder().agency_size(64 << 20).build(),
            Err(ConfigError::RamTooSmall)
        );
        assert_eq!(
            AvzConfig::builder().cpus(1).agency_cpu(1).build(),
            Err(ConfigError::NoSuchCpu(1))
        );
        assert!(AvzConfig::builder().cpus(1).build().unwrap().agency_cpu_shared());
    }
}
