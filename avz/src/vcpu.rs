//! Virtual CPU state.
use serde::{Deserialize, Serialize};

/// AArch64 register file of a domain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuRegs {
    /// x0 to x30.
    pub x: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
    /// Stage-2 translation base the domain runs with.
    pub vttbr: u64,
}

/// Saved execution state of a domain.
#[derive(Debug, Default)]
pub struct VCpu {
    pub regs: CpuRegs,
    /// Expiry of the domain's one-shot timer.
    pub timer: Option<u64>,
}
