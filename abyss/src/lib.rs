//! The abyss of the hypervisor that operates hardwares.
//!
//! This crate contains the machine the hypervisor core runs on: physical
//! addressing, physical RAM, the console, the per-CPU interrupt mask and the
//! clock. Everything above this crate talks to the machine only through
//! these types.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
pub mod kprint;
pub mod addressing;
pub mod interrupt;
pub mod ram;
pub mod timer;

/// Maximum number of CPU this hypervisor can support.
pub const MAX_CPU: usize = 4;
