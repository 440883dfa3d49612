//! Spinlock shared by every CPU of the hypervisor.
#![cfg_attr(not(test), no_std)]

mod smplock;
pub use smplock::*;
