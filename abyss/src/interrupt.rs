//! Interrupt
use crate::MAX_CPU;
use core::sync::atomic::{AtomicBool, Ordering};

/// Enumeration for representing interrupt state
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum InterruptState {
    /// Interrupt is on.
    On,
    /// Interrupt is off.
    Off,
}

/// The interrupt mask of every CPU.
pub struct LocalIrq {
    enabled: [AtomicBool; MAX_CPU],
}

impl LocalIrq {
    /// Create a mask with interrupts off on every CPU.
    pub fn new() -> Self {
        Self {
            enabled: core::array::from_fn(|_| AtomicBool::new(false)),
        }
    }

    /// Read the current interrupt state of `cpu`.
    pub fn current(&self, cpu: usize) -> InterruptState {
        if self.enabled[cpu].load(Ordering::Acquire) {
            InterruptState::On
        } else {
            InterruptState::Off
        }
    }

    /// Unmask interrupts on `cpu`.
    pub fn enable(&self, cpu: usize) {
        self.enabled[cpu].store(true, Ordering::Release);
    }

    /// Mask interrupts on `cpu`.
    pub fn disable(&self, cpu: usize) {
        self.enabled[cpu].store(false, Ordering::Release);
    }

    /// Mask interrupts on `cpu` until the returned guard is dropped.
    pub fn guard(&self, cpu: usize) -> InterruptGuard<'_> {
        let state = self.current(cpu);
        self.disable(cpu);
        InterruptGuard {
            irq: self,
            cpu,
            state,
        }
    }
}

impl Default for LocalIrq {
    fn default() -> Self {
        Self::new()
    }
}

/// An RAII implementation of an interrupt disable. When this structure is
/// dropped (falls out of scope), the interrupt will be recovered into state on creation of this struct.
/// Therefore, you must dropped the this struct in reverse of creation order.
///
/// This structure is created by the [`LocalIrq::guard`].
pub struct InterruptGuard<'a> {
    irq: &'a LocalIrq,
    cpu: usize,
    state: InterruptState,
}

impl Drop for InterruptGuard<'_> {
    fn drop(&mut self) {
        if self.state == InterruptState::On {
            self.irq.enable(self.cpu);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_nest() {
        let irq = LocalIrq::new();
        irq.enable(1);
        {
            let _outer = irq.guard(1);
            {
                let _inner = irq.guard(1);
                assert_eq!(irq.current(1), InterruptState::Off);
            }
            assert_eq!(irq.current(1), InterruptState::Off);
        }
        assert_eq!(irq.current(1), InterruptState::On);
        assert_eq!(irq.current(0), InterruptState::Off);
    }
}
