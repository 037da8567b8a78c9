//! Interrupt aggregation.
//!
//! Three status/enable/clear register groups collect per-filter events: input
//! lines consumed, output lines produced, end-of-frame. Bit position within a
//! group is the unit id. Status bits latch until cleared through the group's
//! clear register; the enable mask only gates the host callback, never the
//! status bits themselves.

use log::debug;

use crate::device::sipp_spec::IRQ_GROUP_COUNT;

/// Host notification fired after a drain raised an enabled status bit.
pub type IrqCallback = Box<dyn FnMut() + Send>;

/// The three interrupt register groups plus the optional host callback.
#[derive(Default)]
pub struct InterruptController {
    status: [u32; IRQ_GROUP_COUNT],
    enable: [u32; IRQ_GROUP_COUNT],
    pending: bool,
    callback: Option<IrqCallback>,
}

impl InterruptController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch the status bit for `unit` in `group`. Marks the controller
    /// pending when the bit is enabled.
    pub fn raise(&mut self, group: usize, unit: usize) {
        let bit = 1u32 << unit;
        self.status[group] |= bit;
        if self.enable[group] & bit != 0 {
            self.pending = true;
        }
        debug!("irq group {} unit {} raised", group, unit);
    }

    /// Current status mask of `group`.
    #[inline]
    pub fn status(&self, group: usize) -> u32 {
        self.status[group]
    }

    /// Current enable mask of `group`.
    #[inline]
    pub fn enable(&self, group: usize) -> u32 {
        self.enable[group]
    }

    /// Replace the enable mask of `group`.
    pub fn set_enable(&mut self, group: usize, mask: u32) {
        self.enable[group] = mask;
    }

    /// Clear the status bits set in `mask`.
    pub fn clr_status(&mut self, group: usize, mask: u32) {
        self.status[group] &= !mask;
    }

    /// Install the host callback.
    pub fn set_callback(&mut self, callback: IrqCallback) {
        self.callback = Some(callback);
    }

    pub fn clear_callback(&mut self) {
        self.callback = None;
    }

    /// Fire the callback if an enabled bit rose since the last call.
    /// Invoked once per register access after any triggered drain finished,
    /// so the callback never observes a half-updated filter.
    pub fn dispatch_pending(&mut self) {
        if !self.pending {
            return;
        }
        self.pending = false;
        if let Some(cb) = self.callback.as_mut() {
            cb();
        }
    }
}

impl std::fmt::Debug for InterruptController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptController")
            .field("status", &self.status)
            .field("enable", &self.enable)
            .field("pending", &self.pending)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sipp_spec::{IRQ_GROUP_EOF, IRQ_GROUP_INPUT};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_status_latches_until_cleared() {
        let mut irq = InterruptController::new();
        irq.raise(IRQ_GROUP_EOF, 1);
        irq.raise(IRQ_GROUP_EOF, 2);
        assert_eq!(irq.status(IRQ_GROUP_EOF), 0b110);

        irq.clr_status(IRQ_GROUP_EOF, 0b010);
        assert_eq!(irq.status(IRQ_GROUP_EOF), 0b100);
    }

    #[test]
    fn test_groups_are_independent() {
        let mut irq = InterruptController::new();
        irq.raise(IRQ_GROUP_INPUT, 0);
        assert_eq!(irq.status(IRQ_GROUP_INPUT), 1);
        assert_eq!(irq.status(IRQ_GROUP_EOF), 0);
    }

    #[test]
    fn test_callback_fires_only_for_enabled_bits() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut irq = InterruptController::new();
        let counter = hits.clone();
        irq.set_callback(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        // Disabled: status latches, callback stays quiet
        irq.raise(IRQ_GROUP_EOF, 0);
        irq.dispatch_pending();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(irq.status(IRQ_GROUP_EOF), 1);

        // Enabled: next rise dispatches once
        irq.set_enable(IRQ_GROUP_EOF, 1);
        irq.raise(IRQ_GROUP_EOF, 0);
        irq.dispatch_pending();
        irq.dispatch_pending();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
