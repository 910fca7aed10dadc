//! Interrupt priority level (IPL) model.
//!
//! The machine has a single CPU; raising the IPL makes the current
//! stretch of code atomic with respect to that CPU. TLB writes and the
//! current-process pointer update require a raised IPL.

use core::sync::atomic::{AtomicU32, Ordering};

/// Nesting depth of raised-IPL sections.
static IPL: AtomicU32 = AtomicU32::new(0);

/// RAII guard for a raised IPL; dropping it restores the previous level.
#[must_use = "dropping the guard immediately re-enables interrupts"]
pub struct IplGuard {
    _private: (),
}

/// Raise the IPL to its maximum (disable interrupts). Nests.
pub fn splhigh() -> IplGuard {
    IPL.fetch_add(1, Ordering::Acquire);
    IplGuard { _private: () }
}

impl Drop for IplGuard {
    fn drop(&mut self) {
        let prev = IPL.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0, "IPL underflow");
    }
}

/// Whether interrupts are currently disabled.
pub fn interrupts_disabled() -> bool {
    IPL.load(Ordering::Acquire) > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    // Other test threads may hold the IPL concurrently, so only the
    // positive (disabled) observations are stable here.
    #[test]
    fn test_spl_nests() {
        let _outer = splhigh();
        assert!(interrupts_disabled());
        {
            let _inner = splhigh();
            assert!(interrupts_disabled());
        }
        assert!(interrupts_disabled());
    }
}
