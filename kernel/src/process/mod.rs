//! Process management: the PCB, the process table, kernel threads, the
//! fork/exec/wait/exit lifecycle, and program loading.

extern crate alloc;

use alloc::sync::Arc;

use core::cell::RefCell;

pub mod exit;
pub mod fork;
pub mod loader;
pub mod pcb;
pub mod table;
pub mod thread;
pub mod wait;

pub use pcb::{ProcState, Process};

use crate::machine::interrupts;
use crate::mm::addrspace::AddressSpace;

/// Process identifier.
pub type Pid = i32;

/// Lowest PID handed to user processes (0 and 1 are reserved).
pub const PID_MIN: Pid = 2;

/// Highest valid PID.
pub const PID_MAX: Pid = 32767;

/// Upper bound on execv argument data.
pub const ARG_MAX: usize = 65536;

std::thread_local! {
    // curproc for the CPU modeled by this kernel thread.
    static CURRENT: RefCell<Option<Arc<Process>>> = const { RefCell::new(None) };
}

lazy_static::lazy_static! {
    /// The kernel process: owns kernel-only threads, never enters the
    /// process table, never exits.
    static ref KPROC: Arc<Process> = Process::create("[kernel]");
}

/// Create the kernel process and attach the booting thread to it.
/// Called once from boot.
pub fn bootstrap() {
    let kproc = Arc::clone(&KPROC);
    set_current(Some(kproc));
    log::info!("[PROC] kernel process up, process table ready");
}

/// The kernel process.
pub fn kproc() -> Arc<Process> {
    Arc::clone(&KPROC)
}

/// The calling thread's current process (curproc).
pub fn current() -> Option<Arc<Process>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Swap the calling thread's current process, returning the old one.
/// The update happens under a raised IPL, as the context switch would.
pub fn set_current(new: Option<Arc<Process>>) -> Option<Arc<Process>> {
    let _ipl = interrupts::splhigh();
    CURRENT.with(|c| core::mem::replace(&mut *c.borrow_mut(), new))
}

/// Address space of the current process, if any.
pub fn current_addrspace() -> Option<Arc<AddressSpace>> {
    current().and_then(|p| p.addrspace())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_is_per_thread() {
        let proc = Process::create("current-test");
        let old = set_current(Some(Arc::clone(&proc)));
        assert_eq!(
            current().expect("current was just set").pid(),
            proc.pid()
        );
        // Another thread sees its own slot, not ours.
        let other = std::thread::spawn(|| current().is_none())
            .join()
            .expect("probe thread");
        assert!(other);
        set_current(old);
    }
}
