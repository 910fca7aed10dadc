//! Kernel threads: the collaborator seam.
//!
//! The scheduler proper is outside this kernel's scope; what the core
//! needs is the contract: a kernel thread can be forked into a
//! process, carries a current-process pointer, and can exit. On the
//! hosted machine model the backing threads are the host's.

extern crate alloc;

use alloc::string::ToString;
use alloc::sync::Arc;

use super::pcb::Process;
use super::{current, set_current};
use crate::error::{KernelError, KernelResult};

/// Fork a kernel thread attached to `proc`. The entry closure runs
/// with the thread's current process set; it must end by entering user
/// mode or calling [`thread_exit`].
pub fn thread_fork(
    name: &str,
    proc: Arc<Process>,
    entry: impl FnOnce() + Send + 'static,
) -> KernelResult<()> {
    proc.thread_attach();
    let spawned = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            set_current(Some(Arc::clone(&proc)));
            entry();
            // The entry either parked in user mode or exited; reaching
            // here means it simply returned, which also ends the
            // thread.
            if let Some(p) = set_current(None) {
                p.thread_detach();
            }
        });
    match spawned {
        Ok(_) => Ok(()),
        Err(_) => Err(KernelError::OutOfMemory { requested_pages: 0 }),
    }
}

/// Detach from the current process and stop executing. Never returns.
pub fn thread_exit() -> ! {
    if let Some(proc) = set_current(None) {
        proc.thread_detach();
    }
    loop {
        std::thread::park();
    }
}

/// Whether the calling thread currently belongs to a process.
pub fn in_process() -> bool {
    current().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_thread_fork_runs_entry_with_current_set() {
        let proc = Process::create("threaded");
        static RAN: AtomicBool = AtomicBool::new(false);
        static HAD_CURRENT: AtomicBool = AtomicBool::new(false);

        thread_fork("unit thread", Arc::clone(&proc), || {
            HAD_CURRENT.store(in_process(), Ordering::SeqCst);
            RAN.store(true, Ordering::SeqCst);
        })
        .expect("thread_fork");

        while !RAN.load(Ordering::SeqCst) {
            crate::sync::relax();
        }
        assert!(HAD_CURRENT.load(Ordering::SeqCst));
        // The entry returned, so the thread detached itself.
        while proc.num_threads() != 0 {
            crate::sync::relax();
        }
    }
}
