//! waitpid: the parent side of the exit rendezvous.
//!
//! Validation happens up front; the wait itself is a condvar loop under
//! the target's wait lock. Once the child is Completed the parent reads
//! the encoded status, reaps the zombie from the process table, and
//! tears the structure down. The table lock is never held while
//! sleeping on (or even holding) a wait lock.

extern crate alloc;

use alloc::sync::Arc;

use super::pcb::{ProcState, Process};
use super::{current, table, Pid, PID_MAX, PID_MIN};
use crate::error::{KernelError, KernelResult};

/// Block until `target` completes; returns its encoded status.
pub fn wait_for(target: &Arc<Process>) -> i32 {
    let mut ws = target.wait_lock.lock();
    while ws.state != ProcState::Completed {
        ws = target.wait_cv.wait(&target.wait_lock, ws);
    }
    ws.return_value
}

/// The waitpid system call, minus the user-space status copyout.
///
/// Returns `(pid, encoded_status)`. `options` must be zero. The target
/// must be a direct child: waiting on yourself or your parent is
/// ECHILD, a PID out of range or absent is ESRCH, and an unrelated
/// process is ECHILD.
pub fn sys_waitpid(pid: Pid, options: i32) -> KernelResult<(Pid, i32)> {
    if options != 0 {
        return Err(KernelError::InvalidArgument {
            name: "options",
            value: "must be 0",
        });
    }
    let me = current().ok_or(KernelError::NoChild { pid })?;
    if !(PID_MIN..=PID_MAX).contains(&pid) {
        return Err(KernelError::NoSuchProcess { pid });
    }
    if pid == me.pid() || pid == me.ppid() {
        return Err(KernelError::NoChild { pid });
    }
    let target = table::lookup(pid).ok_or(KernelError::NoSuchProcess { pid })?;
    if target.ppid() != me.pid() {
        return Err(KernelError::NoChild { pid });
    }

    let status = wait_for(&target);

    // Reap: out of the table (recycling the PID), then final teardown.
    table::remove(pid);
    target.destroy();
    Ok((pid, status))
}
