//! Process exit.
//!
//! `_exit` encodes the status word, marks the process Completed under
//! its wait lock, releases the address space (the structure itself
//! lingers as a zombie until the parent waits), broadcasts the
//! rendezvous condvar, and terminates the calling thread.

extern crate alloc;

use alloc::sync::Arc;

use super::pcb::{ProcState, Process};
use super::{current, thread};

/// Encode a normal exit: code in the upper byte, zeroed low bits, the
/// standard W* layout.
pub fn make_exit_status(code: i32) -> i32 {
    (code & 0xff) << 8
}

/// Recover the exit code from an encoded status word.
pub fn exit_code(status: i32) -> i32 {
    (status >> 8) & 0xff
}

/// Whether a status word denotes a normal exit.
pub fn exited_normally(status: i32) -> bool {
    status & 0xff == 0
}

/// Mark `proc` Completed with an already-encoded status and wake every
/// waiter. Split from [`sys_exit`] so the lifecycle is drivable without
/// a user thread.
pub fn complete(proc: &Arc<Process>, encoded_status: i32) {
    let mut ws = proc.wait_lock.lock();
    debug_assert_eq!(ws.state, ProcState::Running, "double exit");
    ws.return_value = encoded_status;
    ws.state = ProcState::Completed;

    // The zombie keeps its PCB but not its memory: release the address
    // space now. (The wait lock orders after the pointer lock nowhere,
    // so taking the pointer lock here is safe.)
    if let Some(space) = proc.set_addrspace(None) {
        space.destroy();
    }

    proc.wait_cv.broadcast();
    drop(ws);
    log::debug!(
        "[PROC] pid {} completed, status 0x{:x}",
        proc.pid(),
        encoded_status
    );
}

/// The _exit system call. Never returns.
pub fn sys_exit(code: i32) -> ! {
    let proc = current().expect("_exit from a thread with no process");
    complete(&proc, make_exit_status(code));
    thread::thread_exit()
}
