//! fork: clone the current process.
//!
//! The child shares the parent's file-table entries (handles
//! reference-bumped, offsets common), gets a deep copy of the address
//! space and a heap copy of the trap frame, and resumes in user mode
//! seeing return value 0. Any step's failure tears the child fully
//! down and fails with ENOMEM.

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;

use super::pcb::Process;
use super::{current, table, thread, Pid};
use crate::error::{KernelError, KernelResult};
use crate::machine::trapframe::Trapframe;
use crate::machine::usermode;
use crate::mm::addrspace::AddressSpace;

/// The fork system call: returns the child PID in the parent; the
/// child enters user mode through its copied trap frame.
pub fn sys_fork(tf: &Trapframe) -> KernelResult<Pid> {
    let parent = current().ok_or(KernelError::OutOfMemory { requested_pages: 0 })?;

    // 1. Child PCB sharing the file table, registered (PID assigned).
    let child = Process::create_child(&parent).map_err(|_| oom())?;

    // 2. Address-space copy.
    let parent_space = match parent.addrspace() {
        Some(space) => space,
        None => {
            teardown(&child);
            return Err(oom());
        }
    };
    let child_space = match AddressSpace::copy(&parent_space) {
        Ok(space) => space,
        Err(_) => {
            teardown(&child);
            return Err(oom());
        }
    };
    child.set_addrspace(Some(child_space));

    // 3. Heap-resident trap-frame copy for the child's return path.
    let child_tf: Box<Trapframe> = Box::new(*tf);

    // 4. Kernel thread that warps into user mode as the child.
    let thread_proc = Arc::clone(&child);
    let spawn = thread::thread_fork("forked child", Arc::clone(&child), move || {
        // The address space is in place before the thread exists; the
        // if-let only covers a child torn down before ever running.
        if let Some(space) = thread_proc.addrspace() {
            space.activate();
            usermode::enter_forked_process(*child_tf);
        }
    });
    if spawn.is_err() {
        teardown(&child);
        return Err(oom());
    }

    // 5. Parent sees the child PID.
    Ok(child.pid())
}

fn oom() -> KernelError {
    KernelError::OutOfMemory { requested_pages: 0 }
}

/// Undo a partially constructed child.
fn teardown(child: &Arc<Process>) {
    table::remove(child.pid());
    child.destroy();
}
