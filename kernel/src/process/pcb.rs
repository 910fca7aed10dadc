//! The process structure.
//!
//! A process owns its address space, working directory, and file table.
//! The per-process spin lock guards the pointer fields only; the wait
//! lock pairs with the wait condvar for the exit rendezvous and guards
//! the state/return-value pair. Parent/child linkage is by PID, never
//! by pointer, so process lifetimes stay acyclic.

extern crate alloc;

use alloc::string::{String, ToString};
use alloc::sync::Arc;

use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use spin::Mutex;

use super::{current, table, Pid};
use crate::error::KernelResult;
use crate::fs::devices;
use crate::fs::file::{FileHandle, FileTable, O_RDONLY, O_WRONLY};
use crate::fs::Vnode;
use crate::mm::addrspace::AddressSpace;
use crate::sync::Condvar;

/// Lifecycle state for the wait/exit rendezvous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Running,
    Completed,
}

/// State guarded by the wait lock.
pub struct WaitState {
    pub state: ProcState,
    /// Encoded exit status, meaningful once Completed.
    pub return_value: i32,
}

/// Pointer fields guarded by the per-process spin lock.
struct ProcPointers {
    addrspace: Option<Arc<AddressSpace>>,
    cwd: Option<Arc<dyn Vnode>>,
}

/// A process.
pub struct Process {
    pub name: String,
    /// p_lock: guards the pointer fields, nothing more.
    ptrs: Mutex<ProcPointers>,
    /// Descriptor table. Only this process's threads touch it.
    pub files: Mutex<FileTable>,
    /// Monotonic fd allocator.
    fd_counter: AtomicI32,
    /// Assigned by the process table.
    pid: AtomicI32,
    ppid: AtomicI32,
    num_threads: AtomicU32,
    /// Wait-lock paired with `wait_cv`; broadcast only under it.
    pub wait_lock: Mutex<WaitState>,
    pub wait_cv: Condvar,
}

impl Process {
    /// Bare process skeleton: no fds, no address space, no PID yet.
    pub(super) fn create(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            ptrs: Mutex::new(ProcPointers {
                addrspace: None,
                cwd: None,
            }),
            files: Mutex::new(FileTable::new()),
            fd_counter: AtomicI32::new(0),
            pid: AtomicI32::new(0),
            ppid: AtomicI32::new(0),
            num_threads: AtomicU32::new(0),
            wait_lock: Mutex::new(WaitState {
                state: ProcState::Running,
                return_value: -1,
            }),
            wait_cv: Condvar::new(),
        })
    }

    /// Fresh process for runprogram: standard descriptors on the
    /// console, registered in the table, cwd inherited from the caller.
    pub fn create_runprogram(name: &str) -> KernelResult<Arc<Self>> {
        let proc = Self::create(name);
        proc.open_standard_fds();
        table::add(&proc);
        if let Some(parent) = current() {
            proc.set_ppid(parent.pid());
            if let Some(cwd) = parent.cwd() {
                proc.set_cwd(Some(cwd));
            }
        }
        Ok(proc)
    }

    /// Clone-for-fork skeleton: shares every file-table entry with the
    /// parent (reference-bumped handles), copies the fd counter,
    /// records the parent PID, inherits the cwd, and registers with
    /// the process table (which assigns the PID).
    pub fn create_child(parent: &Arc<Self>) -> KernelResult<Arc<Self>> {
        let child = Self::create(&parent.name);
        *child.files.lock() = parent.files.lock().clone_for_fork();
        child
            .fd_counter
            .store(parent.fd_counter.load(Ordering::Relaxed), Ordering::Relaxed);
        table::add(&child);
        child.set_ppid(parent.pid());
        // The parent's p_lock covers the cwd read; the child is still
        // private to us.
        if let Some(cwd) = parent.cwd() {
            child.set_cwd(Some(cwd));
        }
        Ok(child)
    }

    pub fn pid(&self) -> Pid {
        self.pid.load(Ordering::Acquire)
    }

    pub(super) fn set_pid(&self, pid: Pid) {
        self.pid.store(pid, Ordering::Release);
    }

    pub fn ppid(&self) -> Pid {
        self.ppid.load(Ordering::Acquire)
    }

    pub fn set_ppid(&self, ppid: Pid) {
        self.ppid.store(ppid, Ordering::Release);
    }

    /// Fetch the address space (proc_getas).
    pub fn addrspace(&self) -> Option<Arc<AddressSpace>> {
        self.ptrs.lock().addrspace.clone()
    }

    /// Replace the address space, returning the old one (proc_setas).
    pub fn set_addrspace(&self, new: Option<Arc<AddressSpace>>) -> Option<Arc<AddressSpace>> {
        let mut ptrs = self.ptrs.lock();
        core::mem::replace(&mut ptrs.addrspace, new)
    }

    pub fn cwd(&self) -> Option<Arc<dyn Vnode>> {
        self.ptrs.lock().cwd.clone()
    }

    pub fn set_cwd(&self, cwd: Option<Arc<dyn Vnode>>) {
        self.ptrs.lock().cwd = cwd;
    }

    /// Allocate the next file descriptor (monotonic per process).
    pub fn next_fd(&self) -> i32 {
        self.fd_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Current value of the fd allocator.
    pub fn fd_counter(&self) -> i32 {
        self.fd_counter.load(Ordering::Relaxed)
    }

    /// Descriptors 0, 1, 2 on the console: read, write, write.
    pub fn open_standard_fds(&self) {
        debug_assert_eq!(self.fd_counter(), 0, "standard fds on a used table");
        let console = devices::console();
        let mut files = self.files.lock();
        for permission in [O_RDONLY, O_WRONLY, O_WRONLY] {
            let fd = self.next_fd();
            files.insert(fd, FileHandle::new(console.clone(), permission));
        }
    }

    pub fn state(&self) -> ProcState {
        self.wait_lock.lock().state
    }

    pub fn num_threads(&self) -> u32 {
        self.num_threads.load(Ordering::Acquire)
    }

    pub(super) fn thread_attach(&self) {
        self.num_threads.fetch_add(1, Ordering::AcqRel);
    }

    pub(super) fn thread_detach(&self) {
        let prev = self.num_threads.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "thread count underflow");
    }

    /// Final teardown once nothing references the process: drop the
    /// cwd, destroy any remaining address space, release every file
    /// handle. The structure itself goes when the last Arc does.
    pub fn destroy(&self) {
        self.set_cwd(None);
        if let Some(space) = self.set_addrspace(None) {
            space.destroy();
        }
        self.files.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[test]
    fn test_create_starts_running_with_no_threads() {
        let proc = Process::create("unit");
        assert_eq!(proc.state(), ProcState::Running);
        assert_eq!(proc.num_threads(), 0);
        assert!(proc.addrspace().is_none());
        assert!(proc.cwd().is_none());
    }

    #[test]
    fn test_standard_fds_have_console_permissions() {
        let proc = Process::create("unit");
        proc.open_standard_fds();
        let files = proc.files.lock();
        let stdin = files.lookup(0).expect("fd 0");
        let stdout = files.lookup(1).expect("fd 1");
        let stderr = files.lookup(2).expect("fd 2");
        assert!(stdin.can_read() && !stdin.can_write());
        assert!(stdout.can_write() && !stdout.can_read());
        assert!(stderr.can_write() && !stderr.can_read());
        drop(files);
        assert_eq!(proc.fd_counter(), 3);
    }

    #[test]
    fn test_fd_counter_is_monotonic() {
        let proc = Process::create("unit");
        let a = proc.next_fd();
        let b = proc.next_fd();
        assert!(b > a);
    }

    #[test]
    fn test_create_child_shares_file_entries() {
        test_support::boot_for_tests();
        let parent = Process::create("parent");
        parent.open_standard_fds();
        table::add(&parent);

        let child = Process::create_child(&parent).expect("create child");
        let ph = parent.files.lock().lookup(1).expect("parent fd 1");
        let ch = child.files.lock().lookup(1).expect("child fd 1");
        assert!(Arc::ptr_eq(&ph, &ch));
        assert_eq!(child.fd_counter(), parent.fd_counter());
        assert_eq!(child.ppid(), parent.pid());
        assert_ne!(child.pid(), parent.pid());

        table::remove(child.pid());
        table::remove(parent.pid());
        child.destroy();
        parent.destroy();
    }

    #[test]
    fn test_set_addrspace_returns_old() {
        let proc = Process::create("unit");
        let a = AddressSpace::create();
        assert!(proc.set_addrspace(Some(a.clone())).is_none());
        let b = AddressSpace::create();
        let old = proc.set_addrspace(Some(b)).expect("old space");
        assert_eq!(old.id(), a.id());
    }
}
