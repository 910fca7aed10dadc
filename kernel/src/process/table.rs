//! The process table.
//!
//! Every live process, Running or Completed-but-unwaited, is here,
//! indexed by PID. PIDs are reclaimed through a free-list, preferred
//! over advancing the counter. Lock order: the table lock is always
//! acquired and released before any per-process wait lock, never
//! nested inside one.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use super::pcb::Process;
use super::{Pid, PID_MIN};

struct TableInner {
    processes: Vec<Arc<Process>>,
    pid_counter: Pid,
    free_pids: Vec<Pid>,
}

/// PID-indexed registry of live processes.
pub struct ProcessTable {
    inner: Mutex<TableInner>,
}

impl ProcessTable {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                processes: Vec::new(),
                pid_counter: PID_MIN,
                free_pids: Vec::new(),
            }),
        }
    }

    /// Assign a PID (reclaimed if one is free) and insert the process.
    pub fn add(&self, proc: &Arc<Process>) -> Pid {
        let mut inner = self.inner.lock();
        let pid = match inner.free_pids.pop() {
            Some(pid) => pid,
            None => {
                let pid = inner.pid_counter;
                inner.pid_counter += 1;
                pid
            }
        };
        proc.set_pid(pid);
        inner.processes.push(Arc::clone(proc));
        pid
    }

    /// Drop the entry for `pid` and queue the PID for reuse.
    pub fn remove(&self, pid: Pid) -> Option<Arc<Process>> {
        let mut inner = self.inner.lock();
        let index = inner.processes.iter().position(|p| p.pid() == pid)?;
        let proc = inner.processes.swap_remove(index);
        inner.free_pids.push(pid);
        Some(proc)
    }

    /// O(n) scan for `pid`.
    pub fn lookup(&self, pid: Pid) -> Option<Arc<Process>> {
        self.inner
            .lock()
            .processes
            .iter()
            .find(|p| p.pid() == pid)
            .cloned()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().processes.len()
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The kernel-wide process table.
pub static PROCESS_TABLE: ProcessTable = ProcessTable::new();

/// Register a process, assigning its PID.
pub fn add(proc: &Arc<Process>) -> Pid {
    PROCESS_TABLE.add(proc)
}

/// Remove a process, recycling its PID.
pub fn remove(pid: Pid) -> Option<Arc<Process>> {
    PROCESS_TABLE.remove(pid)
}

/// Find a process by PID.
pub fn lookup(pid: Pid) -> Option<Arc<Process>> {
    PROCESS_TABLE.lookup(pid)
}

/// Number of live (running or zombie) processes.
pub fn count() -> usize {
    PROCESS_TABLE.count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pids_start_at_pid_min() {
        let table = ProcessTable::new();
        let a = Process::create("a");
        assert_eq!(table.add(&a), PID_MIN);
        assert_eq!(a.pid(), PID_MIN);
        let b = Process::create("b");
        assert_eq!(table.add(&b), PID_MIN + 1);
    }

    #[test]
    fn test_lookup_finds_only_present_pids() {
        let table = ProcessTable::new();
        let a = Process::create("a");
        let pid = table.add(&a);
        assert!(table.lookup(pid).is_some());
        assert!(table.lookup(pid + 100).is_none());
        table.remove(pid);
        assert!(table.lookup(pid).is_none());
    }

    #[test]
    fn test_freed_pids_are_reclaimed_first() {
        let table = ProcessTable::new();
        let a = Process::create("a");
        let b = Process::create("b");
        let pid_a = table.add(&a);
        let pid_b = table.add(&b);
        table.remove(pid_a);

        // The reclaimed PID is preferred over advancing the counter.
        let c = Process::create("c");
        assert_eq!(table.add(&c), pid_a);

        // With the free-list drained, the counter resumes.
        let d = Process::create("d");
        assert_eq!(table.add(&d), pid_b + 1);
    }

    #[test]
    fn test_remove_returns_the_process() {
        let table = ProcessTable::new();
        let a = Process::create("a");
        let pid = table.add(&a);
        let removed = table.remove(pid).expect("present");
        assert_eq!(removed.pid(), pid);
        assert!(table.remove(pid).is_none());
        assert_eq!(table.count(), 0);
    }
}
