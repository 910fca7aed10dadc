//! Process system calls: getpid, fork, execv, waitpid, _exit.
//!
//! The wrappers copy user arguments in, delegate to the lifecycle code
//! in `process::`, and copy results back out.

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::Errno;
use crate::machine::trapframe::Trapframe;
use crate::mm::{usermem, VirtualAddress};
use crate::process::{self, current, loader, ARG_MAX};

/// PID of the calling process. Cannot fail.
pub fn sys_getpid() -> i32 {
    current().map(|p| p.pid()).unwrap_or(0)
}

/// fork: child PID to the parent; the child resumes through its copied
/// trap frame seeing 0.
pub fn sys_fork(tf: &Trapframe) -> Result<i32, Errno> {
    process::fork::sys_fork(tf).map_err(|e| e.errno())
}

/// Known-bogus user pointers execv probes for explicitly: addresses in
/// kernel space, and the classic wild pointer.
fn bogus_user_pointer(addr: u32) -> bool {
    addr == 0x4000_0000 || addr >= 0x8000_0000
}

/// execv: replace the current image. Returns only on failure.
pub fn sys_execv(uprog: VirtualAddress, uargv: VirtualAddress) -> Errno {
    let proc = match current() {
        Some(p) => p,
        None => return Errno::Efault,
    };
    let space = match proc.addrspace() {
        Some(s) => s,
        None => return Errno::Efault,
    };

    let progname = match usermem::copyinstr(&space, uprog, ARG_MAX) {
        Ok(s) => s,
        Err(e) => return e.errno(),
    };
    if progname.is_empty() {
        return Errno::Einval;
    }

    // Walk the user argv vector up to its NULL terminator, copying each
    // string into kernel space.
    let mut argv: Vec<String> = Vec::new();
    if uargv.as_u32() != 0 {
        if bogus_user_pointer(uargv.as_u32()) {
            return Errno::Efault;
        }
        loop {
            if argv.len() >= ARG_MAX / 4 {
                return Errno::Einval;
            }
            let slot = uargv.add(4 * argv.len() as u32);
            let ptr = match usermem::copyin_u32(&space, slot) {
                Ok(p) => p,
                Err(e) => return e.errno(),
            };
            if ptr == 0 {
                break;
            }
            if bogus_user_pointer(ptr) {
                return Errno::Efault;
            }
            match usermem::copyinstr(&space, VirtualAddress::new(ptr), ARG_MAX) {
                Ok(s) => argv.push(s),
                Err(e) => return e.errno(),
            }
        }
    }

    loader::runprogram2(&progname, &argv).errno()
}

/// waitpid: wait for a direct child, copy its encoded status out, and
/// return its PID.
pub fn sys_waitpid(pid: i32, ustatus: VirtualAddress, options: i32) -> Result<i32, Errno> {
    let (pid, status) = process::wait::sys_waitpid(pid, options).map_err(|e| e.errno())?;

    let proc = current().ok_or(Errno::Efault)?;
    let space = proc.addrspace().ok_or(Errno::Efault)?;
    usermem::copyout_u32(&space, status as u32, ustatus).map_err(|e| e.errno())?;
    Ok(pid)
}

/// _exit. Never returns.
pub fn sys_exit(code: i32) -> ! {
    process::exit::sys_exit(code)
}
