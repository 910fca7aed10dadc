//! System-call interface.
//!
//! The dispatcher decodes the machine's calling convention: syscall
//! number in v0, arguments in a0..a3 (lseek's 64-bit position rides the
//! a2/a3 pair and its whence lives on the user stack), and reports
//! results the way user code expects: a3 = 0 with the return value in
//! v0 on success, a3 = 1 with the errno in v0 on failure. Either way
//! the epc is advanced past the syscall instruction.

#![allow(dead_code)]

pub mod filesystem;
pub mod memory;
pub mod process;

use crate::error::Errno;
use crate::machine::trapframe::Trapframe;
use crate::mm::VirtualAddress;

/// System call numbers (the user-visible ABI).
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Fork = 0,
    Execv = 2,
    Exit = 3,
    Waitpid = 4,
    Getpid = 5,
    Sbrk = 17,
    Open = 45,
    Dup2 = 48,
    Close = 49,
    Read = 50,
    Write = 55,
    Lseek = 59,
}

impl TryFrom<usize> for Syscall {
    type Error = ();

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Syscall::Fork),
            2 => Ok(Syscall::Execv),
            3 => Ok(Syscall::Exit),
            4 => Ok(Syscall::Waitpid),
            5 => Ok(Syscall::Getpid),
            17 => Ok(Syscall::Sbrk),
            45 => Ok(Syscall::Open),
            48 => Ok(Syscall::Dup2),
            49 => Ok(Syscall::Close),
            50 => Ok(Syscall::Read),
            55 => Ok(Syscall::Write),
            59 => Ok(Syscall::Lseek),
            _ => Err(()),
        }
    }
}

/// Successful syscall result widths.
enum SyscallReturn {
    Val32(u32),
    Val64(i64),
}

/// Entry point from the trap path. Decodes, dispatches, and writes the
/// result back into the trap frame.
pub fn mips_syscall(tf: &mut Trapframe) {
    let (a0, a1, a2, a3) = (tf.tf_a0, tf.tf_a1, tf.tf_a2, tf.tf_a3);

    let result: Result<SyscallReturn, Errno> = match Syscall::try_from(tf.tf_v0 as usize) {
        Err(()) => {
            log::warn!("[SYSCALL] unknown syscall {}", tf.tf_v0);
            Err(Errno::Enosys)
        }
        Ok(Syscall::Fork) => {
            // The child resumes from a copy of this frame.
            let snapshot = *tf;
            process::sys_fork(&snapshot).map(|pid| SyscallReturn::Val32(pid as u32))
        }
        Ok(Syscall::Execv) => {
            // Returns only on failure.
            Err(process::sys_execv(VirtualAddress::new(a0), VirtualAddress::new(a1)))
        }
        Ok(Syscall::Exit) => process::sys_exit(a0 as i32),
        Ok(Syscall::Waitpid) => {
            process::sys_waitpid(a0 as i32, VirtualAddress::new(a1), a2 as i32)
                .map(|pid| SyscallReturn::Val32(pid as u32))
        }
        Ok(Syscall::Getpid) => Ok(SyscallReturn::Val32(process::sys_getpid() as u32)),
        Ok(Syscall::Sbrk) => {
            memory::sys_sbrk(a0 as i32).map(|brk| SyscallReturn::Val32(brk as u32))
        }
        Ok(Syscall::Open) => filesystem::sys_open(VirtualAddress::new(a0), a1, a2)
            .map(|fd| SyscallReturn::Val32(fd as u32)),
        Ok(Syscall::Dup2) => filesystem::sys_dup2(a0 as i32, a1 as i32)
            .map(|fd| SyscallReturn::Val32(fd as u32)),
        Ok(Syscall::Close) => {
            filesystem::sys_close(a0 as i32).map(|()| SyscallReturn::Val32(0))
        }
        Ok(Syscall::Read) => {
            filesystem::sys_read(a0 as i32, VirtualAddress::new(a1), a2 as usize)
                .map(|n| SyscallReturn::Val32(n as u32))
        }
        Ok(Syscall::Write) => {
            filesystem::sys_write(a0 as i32, VirtualAddress::new(a1), a2 as usize)
                .map(|n| SyscallReturn::Val32(n as u32))
        }
        Ok(Syscall::Lseek) => {
            // 64-bit position in the a2/a3 register pair; whence is the
            // fourth argument, spilled to the user stack.
            let pos = ((a2 as i64) << 32) | a3 as i64;
            filesystem::sys_lseek_from_stack(a0 as i32, pos, VirtualAddress::new(tf.tf_sp + 16))
                .map(SyscallReturn::Val64)
        }
    };

    match result {
        Ok(SyscallReturn::Val32(v)) => tf.syscall_succeed(v),
        Ok(SyscallReturn::Val64(v)) => tf.syscall_succeed64(v),
        Err(errno) => tf.syscall_fail(errno.as_i32()),
    }
}
